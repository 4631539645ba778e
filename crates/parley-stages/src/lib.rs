//! Backend stages for the voice pipeline: speech-to-text, text reasoning,
//! text-to-speech, and the factory wiring them between a session's transport
//! roles.

pub mod factory;
pub mod reasoning;
pub mod sentence;
pub mod sse;
pub mod stt;
pub mod tts;
pub mod vad;

pub use factory::VoicePipelineFactory;
pub use reasoning::{ChatBackend, ChatMessage, ChatRole, OpenAiChat, TextReasoner};
pub use stt::{HttpTranscriber, SpeechToText, Transcriber, UtteranceSegmenter};
pub use tts::{ElevenLabsSynthesizer, Synthesizer, TextToSpeech};
pub use vad::{VadEvent, VoiceActivityDetector};
