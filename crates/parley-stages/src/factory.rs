//! Wires the production voice chain for one session:
//! transport-in → speech-to-text → text-reasoner → text-to-speech → transport-out.

use std::sync::Arc;

use tracing::{debug, warn};

use parley_core::config::Config;
use parley_core::session::SessionParams;
use parley_pipeline::{
    endpoint, Pipeline, PipelineConfig, PipelineFactory, Stage, Transport, ValidationError,
};

use crate::reasoning::{OpenAiChat, TextReasoner};
use crate::stt::{HttpTranscriber, SpeechToText, UtteranceSegmenter};
use crate::tts::{ElevenLabsSynthesizer, TextToSpeech};

/// Builds STT → reasoning → TTS pipelines from the loaded configuration.
///
/// One `reqwest::Client` is shared by every backend of every session.
pub struct VoicePipelineFactory {
    config: Arc<Config>,
    client: reqwest::Client,
}

impl VoicePipelineFactory {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: Arc<Config>, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

/// A configured key wins; the session's inference token is the fallback.
fn backend_key(configured: Option<String>, params: &SessionParams, backend: &str) -> Option<String> {
    if configured.is_some() {
        return configured;
    }
    let token = params.api_token.trim();
    if token.is_empty() {
        warn!(
            session_id = %params.session_id,
            backend,
            "No API key configured and no session api token, requests will fail"
        );
        None
    } else {
        Some(token.to_string())
    }
}

impl PipelineFactory for VoicePipelineFactory {
    fn build(
        &self,
        params: &SessionParams,
        transport: Arc<dyn Transport>,
        config: PipelineConfig,
    ) -> Result<Pipeline, ValidationError> {
        let (source, sink) = endpoint(transport);

        let transcription = self.config.transcription.clone().unwrap_or_default();
        let stt_key = backend_key(transcription.resolve_api_key(), params, "transcription");
        let transcriber = HttpTranscriber::new(self.client.clone(), &transcription, stt_key);
        let stt = SpeechToText::new(
            Arc::new(transcriber),
            UtteranceSegmenter::from_config(&transcription),
        );

        let provider = self.config.agent_provider();
        let chat_key = backend_key(
            provider.and_then(|p| p.resolve_api_key()),
            params,
            "chat",
        );
        let chat = OpenAiChat::new(
            self.client.clone(),
            provider.and_then(|p| p.base_url.as_deref()),
            chat_key,
            self.config.agent_model(),
        )
        .with_limits(self.config.max_tokens(), self.config.temperature());
        let reasoner = TextReasoner::new(
            Arc::new(chat),
            self.config.system_prompt(),
            self.config.max_history(),
        );

        let tts_config = self.config.tts.clone().unwrap_or_default();
        let tts_key = backend_key(tts_config.resolve_api_key(), params, "tts");
        let synthesizer = ElevenLabsSynthesizer::new(self.client.clone(), &tts_config, tts_key);
        let tts = TextToSpeech::new(Arc::new(synthesizer));

        debug!(session_id = %params.session_id, "Building voice pipeline");
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(stt),
            Box::new(reasoner),
            Box::new(tts),
            Box::new(sink),
        ];
        Pipeline::build(Box::new(source), stages, config)
    }
}

#[cfg(test)]
mod tests {
    use parley_core::frame::FrameKind;
    use parley_pipeline::LoopbackTransport;

    use super::*;

    fn params(api_token: &str) -> SessionParams {
        SessionParams {
            session_id: "s1".into(),
            meeting_id: "m1".into(),
            auth_token: "tok".into(),
            callback_address: "bridge.local".into(),
            account_id: "acct".into(),
            api_token: api_token.into(),
        }
    }

    #[test]
    fn test_voice_chain_shape() {
        let factory = VoicePipelineFactory::new(Arc::new(Config::default()));
        let (transport, _remote) = LoopbackTransport::pair("t1");

        let pipeline = factory
            .build(&params("key"), transport, PipelineConfig::default())
            .unwrap();

        assert_eq!(pipeline.len(), 5);
        assert_eq!(
            pipeline.stage_names(),
            [
                "transport-in:t1",
                "speech-to-text",
                "text-reasoner",
                "text-to-speech",
                "transport-out:t1",
            ]
        );
        assert_eq!(pipeline.position_accepting(FrameKind::Text), Some(2));
    }

    #[test]
    fn test_backend_key_fallback() {
        assert_eq!(
            backend_key(Some("configured".into()), &params("session"), "chat").as_deref(),
            Some("configured")
        );
        assert_eq!(
            backend_key(None, &params(" session "), "chat").as_deref(),
            Some("session")
        );
        assert_eq!(backend_key(None, &params("  "), "chat"), None);
    }
}
