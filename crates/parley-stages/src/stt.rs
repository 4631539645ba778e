//! Speech-to-text stage: segments inbound audio into utterances and
//! transcribes each one.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use parley_core::config::{SegmentationMode, TranscriptionConfig};
use parley_core::frame::{Frame, FrameKind, PcmAssembler};
use parley_pipeline::{Emitter, Stage, StageDescriptor, StageError};

use crate::vad::{FRAME_MS, FRAME_SAMPLES, SAMPLE_RATE, VadEvent, VoiceActivityDetector};

const GROQ_TRANSCRIPTION_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const OPENAI_TRANSCRIPTION_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEFAULT_STT_MODEL: &str = "whisper-large-v3-turbo";
const DEFAULT_VAD_THRESHOLD: f64 = 300.0;
const DEFAULT_SILENCE_MS: u64 = 300;
const DEFAULT_MAX_UTTERANCE_MS: u64 = 30_000;

/// Wrap raw 16-bit PCM in a WAV container.
pub fn pcm_to_wav(pcm: &[i16], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let data_len = pcm.len() * 2;
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let file_size = 36 + data_len as u32;

    let mut wav = Vec::with_capacity(44 + data_len);

    // RIFF header
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&file_size.to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    // fmt chunk
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    // data chunk
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&(data_len as u32).to_le_bytes());
    for &sample in pcm {
        wav.extend_from_slice(&sample.to_le_bytes());
    }

    wav
}

/// Transcription endpoint for the configured provider; `base_url` wins.
pub fn provider_url(config: &TranscriptionConfig) -> String {
    if let Some(base) = &config.base_url {
        return format!("{}/audio/transcriptions", base.trim_end_matches('/'));
    }
    match config.provider.as_str() {
        "openai" => OPENAI_TRANSCRIPTION_URL.into(),
        _ => GROQ_TRANSCRIPTION_URL.into(),
    }
}

/// One request per utterance; returns the transcript (possibly empty).
#[async_trait]
pub trait Transcriber: Send + Sync + 'static {
    async fn transcribe(&self, pcm: &[i16]) -> Result<String>;
}

/// Whisper-compatible `/audio/transcriptions` client (Groq, OpenAI).
pub struct HttpTranscriber {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpTranscriber {
    pub fn new(client: reqwest::Client, config: &TranscriptionConfig, api_key: Option<String>) -> Self {
        Self {
            client,
            url: provider_url(config),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_STT_MODEL.into()),
            api_key,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, pcm: &[i16]) -> Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No transcription API key configured"))?;

        let wav_data = pcm_to_wav(pcm, SAMPLE_RATE, 1, 16);
        debug!(url = %self.url, model = %self.model, wav_bytes = wav_data.len(), "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {api_key}"))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Transcription API error {status}: {body}");
        }

        let text = resp.text().await?;
        Ok(text.trim().to_string())
    }
}

/// Splits a continuous PCM feed into utterances.
pub struct UtteranceSegmenter {
    mode: SegmentationMode,
    vad: VoiceActivityDetector,
    /// Samples not yet filling a whole analysis frame.
    pending: Vec<i16>,
    utterance: Vec<i16>,
    max_samples: usize,
}

impl UtteranceSegmenter {
    pub fn new(mode: SegmentationMode, vad: VoiceActivityDetector, max_utterance_ms: u64) -> Self {
        let max_samples = (max_utterance_ms / FRAME_MS).max(1) as usize * FRAME_SAMPLES;
        Self {
            mode,
            vad,
            pending: Vec::new(),
            utterance: Vec::new(),
            max_samples,
        }
    }

    pub fn from_config(config: &TranscriptionConfig) -> Self {
        let vad = VoiceActivityDetector::with_silence_ms(
            config.vad_threshold.unwrap_or(DEFAULT_VAD_THRESHOLD),
            config.silence_ms.unwrap_or(DEFAULT_SILENCE_MS),
        );
        Self::new(
            config.segmentation,
            vad,
            config.max_utterance_ms.unwrap_or(DEFAULT_MAX_UTTERANCE_MS),
        )
    }

    /// Feed samples; returns every utterance they completed.
    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        match self.mode {
            SegmentationMode::PerFrame if samples.is_empty() => Vec::new(),
            SegmentationMode::PerFrame => vec![samples.to_vec()],
            SegmentationMode::Vad => self.push_vad(samples),
        }
    }

    fn push_vad(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);
        let mut done = Vec::new();
        let mut offset = 0;

        while self.pending.len() - offset >= FRAME_SAMPLES {
            let frame = &self.pending[offset..offset + FRAME_SAMPLES];
            offset += FRAME_SAMPLES;

            match self.vad.process_frame(frame) {
                Some(VadEvent::SpeechStarted) => {
                    self.utterance.clear();
                    self.utterance.extend_from_slice(frame);
                }
                Some(VadEvent::SpeechEnded) => {
                    self.utterance.extend_from_slice(frame);
                    done.push(std::mem::take(&mut self.utterance));
                }
                None if self.vad.is_active() => self.utterance.extend_from_slice(frame),
                None => {}
            }

            if self.utterance.len() >= self.max_samples {
                debug!(samples = self.utterance.len(), "Utterance hit max length, flushing");
                self.vad.reset();
                done.push(std::mem::take(&mut self.utterance));
            }
        }

        self.pending.drain(..offset);
        done
    }

    /// Drop any partial utterance.
    pub fn reset(&mut self) {
        self.vad.reset();
        self.pending.clear();
        self.utterance.clear();
    }

    /// Samples buffered towards the current utterance.
    pub fn buffered(&self) -> usize {
        self.utterance.len()
    }
}

/// Audio in, text out.
pub struct SpeechToText<T: Transcriber> {
    transcriber: Arc<T>,
    segmenter: UtteranceSegmenter,
    pcm: PcmAssembler,
}

impl<T: Transcriber> SpeechToText<T> {
    pub fn new(transcriber: Arc<T>, segmenter: UtteranceSegmenter) -> Self {
        Self {
            transcriber,
            segmenter,
            pcm: PcmAssembler::new(),
        }
    }
}

#[async_trait]
impl<T: Transcriber> Stage for SpeechToText<T> {
    fn name(&self) -> &str {
        "speech-to-text"
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::transform(FrameKind::Audio, FrameKind::Text)
    }

    async fn on_audio(&mut self, audio: Bytes, emit: &Emitter) -> Result<(), StageError> {
        let samples = self.pcm.push(&audio);
        let mut failure = None;

        for utterance in self.segmenter.push(&samples) {
            let duration_ms = utterance.len() as u64 * 1000 / SAMPLE_RATE as u64;
            match self.transcriber.transcribe(&utterance).await {
                Ok(text) if text.trim().is_empty() => {
                    debug!(duration_ms, "Empty transcript, no output this turn");
                }
                Ok(text) => {
                    debug!(duration_ms, chars = text.len(), "Utterance transcribed");
                    emit.emit(Frame::Text(text.trim().to_string()));
                }
                Err(e) => failure = Some(e),
            }
        }

        match failure {
            Some(e) => Err(StageError::Backend(e)),
            None => Ok(()),
        }
    }

    async fn shutdown(&mut self) {
        if self.segmenter.buffered() > 0 {
            debug!(samples = self.segmenter.buffered(), "Discarding partial utterance");
        }
        self.segmenter.reset();
        self.pcm.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use parley_core::frame::pcm_to_bytes;

    use super::*;

    /// Transcriber returning scripted results and recording utterance lengths.
    struct Scripted {
        replies: Mutex<Vec<Result<String>>>,
        seen: Mutex<Vec<Vec<i16>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<usize> {
            self.seen.lock().unwrap().iter().map(Vec::len).collect()
        }

        fn heard(&self) -> Vec<Vec<i16>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transcriber for Scripted {
        async fn transcribe(&self, pcm: &[i16]) -> Result<String> {
            self.seen.lock().unwrap().push(pcm.to_vec());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Ok(String::new());
            }
            replies.remove(0)
        }
    }

    fn speech(frames: usize) -> Vec<i16> {
        vec![1000i16; frames * FRAME_SAMPLES]
    }

    fn silence(frames: usize) -> Vec<i16> {
        vec![0i16; frames * FRAME_SAMPLES]
    }

    fn vad_segmenter(silent_frames: usize, max_ms: u64) -> UtteranceSegmenter {
        UtteranceSegmenter::new(
            SegmentationMode::Vad,
            VoiceActivityDetector::new(300.0, silent_frames),
            max_ms,
        )
    }

    #[test]
    fn test_wav_header_generation() {
        let pcm = vec![0i16; 16000];
        let wav = pcm_to_wav(&pcm, 16000, 1, 16);

        assert_eq!(wav.len(), 44 + 16000 * 2);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");

        let sr = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(sr, 16000);
    }

    #[test]
    fn test_provider_url_selection() {
        let groq = TranscriptionConfig::default();
        assert!(provider_url(&groq).contains("groq.com"));

        let openai = TranscriptionConfig {
            provider: "openai".into(),
            ..TranscriptionConfig::default()
        };
        assert!(provider_url(&openai).contains("openai.com"));

        let custom = TranscriptionConfig {
            base_url: Some("http://localhost:9000/v1/".into()),
            ..TranscriptionConfig::default()
        };
        assert_eq!(
            provider_url(&custom),
            "http://localhost:9000/v1/audio/transcriptions"
        );
    }

    #[test]
    fn test_vad_emits_one_utterance_per_speech_run() {
        let mut seg = vad_segmenter(3, 30_000);

        assert!(seg.push(&silence(5)).is_empty());
        assert!(seg.push(&speech(10)).is_empty());
        let done = seg.push(&silence(3));
        assert_eq!(done.len(), 1);
        // Ten speech frames plus the three closing silent frames.
        assert_eq!(done[0].len(), 13 * FRAME_SAMPLES);

        assert!(seg.push(&speech(4)).is_empty());
        let done = seg.push(&silence(5));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].len(), 7 * FRAME_SAMPLES);
    }

    #[test]
    fn test_vad_handles_partial_frames() {
        let mut seg = vad_segmenter(2, 30_000);
        let mut feed = speech(3);
        feed.extend(silence(2));

        // Deliver in awkward 100-sample slices.
        let mut done = Vec::new();
        for chunk in feed.chunks(100) {
            done.extend(seg.push(chunk));
        }
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].len(), 5 * FRAME_SAMPLES);
    }

    #[test]
    fn test_vad_forces_flush_at_max_length() {
        // 100ms cap = five frames.
        let mut seg = vad_segmenter(3, 100);
        let done = seg.push(&speech(12));
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|u| u.len() == 5 * FRAME_SAMPLES));
    }

    #[test]
    fn test_per_frame_mode() {
        let mut seg = UtteranceSegmenter::new(
            SegmentationMode::PerFrame,
            VoiceActivityDetector::default_16khz(),
            30_000,
        );
        assert_eq!(seg.push(&[1, 2, 3]), vec![vec![1, 2, 3]]);
        assert!(seg.push(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_stage_emits_transcript() {
        let transcriber = Scripted::new(vec![Ok("  hello  ".into())]);
        let mut stage = SpeechToText::new(transcriber.clone(), vad_segmenter(2, 30_000));
        let (emit, mut rx) = Emitter::channel();

        let mut pcm = speech(4);
        pcm.extend(silence(2));
        stage.on_audio(pcm_to_bytes(&pcm), &emit).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), Frame::text("hello"));
        assert_eq!(transcriber.seen(), vec![6 * FRAME_SAMPLES]);
    }

    #[tokio::test]
    async fn test_empty_transcript_is_not_an_error() {
        let transcriber = Scripted::new(vec![Ok("   ".into())]);
        let seg = UtteranceSegmenter::new(
            SegmentationMode::PerFrame,
            VoiceActivityDetector::default_16khz(),
            30_000,
        );
        let mut stage = SpeechToText::new(transcriber, seg);
        let (emit, mut rx) = Emitter::channel();

        stage
            .on_audio(pcm_to_bytes(&speech(1)), &emit)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces() {
        let transcriber = Scripted::new(vec![Err(anyhow::anyhow!("503")), Ok("next".into())]);
        let seg = UtteranceSegmenter::new(
            SegmentationMode::PerFrame,
            VoiceActivityDetector::default_16khz(),
            30_000,
        );
        let mut stage = SpeechToText::new(transcriber, seg);
        let (emit, mut rx) = Emitter::channel();

        let err = stage
            .on_audio(pcm_to_bytes(&speech(1)), &emit)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Backend(_)));

        stage
            .on_audio(pcm_to_bytes(&speech(1)), &emit)
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), Frame::text("next"));
    }

    #[tokio::test]
    async fn test_sample_split_across_frames_stays_aligned() {
        let transcriber = Scripted::new(vec![]);
        let seg = UtteranceSegmenter::new(
            SegmentationMode::PerFrame,
            VoiceActivityDetector::default_16khz(),
            30_000,
        );
        let mut stage = SpeechToText::new(transcriber.clone(), seg);
        let (emit, _rx) = Emitter::channel();

        let pcm: Vec<i16> = (0..320)
            .map(|i| if i % 2 == 0 { 1000 } else { -1000 })
            .collect();
        let bytes = pcm_to_bytes(&pcm);
        stage.on_audio(bytes.slice(..321), &emit).await.unwrap();
        stage.on_audio(bytes.slice(321..), &emit).await.unwrap();

        let heard = transcriber.heard();
        assert_eq!(heard.len(), 2);
        assert_eq!(heard[0], pcm[..160]);
        assert_eq!(heard[1], pcm[160..]);
    }

    #[tokio::test]
    async fn test_missing_key_fails_request() {
        let transcriber = HttpTranscriber::new(
            reqwest::Client::new(),
            &TranscriptionConfig::default(),
            None,
        );
        let err = transcriber.transcribe(&[0; 10]).await.unwrap_err();
        assert!(err.to_string().contains("No transcription API key"));
    }
}
