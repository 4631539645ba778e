//! Text-to-speech stage backed by ElevenLabs streaming synthesis.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::debug;

use parley_core::config::TtsConfig;
use parley_core::frame::{Frame, FrameKind};
use parley_pipeline::{Emitter, Stage, StageDescriptor, StageError};

const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_VOICE: &str = "Rachel";
const DEFAULT_TTS_MODEL: &str = "eleven_turbo_v2";

/// Raw 16-bit PCM, 16kHz mono.
const OUTPUT_FORMAT: &str = "pcm_16000";

/// Text to one buffer of 16kHz 16-bit mono PCM. Empty output means "nothing to say".
#[async_trait]
pub trait Synthesizer: Send + Sync + 'static {
    async fn synthesize(&self, text: &str) -> Result<Bytes>;
}

/// Build the ElevenLabs streaming TTS request URL for a given voice.
pub fn build_tts_url(base_url: &str, voice: &str) -> String {
    format!(
        "{}/v1/text-to-speech/{voice}/stream?output_format={OUTPUT_FORMAT}",
        base_url.trim_end_matches('/')
    )
}

pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl ElevenLabsSynthesizer {
    pub fn new(client: reqwest::Client, config: &TtsConfig, api_key: Option<String>) -> Self {
        let base = config.base_url.as_deref().unwrap_or(ELEVENLABS_BASE_URL);
        let voice = config.default_voice.as_deref().unwrap_or(DEFAULT_VOICE);
        Self {
            client,
            url: build_tts_url(base, voice),
            model: config
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_TTS_MODEL.into()),
            api_key,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Synthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;

        debug!(model = %self.model, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(&self.url)
            .header("xi-api-key", api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let mut audio = BytesMut::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| anyhow::anyhow!("TTS stream error: {e}"))?;
            audio.extend_from_slice(&chunk);
        }
        Ok(audio.freeze())
    }
}

/// Text in, audio out.
pub struct TextToSpeech<S: Synthesizer> {
    synthesizer: Arc<S>,
}

impl<S: Synthesizer> TextToSpeech<S> {
    pub fn new(synthesizer: Arc<S>) -> Self {
        Self { synthesizer }
    }
}

#[async_trait]
impl<S: Synthesizer> Stage for TextToSpeech<S> {
    fn name(&self) -> &str {
        "text-to-speech"
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::transform(FrameKind::Text, FrameKind::Audio)
    }

    async fn on_text(&mut self, text: String, emit: &Emitter) -> Result<(), StageError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let audio = self.synthesizer.synthesize(text).await?;
        if audio.is_empty() {
            debug!(text_len = text.len(), "Synthesizer returned no audio, silent turn");
            return Ok(());
        }
        debug!(bytes = audio.len(), "Speech synthesized");
        emit.emit(Frame::Audio(audio));
        Ok(())
    }
}
