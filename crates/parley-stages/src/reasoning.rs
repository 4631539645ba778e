//! Text reasoning stage: sends each transcript to a chat model and speaks the
//! reply back sentence by sentence.
//!
//! Implements streaming chat completions against OpenAI's
//! `/v1/chat/completions` API (and compatible servers).

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use parley_core::frame::{Frame, FrameKind};
use parley_pipeline::{Emitter, Stage, StageDescriptor, StageError};

use crate::sentence::SentenceBuffer;
use crate::sse::parse_sse_response;

const OPENAI_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Stream of reply text deltas.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<DeltaStream>;
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// What one SSE `data:` payload contributes to the reply.
#[derive(Debug, PartialEq, Eq)]
enum ChunkEvent {
    Delta(String),
    Done,
    Skip,
}

fn parse_chunk(data: &str) -> ChunkEvent {
    let data = data.trim();
    // OpenAI terminates with "data: [DONE]"
    if data == "[DONE]" {
        return ChunkEvent::Done;
    }
    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            trace!(%e, data, "Failed to parse OpenAI chunk");
            return ChunkEvent::Skip;
        }
    };
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map_or(ChunkEvent::Skip, ChunkEvent::Delta)
}

/// OpenAI-compatible streaming chat client.
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: Option<f64>,
}

impl OpenAiChat {
    pub fn new(
        client: reqwest::Client,
        base_url: Option<&str>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.into(),
            max_tokens: 512,
            temperature: None,
        }
    }

    pub fn with_limits(mut self, max_tokens: u32, temperature: Option<f64>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ChatBackend for OpenAiChat {
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<DeltaStream> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No chat API key configured"))?;

        let body = OpenAiRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            stream: true,
            temperature: self.temperature,
        };

        debug!(model = %self.model, base_url = %self.base_url, turns = messages.len(), "Streaming chat completion");

        let response = self
            .client
            .post(self.endpoint())
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {body}");
        }

        let deltas = parse_sse_response(response)
            .map(|event| event.map(|e| parse_chunk(&e.data)))
            .take_while(|event| !matches!(event, Ok(ChunkEvent::Done)))
            .filter_map(|event| match event {
                Ok(ChunkEvent::Delta(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            });

        Ok(Box::pin(deltas))
    }
}

/// Text in, text out: one chat turn per inbound text, one frame per sentence.
pub struct TextReasoner<B: ChatBackend> {
    backend: Arc<B>,
    system_prompt: String,
    history: VecDeque<ChatMessage>,
    max_history: usize,
}

impl<B: ChatBackend> TextReasoner<B> {
    pub fn new(backend: Arc<B>, system_prompt: impl Into<String>, max_history: usize) -> Self {
        Self {
            backend,
            system_prompt: system_prompt.into(),
            history: VecDeque::new(),
            max_history: max_history.max(2),
        }
    }

    fn request(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(ChatMessage::new(ChatRole::System, self.system_prompt.clone()));
        messages.extend(self.history.iter().cloned());
        messages
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
        // Context always opens on a user turn.
        while self
            .history
            .front()
            .is_some_and(|m| m.role != ChatRole::User)
        {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.history.iter()
    }
}

#[async_trait]
impl<B: ChatBackend> Stage for TextReasoner<B> {
    fn name(&self) -> &str {
        "text-reasoner"
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::transform(FrameKind::Text, FrameKind::Text)
    }

    async fn on_text(&mut self, text: String, emit: &Emitter) -> Result<(), StageError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.history.push_back(ChatMessage::new(ChatRole::User, text));

        let mut stream = match self.backend.stream_chat(&self.request()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.history.pop_back();
                return Err(e.into());
            }
        };

        let mut sentences = SentenceBuffer::new();
        let mut reply = String::new();
        let mut emitted = 0usize;

        while let Some(delta) = stream.next().await {
            let delta = match delta {
                Ok(delta) => delta,
                Err(e) => {
                    // Keep what was already spoken so the context matches.
                    if reply.is_empty() {
                        self.history.pop_back();
                    } else {
                        self.history
                            .push_back(ChatMessage::new(ChatRole::Assistant, reply));
                        self.trim_history();
                    }
                    return Err(e.into());
                }
            };
            reply.push_str(&delta);
            for sentence in sentences.push(&delta) {
                emit.emit(Frame::Text(sentence));
                emitted += 1;
            }
        }
        if let Some(tail) = sentences.flush() {
            emit.emit(Frame::Text(tail));
            emitted += 1;
        }

        if reply.trim().is_empty() {
            debug!("Empty reply, no output this turn");
            self.history.pop_back();
            return Ok(());
        }
        debug!(sentences = emitted, chars = reply.len(), "Reply streamed");
        self.history
            .push_back(ChatMessage::new(ChatRole::Assistant, reply.trim()));
        self.trim_history();
        Ok(())
    }
}
