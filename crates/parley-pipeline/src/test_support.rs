//! Scripted sources, stages, and reporters shared by the crate's tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use parley_core::frame::{Frame, FrameKind};

use crate::error::{ErrorReporter, StageError};
use crate::stage::{Emitter, Source, Stage, StageDescriptor};

/// Source replaying a fixed list of frames, then ending.
pub struct VecSource {
    kind: FrameKind,
    frames: VecDeque<Frame>,
}

impl VecSource {
    pub fn text(items: Vec<&str>) -> Box<Self> {
        Box::new(Self {
            kind: FrameKind::Text,
            frames: items.into_iter().map(Frame::text).collect(),
        })
    }

    pub fn audio(items: Vec<Vec<u8>>) -> Box<Self> {
        Box::new(Self {
            kind: FrameKind::Audio,
            frames: items.into_iter().map(Frame::audio).collect(),
        })
    }
}

#[async_trait]
impl Source for VecSource {
    fn name(&self) -> &str {
        "vec-source"
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::source(self.kind)
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, StageError>> {
        self.frames.pop_front().map(Ok)
    }
}

/// Source fed by hand through a channel; stays open while the sender lives.
pub struct ChannelSource {
    kind: FrameKind,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl ChannelSource {
    pub fn text() -> (Box<Self>, mpsc::UnboundedSender<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            kind: FrameKind::Text,
            rx,
        };
        (Box::new(source), tx)
    }
}

#[async_trait]
impl Source for ChannelSource {
    fn name(&self) -> &str {
        "channel-source"
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::source(self.kind)
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, StageError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Sink forwarding every frame it receives to a test channel.
pub struct Collect {
    accepts: Vec<FrameKind>,
    tx: mpsc::UnboundedSender<Frame>,
}

impl Collect {
    pub fn text() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            accepts: vec![FrameKind::Text],
            tx,
        };
        (sink, rx)
    }

    fn take(&self, frame: Frame) -> Result<(), StageError> {
        if !self.accepts.contains(&frame.kind()) {
            return Err(StageError::UnsupportedKind(frame.kind()));
        }
        let _ = self.tx.send(frame);
        Ok(())
    }
}

#[async_trait]
impl Stage for Collect {
    fn name(&self) -> &str {
        "collect"
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::sink(self.accepts.clone())
    }

    async fn on_audio(&mut self, audio: Bytes, _emit: &Emitter) -> Result<(), StageError> {
        self.take(Frame::Audio(audio))
    }

    async fn on_text(&mut self, text: String, _emit: &Emitter) -> Result<(), StageError> {
        self.take(Frame::Text(text))
    }
}

/// Text stage emitting `counts[n]` frames for its n-th input, tagged `{text}#{i}`.
pub struct FanOut {
    counts: Vec<usize>,
    seen: usize,
}

impl FanOut {
    pub fn new(counts: Vec<usize>) -> Self {
        Self { counts, seen: 0 }
    }
}

#[async_trait]
impl Stage for FanOut {
    fn name(&self) -> &str {
        "fan-out"
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::transform(FrameKind::Text, FrameKind::Text)
    }

    async fn on_text(&mut self, text: String, emit: &Emitter) -> Result<(), StageError> {
        let count = self.counts.get(self.seen).copied().unwrap_or(1);
        self.seen += 1;
        for i in 0..count {
            emit.emit(Frame::text(format!("{text}#{i}")));
        }
        Ok(())
    }
}

/// Text pass-through that fails on one specific input.
pub struct FailOn {
    bad: String,
}

impl FailOn {
    pub fn new(bad: &str) -> Self {
        Self { bad: bad.into() }
    }
}

#[async_trait]
impl Stage for FailOn {
    fn name(&self) -> &str {
        "fail-on"
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::transform(FrameKind::Text, FrameKind::Text)
    }

    async fn on_text(&mut self, text: String, emit: &Emitter) -> Result<(), StageError> {
        if text == self.bad {
            return Err(anyhow::anyhow!("refusing frame '{text}'").into());
        }
        emit.emit(Frame::Text(text));
        Ok(())
    }
}

/// Text pass-through that blocks on its first frame until the gate fires.
pub struct Stuck {
    gate: Option<oneshot::Receiver<()>>,
}

impl Stuck {
    pub fn until(gate: oneshot::Receiver<()>) -> Self {
        Self { gate: Some(gate) }
    }
}

#[async_trait]
impl Stage for Stuck {
    fn name(&self) -> &str {
        "stuck"
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::transform(FrameKind::Text, FrameKind::Text)
    }

    async fn on_text(&mut self, text: String, emit: &Emitter) -> Result<(), StageError> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.await;
        }
        emit.emit(Frame::Text(text));
        Ok(())
    }
}

/// Audio stage mapping every audio frame to a fixed transcript.
pub struct FakeStt {
    transcript: String,
}

impl FakeStt {
    pub fn new(transcript: &str) -> Self {
        Self {
            transcript: transcript.into(),
        }
    }
}

#[async_trait]
impl Stage for FakeStt {
    fn name(&self) -> &str {
        "fake-stt"
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::transform(FrameKind::Audio, FrameKind::Text)
    }

    async fn on_audio(&mut self, _audio: Bytes, emit: &Emitter) -> Result<(), StageError> {
        emit.emit(Frame::text(self.transcript.clone()));
        Ok(())
    }
}

/// Text stage answering every input with `reply: {input}`.
pub struct FakeReasoner;

#[async_trait]
impl Stage for FakeReasoner {
    fn name(&self) -> &str {
        "fake-reasoner"
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::transform(FrameKind::Text, FrameKind::Text)
    }

    async fn on_text(&mut self, text: String, emit: &Emitter) -> Result<(), StageError> {
        emit.emit(Frame::text(format!("reply: {text}")));
        Ok(())
    }
}

/// Text-to-audio stage encoding the text bytes as the "audio" payload.
pub struct FakeTts;

#[async_trait]
impl Stage for FakeTts {
    fn name(&self) -> &str {
        "fake-tts"
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::transform(FrameKind::Text, FrameKind::Audio)
    }

    async fn on_text(&mut self, text: String, emit: &Emitter) -> Result<(), StageError> {
        emit.emit(Frame::audio(text.into_bytes()));
        Ok(())
    }
}

/// Reporter recording `(stage, message)` pairs.
#[derive(Default)]
pub struct CollectingReporter {
    errors: Mutex<Vec<(String, String)>>,
}

impl CollectingReporter {
    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, stage: &str, error: &StageError) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push((stage.to_string(), error.to_string()));
        }
    }
}

/// Receive exactly `n` frames, panicking if they do not arrive within 2s.
pub async fn collected(rx: &mut mpsc::UnboundedReceiver<Frame>, n: usize) -> Vec<Frame> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(frame)) => out.push(frame),
            Ok(None) => panic!("collector closed after {} of {n} frames", out.len()),
            Err(_) => panic!("timed out after {} of {n} frames", out.len()),
        }
    }
    out
}
