//! Stage abstraction: the unit of work in a pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use parley_core::frame::{Frame, FrameKind};

use crate::error::StageError;

/// Declares which frame kinds a stage accepts and which it may emit.
///
/// Only used to validate a chain at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub accepts: Vec<FrameKind>,
    pub produces: Vec<FrameKind>,
}

impl StageDescriptor {
    pub fn new(accepts: Vec<FrameKind>, produces: Vec<FrameKind>) -> Self {
        Self { accepts, produces }
    }

    /// One kind in, one kind out.
    pub fn transform(input: FrameKind, output: FrameKind) -> Self {
        Self::new(vec![input], vec![output])
    }

    /// Accepts nothing, produces `kind`.
    pub fn source(kind: FrameKind) -> Self {
        Self::new(Vec::new(), vec![kind])
    }

    /// Accepts `kinds`, produces nothing.
    pub fn sink(kinds: Vec<FrameKind>) -> Self {
        Self::new(kinds, Vec::new())
    }

    pub fn accepts(&self, kind: FrameKind) -> bool {
        self.accepts.contains(&kind)
    }

    /// First produced kind that `next` would not accept, if any.
    pub fn mismatch_with(&self, next: &StageDescriptor) -> Option<FrameKind> {
        self.produces.iter().copied().find(|kind| !next.accepts(*kind))
    }
}

/// A stage's input queue plus the count of frames waiting in it.
#[derive(Clone)]
pub(crate) struct Inbox {
    tx: mpsc::UnboundedSender<Frame>,
    depth: Arc<AtomicUsize>,
}

impl Inbox {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Frame>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                depth: depth.clone(),
            },
            rx,
            depth,
        )
    }

    /// Queue a frame. Hands the frame back if the receiving stage is gone.
    pub(crate) fn push(&self, frame: Frame) -> Result<(), Frame> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(frame).map_err(|e| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            e.0
        })
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

/// Handle a stage uses to hand frames to the next stage.
///
/// Emission never blocks: frames are queued for the downstream task in call
/// order. A stage may emit zero, one, or many frames per input.
#[derive(Clone)]
pub struct Emitter {
    downstream: Option<Inbox>,
}

impl Emitter {
    pub(crate) fn to(inbox: Inbox) -> Self {
        Self {
            downstream: Some(inbox),
        }
    }

    /// Emitter with nowhere to go; used for the sink.
    pub fn detached() -> Self {
        Self { downstream: None }
    }

    /// Emitter feeding a fresh channel, for driving a stage by hand.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (inbox, rx, _depth) = Inbox::new();
        (Self::to(inbox), rx)
    }

    /// Hand a frame downstream. Returns false if it was discarded.
    pub fn emit(&self, frame: Frame) -> bool {
        let Some(inbox) = &self.downstream else {
            debug!(kind = %frame.kind(), "No downstream stage, frame discarded");
            return false;
        };
        match inbox.push(frame) {
            Ok(()) => true,
            Err(frame) => {
                debug!(kind = %frame.kind(), "Downstream stage stopped, frame discarded");
                false
            }
        }
    }
}

/// A transformation step.
///
/// One entry point per frame kind. The pipeline calls a stage's entry points
/// from a single task, one frame at a time, in arrival order; a stage may keep
/// buffers across calls. Entry points for kinds the stage does not accept
/// default to [`StageError::UnsupportedKind`].
#[async_trait]
pub trait Stage: Send + 'static {
    fn name(&self) -> &str;

    fn descriptor(&self) -> StageDescriptor;

    async fn on_audio(&mut self, _audio: Bytes, _emit: &Emitter) -> Result<(), StageError> {
        Err(StageError::UnsupportedKind(FrameKind::Audio))
    }

    async fn on_text(&mut self, _text: String, _emit: &Emitter) -> Result<(), StageError> {
        Err(StageError::UnsupportedKind(FrameKind::Text))
    }

    /// Release resources. Runs once after the stage stops receiving frames.
    async fn shutdown(&mut self) {}
}

/// Route a frame to the matching entry point.
pub(crate) async fn dispatch(
    stage: &mut dyn Stage,
    frame: Frame,
    emit: &Emitter,
) -> Result<(), StageError> {
    match frame {
        Frame::Audio(audio) => stage.on_audio(audio, emit).await,
        Frame::Text(text) => stage.on_text(text, emit).await,
    }
}

/// Head of a pipeline: produces frames from outside.
#[async_trait]
pub trait Source: Send + 'static {
    fn name(&self) -> &str;

    fn descriptor(&self) -> StageDescriptor;

    /// Next inbound frame; `None` once the feed has ended.
    ///
    /// Must be cancel-safe: the pipeline races it against its stop signal.
    async fn next_frame(&mut self) -> Option<Result<Frame, StageError>>;
}
