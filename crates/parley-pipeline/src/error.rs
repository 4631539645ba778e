//! Error taxonomy and failure reporting for pipelines.
//!
//! - [`ValidationError`]: the stage chain is malformed; the pipeline never starts.
//! - [`LifecycleError`]: an operation arrived in the wrong state; rejected with no side effects.
//! - [`StageError`]: one frame failed inside one stage; the frame is dropped, the stage keeps going.
//! - [`TransportError`]: the live session refused a send/receive.

use thiserror::Error;
use tracing::warn;

use parley_core::frame::FrameKind;
use parley_core::session::LifecycleState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("pipeline needs a source followed by at least one stage acting as sink")]
    MissingSink,

    #[error(
        "incompatible stage chain at position {position}: '{upstream}' produces {produced} \
         but '{downstream}' accepts {accepted:?}"
    )]
    IncompatibleStageChain {
        /// Graph index of the upstream element.
        position: usize,
        upstream: String,
        downstream: String,
        produced: FrameKind,
        accepted: Vec<FrameKind>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("session already initialized (state: {0})")]
    AlreadyInitialized(LifecycleState),

    #[error("pipeline already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("session closed")]
    Closed,

    #[error("not joined to the session")]
    NotJoined,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("join failed: {0}")]
    Join(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),
}

/// Failure while one stage processed one frame.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage does not accept {0} frames")]
    UnsupportedKind(FrameKind),

    #[error("ingress queue full, frame dropped")]
    Overloaded,

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl StageError {
    /// True when the live session itself has gone away.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, StageError::Transport(TransportError::Closed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InjectError {
    #[error("pipeline is not running")]
    NotRunning,

    #[error("stage index {index} out of range (pipeline has {len} elements, source is 0)")]
    InvalidStageIndex { index: usize, len: usize },

    #[error("stage {index} does not accept {kind} frames")]
    KindNotAccepted { index: usize, kind: FrameKind },
}

/// Receives every per-frame failure a pipeline recovers from.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, stage: &str, error: &StageError);
}

/// Reporter that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, stage: &str, error: &StageError) {
        warn!(stage, error = %error, "Stage failed to process frame");
    }
}
