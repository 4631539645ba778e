//! Pipeline engine: composes stream-transforming stages into one live signal path.
//!
//! A [`Pipeline`] is a linear chain: a [`Source`] at graph index 0 followed by
//! [`Stage`]s, the last of which is the sink. Each stage runs in its own task
//! and hands frames downstream through an [`Emitter`]. The
//! [`SessionController`] owns one pipeline per live session and drives its
//! `init`/`deinit` lifecycle.

pub mod controller;
pub mod error;
pub mod loopback;
pub mod pipeline;
pub mod stage;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use controller::{ControllerConfig, PipelineFactory, SessionController, SessionError};
pub use error::{
    ErrorReporter, InjectError, LifecycleError, StageError, TracingReporter, TransportError,
    ValidationError,
};
pub use loopback::{LoopbackConnector, LoopbackRemote, LoopbackTransport};
pub use pipeline::{Injector, Pipeline, PipelineConfig};
pub use stage::{Emitter, Source, Stage, StageDescriptor};
pub use transport::{
    MembershipHandler, MembershipHub, SubscriptionId, Transport, TransportConnector,
    TransportSink, TransportSource, endpoint,
};
