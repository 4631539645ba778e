//! Duplex transport endpoint: one live session connection acting as both the
//! head and the tail of a pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use parley_core::frame::{Frame, FrameKind};
use parley_core::session::SessionParams;
use parley_core::types::{MembershipEvent, MembershipEventKind, Participant};

use crate::error::{StageError, TransportError};
use crate::stage::{Emitter, Source, Stage, StageDescriptor};

/// Callback for membership events. Runs on the transport's delivery path and
/// must not block.
pub type MembershipHandler = Arc<dyn Fn(&MembershipEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A live external session.
///
/// `recv` feeds the pipeline's source role and `send` its sink role; both share
/// this one object. Implementations must tolerate `recv` and `send` running
/// concurrently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identifier of the underlying connection, for logs.
    fn id(&self) -> &str;

    async fn join(&self) -> Result<(), TransportError>;

    async fn leave(&self) -> Result<(), TransportError>;

    fn subscribe(&self, kind: MembershipEventKind, handler: MembershipHandler) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    fn participants(&self) -> Vec<Participant>;

    /// Forward one outbound frame. Fails with [`TransportError::Closed`] once
    /// the session has been left or ended remotely.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the session has ended. Cancel-safe.
    async fn recv(&self) -> Option<Result<Frame, TransportError>>;
}

/// Creates the transport for one session.
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    async fn connect(&self, params: &SessionParams) -> Result<Arc<dyn Transport>, TransportError>;
}

struct Subscriber {
    kind: MembershipEventKind,
    handler: MembershipHandler,
}

#[derive(Default)]
struct HubState {
    roster: Vec<Participant>,
    subscribers: HashMap<SubscriptionId, Subscriber>,
}

/// Participant roster plus membership subscriptions, shared by transport
/// implementations.
#[derive(Default)]
pub struct MembershipHub {
    state: RwLock<HubState>,
    next_id: AtomicU64,
}

impl MembershipHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: MembershipEventKind, handler: MembershipHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.subscribers.insert(id, Subscriber { kind, handler });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.subscribers.remove(&id);
    }

    /// Update the roster and notify matching subscribers.
    ///
    /// Handlers run after the lock is released, so a handler may subscribe or
    /// unsubscribe.
    pub fn publish(&self, event: MembershipEvent) {
        let handlers: Vec<MembershipHandler> = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            match &event {
                MembershipEvent::Joined(p) => {
                    if !state.roster.iter().any(|r| r.id == p.id) {
                        state.roster.push(p.clone());
                    }
                }
                MembershipEvent::Left(p) => state.roster.retain(|r| r.id != p.id),
            }
            state
                .subscribers
                .values()
                .filter(|s| s.kind == event.kind())
                .map(|s| s.handler.clone())
                .collect()
        };
        debug!(
            participant = %event.participant().name,
            kind = ?event.kind(),
            handlers = handlers.len(),
            "Membership event"
        );
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn participants(&self) -> Vec<Participant> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.roster.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.subscribers.len()
    }
}

/// Source role of a transport.
pub struct TransportSource {
    transport: Arc<dyn Transport>,
    name: String,
}

#[async_trait]
impl Source for TransportSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::source(FrameKind::Audio)
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, StageError>> {
        self.transport
            .recv()
            .await
            .map(|result| result.map_err(StageError::from))
    }
}

/// Sink role of a transport.
///
/// The pipeline drives a stage from a single task, so sends from here never
/// overlap.
pub struct TransportSink {
    transport: Arc<dyn Transport>,
    name: String,
    accepts: Vec<FrameKind>,
}

impl TransportSink {
    /// Widen or narrow the kinds forwarded to the session (audio by default).
    pub fn accepting(mut self, kinds: Vec<FrameKind>) -> Self {
        self.accepts = kinds;
        self
    }

    async fn forward(&self, frame: Frame) -> Result<(), StageError> {
        if !self.accepts.contains(&frame.kind()) {
            return Err(StageError::UnsupportedKind(frame.kind()));
        }
        self.transport.send(frame).await?;
        Ok(())
    }
}

#[async_trait]
impl Stage for TransportSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::sink(self.accepts.clone())
    }

    async fn on_audio(&mut self, audio: Bytes, _emit: &Emitter) -> Result<(), StageError> {
        self.forward(Frame::Audio(audio)).await
    }

    async fn on_text(&mut self, text: String, _emit: &Emitter) -> Result<(), StageError> {
        self.forward(Frame::Text(text)).await
    }
}

/// Split a transport into its source and sink roles.
pub fn endpoint(transport: Arc<dyn Transport>) -> (TransportSource, TransportSink) {
    let id = transport.id().to_string();
    let source = TransportSource {
        transport: transport.clone(),
        name: format!("transport-in:{id}"),
    };
    let sink = TransportSink {
        transport,
        name: format!("transport-out:{id}"),
        accepts: vec![FrameKind::Audio],
    };
    (source, sink)
}
