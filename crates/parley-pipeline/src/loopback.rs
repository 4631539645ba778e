//! In-memory transport. The remote half plays the external session: it pushes
//! inbound frames, announces membership changes, reads what the pipeline sent,
//! and can end the session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use parley_core::frame::Frame;
use parley_core::session::SessionParams;
use parley_core::types::{MembershipEvent, MembershipEventKind, Participant};

use crate::error::TransportError;
use crate::transport::{
    MembershipHandler, MembershipHub, SubscriptionId, Transport, TransportConnector,
};

struct Shared {
    hub: MembershipHub,
    joined: AtomicBool,
    closed: CancellationToken,
    fail_join: Mutex<Option<String>>,
}

pub struct LoopbackTransport {
    id: String,
    shared: Arc<Shared>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    outbound: mpsc::UnboundedSender<Frame>,
}

/// The far side of a [`LoopbackTransport`].
#[derive(Clone)]
pub struct LoopbackRemote {
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<Frame>,
    outbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>>,
}

impl LoopbackTransport {
    pub fn pair(id: impl Into<String>) -> (Arc<Self>, LoopbackRemote) {
        let shared = Arc::new(Shared {
            hub: MembershipHub::new(),
            joined: AtomicBool::new(false),
            closed: CancellationToken::new(),
            fail_join: Mutex::new(None),
        });
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            id: id.into(),
            shared: shared.clone(),
            inbound: tokio::sync::Mutex::new(in_rx),
            outbound: out_tx,
        });
        let remote = LoopbackRemote {
            shared,
            inbound: in_tx,
            outbound: Arc::new(tokio::sync::Mutex::new(out_rx)),
        };
        (transport, remote)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn join(&self) -> Result<(), TransportError> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let failure = self
            .shared
            .fail_join
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reason) = failure {
            return Err(TransportError::Join(reason));
        }
        self.shared.joined.store(true, Ordering::SeqCst);
        debug!(transport = %self.id, "Joined loopback session");
        Ok(())
    }

    async fn leave(&self) -> Result<(), TransportError> {
        self.shared.joined.store(false, Ordering::SeqCst);
        self.shared.closed.cancel();
        debug!(transport = %self.id, "Left loopback session");
        Ok(())
    }

    fn subscribe(&self, kind: MembershipEventKind, handler: MembershipHandler) -> SubscriptionId {
        self.shared.hub.subscribe(kind, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.hub.unsubscribe(id);
    }

    fn participants(&self) -> Vec<Participant> {
        self.shared.hub.participants()
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if !self.shared.joined.load(Ordering::SeqCst) {
            return Err(TransportError::NotJoined);
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<Result<Frame, TransportError>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => None,
            frame = inbound.recv() => frame.map(Ok),
        }
    }
}

impl LoopbackRemote {
    /// Deliver an inbound frame to the transport.
    pub fn push(&self, frame: Frame) {
        let _ = self.inbound.send(frame);
    }

    pub fn announce(&self, event: MembershipEvent) {
        self.shared.hub.publish(event);
    }

    /// End the session from the remote side.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    /// Next frame the pipeline sent; `None` once the transport is gone.
    pub async fn recv_outbound(&self) -> Option<Frame> {
        self.outbound.lock().await.recv().await
    }

    pub fn try_recv_outbound(&self) -> Option<Frame> {
        self.outbound.try_lock().ok()?.try_recv().ok()
    }

    /// Make the next `join` fail with the given reason.
    pub fn fail_next_join(&self, reason: &str) {
        *self.shared.fail_join.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.into());
    }

    pub fn is_joined(&self) -> bool {
        self.shared.joined.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.hub.subscriber_count()
    }
}

/// Connector handing out loopback transports, keyed by session id.
#[derive(Default)]
pub struct LoopbackConnector {
    remotes: Mutex<HashMap<String, LoopbackRemote>>,
    connects: AtomicUsize,
    fail_join: Mutex<Option<String>>,
    fail_connect: Mutex<Option<String>>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote half of the most recent transport for `session_id`.
    pub fn remote(&self, session_id: &str) -> Option<LoopbackRemote> {
        self.remotes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The next transport handed out fails its `join`.
    pub fn fail_next_join(&self, reason: &str) {
        *self.fail_join.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.into());
    }

    pub fn fail_next_connect(&self, reason: &str) {
        *self.fail_connect.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.into());
    }
}

#[async_trait]
impl TransportConnector for LoopbackConnector {
    async fn connect(&self, params: &SessionParams) -> Result<Arc<dyn Transport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .fail_connect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reason) = failure {
            return Err(TransportError::Connect(reason));
        }

        let (transport, remote) = LoopbackTransport::pair(format!("loopback-{}", params.session_id));
        let join_failure = self.fail_join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reason) = join_failure {
            remote.fail_next_join(&reason);
        }
        self.remotes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(params.session_id.clone(), remote);
        Ok(transport)
    }
}
