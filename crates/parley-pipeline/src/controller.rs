//! Session lifecycle controller: one per live session, owning exactly one
//! pipeline between `init` and `deinit`.
//!
//! ```text
//! Uninitialized --init--> Initializing --joined & started--> Running
//!     Running --deinit / remote close--> Deinitializing --> Terminated
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::config::Config;
use parley_core::frame::{Frame, FrameKind};
use parley_core::session::{LifecycleState, SessionHandle, SessionParams};
use parley_core::types::{MembershipEvent, MembershipEventKind};

use crate::error::{
    ErrorReporter, LifecycleError, StageError, TracingReporter, TransportError, ValidationError,
};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::transport::{SubscriptionId, Transport, TransportConnector};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub ingress_capacity: usize,
    pub grace_period: Duration,
    /// Inject "Participant Joined/Left" text into the pipeline.
    pub announce_membership: bool,
}

impl ControllerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ingress_capacity: config.ingress_capacity(),
            grace_period: config.grace_period(),
            announce_membership: config.announce_membership(),
        }
    }

    fn pipeline_config(&self, reporter: Arc<dyn ErrorReporter>) -> PipelineConfig {
        PipelineConfig {
            ingress_capacity: self.ingress_capacity,
            grace_period: self.grace_period,
            reporter,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            ingress_capacity: pipeline.ingress_capacity,
            grace_period: pipeline.grace_period,
            announce_membership: true,
        }
    }
}

/// Builds the stage chain for one session around its transport.
pub trait PipelineFactory: Send + Sync + 'static {
    fn build(
        &self,
        params: &SessionParams,
        transport: Arc<dyn Transport>,
        config: PipelineConfig,
    ) -> Result<Pipeline, ValidationError>;
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("missing or empty auth token")]
    Unauthorized,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Forwards stage failures to the supervisor after logging them.
struct SessionReporter {
    session_id: String,
    events: mpsc::UnboundedSender<bool>,
}

impl ErrorReporter for SessionReporter {
    fn report(&self, stage: &str, error: &StageError) {
        TracingReporter.report(stage, error);
        debug!(session_id = %self.session_id, stage, "Stage failure forwarded to supervisor");
        let _ = self.events.send(error.is_session_closed());
    }
}

struct ActiveSession {
    pipeline: Pipeline,
    transport: Arc<dyn Transport>,
    subscriptions: Vec<SubscriptionId>,
    supervisor: CancellationToken,
}

struct Shared {
    session_id: String,
    state: Mutex<LifecycleState>,
    handle: Mutex<Option<SessionHandle>>,
    /// Held for the whole of `init` and of teardown.
    active: tokio::sync::Mutex<Option<ActiveSession>>,
    failures: AtomicU64,
}

impl Shared {
    fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug!(session_id = %self.session_id, from = %*state, to = %next, "Lifecycle transition");
        *state = next;
    }

    async fn teardown(&self) {
        let mut slot = self.active.lock().await;
        self.teardown_locked(&mut slot).await;
    }

    async fn teardown_locked(&self, slot: &mut Option<ActiveSession>) {
        let Some(mut session) = slot.take() else {
            return;
        };
        self.set_state(LifecycleState::Deinitializing);

        session.supervisor.cancel();
        for id in session.subscriptions.drain(..) {
            session.transport.unsubscribe(id);
        }
        session.pipeline.stop().await;
        if let Err(e) = session.transport.leave().await {
            warn!(session_id = %self.session_id, error = %e, "Failed to leave session cleanly");
        }

        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_state(LifecycleState::Terminated);
        info!(session_id = %self.session_id, "Session terminated");
    }
}

/// Owns one session's pipeline and transport and drives their lifecycle.
pub struct SessionController {
    shared: Arc<Shared>,
    connector: Arc<dyn TransportConnector>,
    factory: Arc<dyn PipelineFactory>,
    config: ControllerConfig,
}

impl SessionController {
    pub fn new(
        session_id: impl Into<String>,
        connector: Arc<dyn TransportConnector>,
        factory: Arc<dyn PipelineFactory>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session_id: session_id.into(),
                state: Mutex::new(LifecycleState::Uninitialized),
                handle: Mutex::new(None),
                active: tokio::sync::Mutex::new(None),
                failures: AtomicU64::new(0),
            }),
            connector,
            factory,
            config,
        }
    }

    /// Connect, build and start the pipeline, join the session.
    ///
    /// Atomic: on any failure started stages are stopped, the session is left,
    /// and the controller is back in `Uninitialized`.
    pub async fn init(&self, params: SessionParams) -> Result<SessionHandle, SessionError> {
        let Ok(mut slot) = self.shared.active.try_lock() else {
            return Err(LifecycleError::AlreadyInitialized(self.state()).into());
        };
        let state = self.state();
        if state != LifecycleState::Uninitialized {
            return Err(LifecycleError::AlreadyInitialized(state).into());
        }
        if !params.has_auth_token() {
            warn!(session_id = %self.shared.session_id, "Init rejected: missing auth token");
            return Err(SessionError::Unauthorized);
        }

        self.shared.set_state(LifecycleState::Initializing);
        match self.bring_up(&params).await {
            Ok(session) => {
                *slot = Some(session);
                let handle = SessionHandle::new(&params);
                *self.shared.handle.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(handle.clone());
                self.shared.set_state(LifecycleState::Running);
                info!(
                    session_id = %handle.session_id,
                    meeting_id = %handle.meeting_id,
                    "Session running"
                );
                Ok(handle)
            }
            Err(e) => {
                self.shared.set_state(LifecycleState::Uninitialized);
                warn!(session_id = %self.shared.session_id, error = %e, "Init failed");
                Err(e)
            }
        }
    }

    async fn bring_up(&self, params: &SessionParams) -> Result<ActiveSession, SessionError> {
        let transport = self.connector.connect(params).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reporter = Arc::new(SessionReporter {
            session_id: self.shared.session_id.clone(),
            events: events_tx,
        });

        let built = self.factory.build(
            params,
            transport.clone(),
            self.config.pipeline_config(reporter),
        );
        let mut pipeline = match built {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.abandon(&transport).await;
                return Err(e.into());
            }
        };

        if let Err(e) = pipeline.start() {
            self.abandon(&transport).await;
            return Err(e.into());
        }

        if let Err(e) = transport.join().await {
            pipeline.stop().await;
            self.abandon(&transport).await;
            return Err(e.into());
        }

        let subscriptions = if self.config.announce_membership {
            self.subscribe_announcements(&pipeline, transport.as_ref())
        } else {
            Vec::new()
        };

        let supervisor = CancellationToken::new();
        tokio::spawn(supervise(
            Arc::downgrade(&self.shared),
            events_rx,
            supervisor.clone(),
        ));

        Ok(ActiveSession {
            pipeline,
            transport,
            subscriptions,
            supervisor,
        })
    }

    async fn abandon(&self, transport: &Arc<dyn Transport>) {
        if let Err(e) = transport.leave().await {
            debug!(session_id = %self.shared.session_id, error = %e, "Leave after failed init");
        }
    }

    fn subscribe_announcements(
        &self,
        pipeline: &Pipeline,
        transport: &dyn Transport,
    ) -> Vec<SubscriptionId> {
        let (Some(injector), Some(index)) =
            (pipeline.injector(), pipeline.position_accepting(FrameKind::Text))
        else {
            debug!(session_id = %self.shared.session_id, "No text stage, membership announcements off");
            return Vec::new();
        };

        [MembershipEventKind::Joined, MembershipEventKind::Left]
            .into_iter()
            .map(|kind| {
                let injector = injector.clone();
                let session_id = self.shared.session_id.clone();
                transport.subscribe(
                    kind,
                    Arc::new(move |event: &MembershipEvent| {
                        if let Err(e) = injector.inject_at(index, Frame::text(event.announcement())) {
                            debug!(%session_id, error = %e, "Announcement dropped");
                        }
                    }),
                )
            })
            .collect()
    }

    /// Stop the pipeline, release the session, end in `Terminated`.
    ///
    /// Waits for an in-progress `init`. No-op when nothing is running.
    pub async fn deinit(&self) {
        let mut slot = self.shared.active.lock().await;
        if slot.is_none() {
            debug!(session_id = %self.shared.session_id, state = %self.state(), "Deinit: nothing to tear down");
            return;
        }
        self.shared.teardown_locked(&mut slot).await;
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    pub fn handle(&self) -> Option<SessionHandle> {
        self.shared
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stage failures reported since the session started running.
    pub fn stage_failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }
}

/// Counts stage failures; tears the session down once it has ended remotely.
async fn supervise(
    shared: Weak<Shared>,
    mut events: mpsc::UnboundedReceiver<bool>,
    cancel: CancellationToken,
) {
    loop {
        let closed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(closed) => closed,
                None => return,
            },
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.failures.fetch_add(1, Ordering::Relaxed);
        if closed {
            info!(session_id = %shared.session_id, "Session ended remotely, tearing down");
            shared.teardown().await;
            return;
        }
    }
}
