//! Gateway shared state: the registry of per-session controllers.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use parley_core::config::Config;
use parley_core::session::{LifecycleState, SessionHandle, SessionParams};
use parley_pipeline::{ControllerConfig, PipelineFactory, SessionController, TransportConnector};
use parley_stages::VoicePipelineFactory;
use parley_transport::WsConnector;

/// Body of `POST /sessions/{id}/init`. The session id comes from the path.
#[derive(Debug, Clone, Deserialize)]
pub struct InitRequest {
    pub meeting_id: String,
    #[serde(default)]
    pub auth_token: String,
    pub callback_address: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub api_token: String,
}

impl InitRequest {
    pub fn into_params(self, session_id: String) -> SessionParams {
        SessionParams {
            session_id,
            meeting_id: self.meeting_id,
            auth_token: self.auth_token,
            callback_address: self.callback_address,
            account_id: self.account_id,
            api_token: self.api_token,
        }
    }
}

/// What `GET /sessions` reports per controller.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<SessionHandle>,
    pub stage_failures: u64,
}

impl SessionSummary {
    fn of(controller: &SessionController) -> Self {
        Self {
            session_id: controller.session_id().to_string(),
            state: controller.state(),
            handle: controller.handle(),
            stage_failures: controller.stage_failures(),
        }
    }
}

/// Shared gateway state accessible from all handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    connector: Arc<dyn TransportConnector>,
    factory: Arc<dyn PipelineFactory>,
    controller_config: ControllerConfig,
    auth_token: Option<String>,
    sessions: RwLock<HashMap<String, Arc<SessionController>>>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn TransportConnector>,
        factory: Arc<dyn PipelineFactory>,
    ) -> Self {
        Self {
            controller_config: ControllerConfig::from_config(&config),
            auth_token: config.gateway_token(),
            config,
            connector,
            factory,
            sessions: RwLock::new(HashMap::new()),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Media-bridge transport plus the STT → reasoning → TTS chain.
    pub fn with_voice_pipeline(config: Arc<Config>) -> Self {
        let connector = Arc::new(WsConnector::from_config(&config));
        let factory = Arc::new(VoicePipelineFactory::new(config.clone()));
        Self::new(config, connector, factory)
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Control token required on `/sessions` routes, if any.
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    /// Controller for `session_id`, created on first use.
    ///
    /// A controller that has reached `Terminated` is replaced by a fresh one.
    pub async fn controller(&self, session_id: &str) -> Arc<SessionController> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session_id) {
            if existing.state() != LifecycleState::Terminated {
                return existing.clone();
            }
            debug!(session_id, "Replacing terminated controller");
        }
        let controller = Arc::new(SessionController::new(
            session_id,
            self.connector.clone(),
            self.factory.clone(),
            self.controller_config.clone(),
        ));
        sessions.insert(session_id.to_string(), controller.clone());
        controller
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionController>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Drop `controller` from the registry unless it has already been replaced.
    pub async fn discard(&self, session_id: &str, controller: &Arc<SessionController>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, controller))
        {
            sessions.remove(session_id);
        }
    }

    /// Forget controllers that ended on their own (remote close).
    async fn prune_terminated(&self) {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|session_id, controller| {
            let live = controller.state() != LifecycleState::Terminated;
            if !live {
                debug!(session_id = %session_id, "Pruning terminated session");
            }
            live
        });
    }

    /// Live sessions; terminated ones are pruned first.
    pub async fn session_count(&self) -> usize {
        self.prune_terminated().await;
        self.sessions.read().await.len()
    }

    /// Live sessions sorted by id.
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        self.prune_terminated().await;
        let sessions = self.sessions.read().await;
        let mut out: Vec<SessionSummary> =
            sessions.values().map(|c| SessionSummary::of(c)).collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }

    pub async fn summary(&self, session_id: &str) -> Option<SessionSummary> {
        self.get(session_id).await.map(|c| SessionSummary::of(&c))
    }

    /// Deinitialize every registered session and empty the registry.
    pub async fn shutdown_all(&self) {
        let controllers: Vec<Arc<SessionController>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, c)| c).collect()
        };
        if controllers.is_empty() {
            return;
        }
        info!(sessions = controllers.len(), "Deinitializing all sessions");
        futures::future::join_all(controllers.iter().map(|c| c.deinit())).await;
    }
}
