//! Axum-based control server.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_core::session::{LifecycleState, SessionHandle};

use crate::auth::require_token;
use crate::error::ApiError;
use crate::state::{GatewayState, InitRequest, SessionSummary};

/// All gateway routes. `/health` and `/metrics` stay open; `/sessions/*`
/// requires the control token when one is configured.
pub fn router(state: Arc<GatewayState>) -> Router {
    let control = Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/init", post(init_session))
        .route("/sessions/{id}/deinit", post(deinit_session))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    let app = Router::new().route("/health", get(health_handler)).merge(control);

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Bind on the configured address and serve until Ctrl-C / SIGTERM.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{port}", state.config.gateway_bind());
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");
    serve(listener, state, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves, then deinit every session.
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown)
        .await?;

    state.shutdown_all().await;
    info!("Gateway shutdown complete");
    Ok(())
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.session_count().await,
    }))
}

async fn list_sessions(State(state): State<Arc<GatewayState>>) -> Json<Vec<SessionSummary>> {
    Json(state.summaries().await)
}

async fn get_session(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    state
        .summary(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(&id))
}

async fn init_session(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(body): Json<InitRequest>,
) -> Result<Json<SessionHandle>, ApiError> {
    let controller = state.controller(&id).await;
    match controller.init(body.into_params(id.clone())).await {
        Ok(handle) => {
            info!(session_id = %id, meeting_id = %handle.meeting_id, "Session initialized");
            #[cfg(feature = "metrics")]
            {
                crate::metrics::record_init("ok");
                crate::metrics::set_sessions_active(state.session_count().await);
            }
            Ok(Json(handle))
        }
        Err(e) => {
            // A failed init leaves nothing behind worth keeping.
            if controller.state() == LifecycleState::Uninitialized {
                state.discard(&id, &controller).await;
            }
            let err = ApiError::from(e);
            warn!(session_id = %id, kind = err.kind(), error = %err.message, "Session init rejected");
            #[cfg(feature = "metrics")]
            {
                crate::metrics::record_init(err.kind());
                crate::metrics::record_error(err.kind());
            }
            Err(err)
        }
    }
}

/// Idempotent: an unknown session reports `uninitialized`.
async fn deinit_session(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let Some(controller) = state.get(&id).await else {
        return Json(json!({
            "session_id": id,
            "state": LifecycleState::Uninitialized,
        }));
    };

    controller.deinit().await;
    state.discard(&id, &controller).await;
    info!(session_id = %id, "Session deinitialized");
    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_deinit();
        crate::metrics::set_sessions_active(state.session_count().await);
    }

    Json(json!({
        "session_id": id,
        "state": controller.state(),
    }))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => ApiError::new(
            axum::http::StatusCode::NOT_FOUND,
            "metrics recorder not installed",
        )
        .into_response(),
    }
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
