//! HTTP front door for Parley.
//!
//! Routes `init`/`deinit` requests by session id to one
//! [`SessionController`](parley_pipeline::SessionController) per live session.

pub mod auth;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use server::{router, serve, start_gateway};
pub use state::{GatewayState, InitRequest, SessionSummary};
