//! Session model: init parameters, the per-session handle, and lifecycle state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Arguments of the `init` control operation.
#[derive(Clone)]
pub struct SessionParams {
    pub session_id: String,
    pub meeting_id: String,
    /// Token used to join the external session.
    pub auth_token: String,
    /// Address of the conferencing bridge to connect back to.
    pub callback_address: String,
    pub account_id: String,
    /// Credential for inference backends.
    pub api_token: String,
}

impl SessionParams {
    /// True when the auth token is present and not just whitespace.
    pub fn has_auth_token(&self) -> bool {
        !self.auth_token.trim().is_empty()
    }
}

// Tokens stay out of logs.
impl fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field("session_id", &self.session_id)
            .field("meeting_id", &self.meeting_id)
            .field("auth_token", &"<redacted>")
            .field("callback_address", &self.callback_address)
            .field("account_id", &self.account_id)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

/// Correlates one pipeline with one external session and one controller.
///
/// Created on `init`, dropped on `deinit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub session_id: String,
    pub meeting_id: String,
    pub created_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn new(params: &SessionParams) -> Self {
        Self {
            session_id: params.session_id.clone(),
            meeting_id: params.meeting_id.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle of a session controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Initializing,
    Running,
    Deinitializing,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Running => "running",
            LifecycleState::Deinitializing => "deinitializing",
            LifecycleState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(token: &str) -> SessionParams {
        SessionParams {
            session_id: "s-1".into(),
            meeting_id: "m-1".into(),
            auth_token: token.into(),
            callback_address: "bridge.example.com".into(),
            account_id: "acct".into(),
            api_token: "secret-api".into(),
        }
    }

    #[test]
    fn test_blank_token_rejected() {
        assert!(params("tok").has_auth_token());
        assert!(!params("").has_auth_token());
        assert!(!params("   ").has_auth_token());
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let out = format!("{:?}", params("very-secret"));
        assert!(!out.contains("very-secret"));
        assert!(!out.contains("secret-api"));
        assert!(out.contains("m-1"));
    }

    #[test]
    fn test_handle_copies_ids() {
        let handle = SessionHandle::new(&params("tok"));
        assert_eq!(handle.session_id, "s-1");
        assert_eq!(handle.meeting_id, "m-1");
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&LifecycleState::Deinitializing).unwrap();
        assert_eq!(json, "\"deinitializing\"");
        assert_eq!(LifecycleState::default(), LifecycleState::Uninitialized);
    }
}
