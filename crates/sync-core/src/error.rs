use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionPhase;

/// Broad error category driving recovery behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Invalid configuration or misuse of the API.
    Config,
    /// Token rejected or missing. Terminal for the session.
    Auth,
    /// Connection dropped, refused or timed out. Recovered by reconnecting.
    Transport,
    /// Malformed or unexpected frame. The frame is dropped.
    Protocol,
    /// Credential or preference storage failure.
    Storage,
    /// Invariant break inside the client.
    Internal,
}

/// Stable error payload crossing crate boundaries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    pub message: String,
}

impl SyncError {
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Standard error for an input the session state machine cannot accept.
    pub fn invalid_transition(current: SessionPhase, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot apply '{action}' while session is {current:?}"),
        )
    }

    /// Whether reconnecting may recover from this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category, SyncErrorCategory::Transport)
    }
}

/// Map a realtime close code to an error category.
pub fn classify_close_code(code: u16) -> SyncErrorCategory {
    match code {
        4004 => SyncErrorCategory::Auth,
        4000..=4999 => SyncErrorCategory::Protocol,
        1000..=1015 => SyncErrorCategory::Transport,
        _ => SyncErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_close_codes() {
        assert_eq!(classify_close_code(4004), SyncErrorCategory::Auth);
        assert_eq!(classify_close_code(4002), SyncErrorCategory::Protocol);
        assert_eq!(classify_close_code(1006), SyncErrorCategory::Transport);
        assert_eq!(classify_close_code(3000), SyncErrorCategory::Internal);
    }

    #[test]
    fn keeps_invalid_transition_code_stable() {
        let err = SyncError::invalid_transition(SessionPhase::Disconnected, "ready");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, SyncErrorCategory::Internal);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn only_transport_errors_are_recoverable() {
        let transport = SyncError::new(SyncErrorCategory::Transport, "closed", "peer closed");
        let auth = SyncError::new(SyncErrorCategory::Auth, "token", "rejected");
        assert!(transport.is_recoverable());
        assert!(!auth.is_recoverable());
    }

    #[test]
    fn displays_category_and_code() {
        let err = SyncError::new(SyncErrorCategory::Transport, "refused", "busy");
        assert_eq!(err.to_string(), "Transport:refused: busy");
    }
}
