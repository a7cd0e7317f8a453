use std::future::Future;

use sync_core::{SyncError, SyncErrorCategory, classify_close_code};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("connection closed by peer with code {code}: {reason}")]
    Closed { code: u16, reason: String },
    #[error("transport failure: {0}")]
    Io(String),
}

impl TransportError {
    pub fn category(&self) -> SyncErrorCategory {
        match self {
            Self::Closed { code, .. } => classify_close_code(*code),
            Self::Refused(_) | Self::Io(_) => SyncErrorCategory::Transport,
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        let code = match err {
            TransportError::Refused(_) => "transport_refused",
            TransportError::Closed { .. } => "transport_closed",
            TransportError::Io(_) => "transport_io",
        };
        SyncError::new(err.category(), code, err.to_string())
    }
}

/// One open realtime connection carrying text frames.
pub trait Transport: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next text frame. `None` once the peer has gone away.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;
}

/// Opens transports. Called again for every reconnect attempt.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(&self) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_pick_the_category() {
        let auth = TransportError::Closed {
            code: 4004,
            reason: "authentication failed".into(),
        };
        assert_eq!(auth.category(), SyncErrorCategory::Auth);

        let normal = TransportError::Closed {
            code: 1001,
            reason: "going away".into(),
        };
        assert_eq!(normal.category(), SyncErrorCategory::Transport);

        let err: SyncError = TransportError::Refused("busy".into()).into();
        assert_eq!(err.code, "transport_refused");
        assert!(err.is_recoverable());
    }
}
