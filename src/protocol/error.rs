//! Error taxonomy for protocol calls.

use std::time::Duration;

use thiserror::Error;

use crate::retry::{RetryAction, RetryableError};

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Transport-level failure (DNS, connect, reset, timeout). Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 429. Retryable, honoring the server's suggested wait.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx. Retryable.
    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    /// HTTP 4xx other than 429/404. Fatal, surfaced immediately.
    #[error("client error: HTTP {status}")]
    Client { status: u16 },

    /// The credential exchange itself was refused.
    #[error("credential exchange rejected: {0}")]
    AuthRejected(String),

    /// The caller's cancellation fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Typed absence; operations that define it map HTTP 404 here.
    #[error("not found")]
    NotFound,

    /// Response body did not decode or lacked an expected field.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProtocolError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::Server { .. }
        )
    }
}

impl From<reqwest::Error> for ProtocolError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl RetryableError for ProtocolError {
    fn retry_action(&self) -> RetryAction {
        if self.is_retryable() {
            RetryAction::Retry
        } else {
            RetryAction::Abort
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProtocolError::Network("reset".into()).is_retryable());
        assert!(ProtocolError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProtocolError::Server { status: 503 }.is_retryable());

        assert!(!ProtocolError::Client { status: 400 }.is_retryable());
        assert!(!ProtocolError::NotFound.is_retryable());
        assert!(!ProtocolError::Cancelled.is_retryable());
        assert!(!ProtocolError::AuthRejected("nope".into()).is_retryable());
        assert!(!ProtocolError::Malformed("bad".into()).is_retryable());
    }

    #[test]
    fn rate_limit_carries_server_wait() {
        let err = ProtocolError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(ProtocolError::Server { status: 500 }.retry_after(), None);
    }
}
