//! Error types for text-to-speech providers.
//!
//! [`SynthesisError::is_transient`] is the single switch that decides whether
//! a failed call is worth retrying.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The provider returned HTTP 429.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-success HTTP status.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// DNS, connection, timeout or body read failure.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Rejected before any request was sent (empty text, speed out of range).
    #[error("invalid synthesis request: {0}")]
    InvalidRequest(String),

    /// The provider is not configured or not registered.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl SynthesisError {
    pub fn is_transient(&self) -> bool {
        match self {
            SynthesisError::RateLimited { .. } | SynthesisError::Network(_) => true,
            SynthesisError::Api { status, .. } => *status == 408 || *status >= 500,
            SynthesisError::InvalidRequest(_) | SynthesisError::Unavailable(_) => false,
        }
    }

    pub fn is_invalid_request(&self) -> bool {
        matches!(self, SynthesisError::InvalidRequest(_))
    }

    /// Minimum wait the server asked for, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            SynthesisError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = SynthesisError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
        assert_eq!(err.retry_after_ms(), Some(5000));
    }

    #[test]
    fn transient_classification() {
        assert!(SynthesisError::RateLimited { retry_after_ms: 1 }.is_transient());
        assert!(
            SynthesisError::Api {
                status: 502,
                message: "bad gateway".into()
            }
            .is_transient()
        );
        assert!(
            !SynthesisError::Api {
                status: 401,
                message: "Invalid API key".into()
            }
            .is_transient()
        );
        assert!(!SynthesisError::InvalidRequest("empty".into()).is_transient());
        assert!(!SynthesisError::Unavailable("openai".into()).is_transient());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SynthesisError>();
    }
}
