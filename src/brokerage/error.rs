use thiserror::Error;

use super::types::BrokerageId;

/// Failure modes a brokerage backend can report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerageError {
    /// Bad or rejected credentials. Permanent, never retried.
    #[error("Credentials rejected: {0}")]
    AuthCredential(String),

    /// Login failed for a reason that may clear up. Retried once.
    #[error("Transient authentication failure: {0}")]
    AuthTransient(String),

    #[error("Session expired: {0}")]
    AuthExpired(String),

    #[error("Network error: {0}")]
    Network(String),

    /// The backend answered and refused the request. Never retried.
    #[error("Rejected by backend: {0}")]
    Rejected(String),

    #[error("Rate limited by backend")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Operation not supported by {identity}: {operation}")]
    Unsupported {
        identity: BrokerageId,
        operation: &'static str,
    },

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Invalid auth state transition for {identity}: {from} -> {to}")]
    InvalidTransition {
        identity: BrokerageId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Rate limiter closed")]
    LimiterClosed,
}

impl BrokerageError {
    /// Whether a login attempt that failed with this error deserves one more try.
    pub fn is_retryable_auth(&self) -> bool {
        matches!(
            self,
            BrokerageError::AuthTransient(_) | BrokerageError::Network(_)
        )
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, BrokerageError::Unsupported { .. })
    }
}
