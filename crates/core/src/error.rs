//! Unified error types for the metadata sync pipeline.
//!
//! Variants are grouped by behaviour rather than by origin:
//! - protocol framing errors drop the offending frame and keep consuming
//! - transient errors are retried with backoff
//! - validation and dataset-resolution errors dead-letter the payload
//! - constraint violations indicate a planner bug and are alert-worthy

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the metadata sync pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Sparkplug envelope (or compression wrapper) could not be parsed.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A property declared a type outside the supported set.
    #[error("unsupported datatype {datatype} on {context}")]
    UnsupportedDatatype { datatype: u32, context: String },

    /// A required path segment was empty after normalization.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The store rejected a write due to a uniqueness or typing constraint.
    #[error("constraint violation on {key}: {detail}")]
    ConstraintViolation { key: String, detail: String },

    /// Recoverable I/O or upstream failure; eligible for retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// The historian rejected the payload (4xx); dead-letter, never retry.
    #[error("validation rejected: {0}")]
    Validation(String),

    /// No configured dataset contains the canonical path.
    #[error("dataset not found for {0}")]
    DatasetNotFound(String),

    /// The historian reported a bad session token.
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    /// Encoded egress payload exceeds the configured byte limit.
    #[error("payload size {size} bytes exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A bounded queue refused admission.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// Non-2xx HTTP response that has not yet been classified.
    #[error("http status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    pub fn constraint(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            key: key.into(),
            detail: detail.into(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the retry policy may re-attempt the failed operation.
    ///
    /// Session invalidation is deliberately not retriable here: the caller
    /// refreshes the session and retries once outside the retry budget.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Io(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Whether the failure should be recorded to the dead-letter store
    /// instead of retried.
    pub fn is_dead_letter(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::DatasetNotFound(_) | Self::PayloadTooLarge { .. }
        ) || matches!(self, Self::Http { status, .. } if (400..500).contains(status) && *status != 429)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retriable() {
        assert!(Error::Http {
            status: 503,
            message: "unavailable".into()
        }
        .is_retriable());
        assert!(Error::Http {
            status: 429,
            message: "slow down".into()
        }
        .is_retriable());
        assert!(Error::transient("reset by peer").is_retriable());
    }

    #[test]
    fn client_errors_dead_letter() {
        let err = Error::Http {
            status: 400,
            message: "bad payload".into(),
        };
        assert!(!err.is_retriable());
        assert!(err.is_dead_letter());
        assert!(Error::DatasetNotFound("Secil/PT/X".into()).is_dead_letter());
    }

    #[test]
    fn session_invalid_is_neither_retriable_nor_dead_letter() {
        let err = Error::SessionInvalid("BadSessionToken".into());
        assert!(!err.is_retriable());
        assert!(!err.is_dead_letter());
    }
}
