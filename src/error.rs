use crate::idempotency::identity::ValueKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IdempotencyError>;

/// Errors raised by the idempotency layer and the consumer plumbing around it.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// No identity-contributing value produced a non-empty record identity.
    #[error("no idempotency id components found: at least one identity component is required and the joined value must not be empty")]
    EmptyIdentity,

    #[error("unsupported identity type {kind} for parameter '{parameter}': only text, int and long are supported")]
    UnsupportedIdentityType { parameter: String, kind: ValueKind },

    /// The backing store could not be reached or timed out.
    #[error("idempotency store unavailable ({backend}): {source}")]
    StoreUnavailable {
        backend: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Admission-phase failure surfaced to the consumer because errors are not suppressed.
    #[error("idempotency check failed: {0}")]
    CheckFailure(#[source] Box<IdempotencyError>),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rskafka::client::error::Error),

    /// Error returned by a wrapped business handler.
    #[error("handler error: {0}")]
    Handler(#[source] anyhow::Error),
}

impl IdempotencyError {
    pub fn store_unavailable(backend: &'static str, source: impl Into<anyhow::Error>) -> Self {
        IdempotencyError::StoreUnavailable {
            backend,
            source: source.into(),
        }
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, IdempotencyError::StoreUnavailable { .. })
    }

    pub fn is_check_failure(&self) -> bool {
        matches!(self, IdempotencyError::CheckFailure(_))
    }

    /// Error wrapped by a `CheckFailure`, if any.
    pub fn check_failure_cause(&self) -> Option<&IdempotencyError> {
        match self {
            IdempotencyError::CheckFailure(cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<redis::RedisError> for IdempotencyError {
    fn from(err: redis::RedisError) -> Self {
        IdempotencyError::store_unavailable("redis", err)
    }
}

impl From<validator::ValidationErrors> for IdempotencyError {
    fn from(err: validator::ValidationErrors) -> Self {
        IdempotencyError::Validation(err.to_string())
    }
}
