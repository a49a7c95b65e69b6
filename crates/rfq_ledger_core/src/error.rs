use thiserror::Error;

use crate::contract::ValidationError;

/// Failure taxonomy shared by every ledger, guard and publisher operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("idempotency key was already used with a different request body")]
    IdempotencyConflict,

    #[error("a request with this idempotency key is still in progress")]
    IdempotencyInProgress,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage temporarily unavailable: {0}")]
    StorageTransient(String),

    #[error("storage contention on {key} after {attempts} attempts")]
    StorageContention { key: String, attempts: u32 },

    #[error("storage failure: {0}")]
    StorageFatal(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::IdempotencyInProgress => "idempotency_in_progress",
            Self::NotFound(_) => "not_found",
            Self::StorageTransient(_) => "storage_transient",
            Self::StorageContention { .. } => "storage_contention",
            Self::StorageFatal(_) => "storage_fatal",
            Self::RateLimited(_) => "rate_limited",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::IdempotencyConflict | Self::IdempotencyInProgress => 409,
            Self::NotFound(_) => 404,
            Self::RateLimited(_) => 429,
            Self::StorageTransient(_) => 503,
            Self::StorageContention { .. } | Self::StorageFatal(_) | Self::Internal(_) => 500,
        }
    }

    /// Client errors carry a message safe to echo back; server errors do not.
    pub fn is_client_error(&self) -> bool {
        self.http_status() < 500
    }
}

impl From<ValidationError> for LedgerError {
    fn from(error: ValidationError) -> Self {
        Self::Validation(error.message().to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(error: serde_json::Error) -> Self {
        Self::Internal(format!("json encoding failed: {error}"))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
