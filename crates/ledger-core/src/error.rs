use thiserror::Error;

/// Errors surfaced by the ledger core.
///
/// Every variant maps to exactly one of the error kinds a caller needs to
/// distinguish: validation failures never touch storage, idempotency
/// conflicts leave the anchor untouched, and `Storage` is deliberately
/// opaque so internal details never leak past this boundary.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("idempotency conflict for key '{key}': request hash does not match the original request")]
    IdempotencyConflict { key: String },

    #[error("currency mismatch: expected '{expected}', got '{actual}'")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("chain integrity break at seq {seq}: {reason}")]
    IntegrityBreak { seq: i64, reason: String },
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
