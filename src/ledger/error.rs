//! Ledger Error Types
//!
//! Every failure is a typed value so batch callers can report per-item
//! outcomes. Validation errors are raised before any balance is touched.

use rust_decimal::Decimal;
use thiserror::Error;

use super::types::UserId;

/// Ledger error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    // === Validation Errors ===
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Sender and receiver must differ")]
    SelfTransferNotAllowed,

    #[error("Entry type {0} is not allowed for this operation")]
    InvalidEntryType(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    // === Balance Errors ===
    #[error("Insufficient funds for user {user_id}: available {available}, required {required}")]
    InsufficientFunds {
        user_id: UserId,
        available: Decimal,
        required: Decimal,
    },

    #[error("Account not found for user {0}")]
    AccountNotFound(UserId),

    // === Idempotency / Lifecycle Errors ===
    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    // === System Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query timed out after {0} ms")]
    QueryTimeout(u64),
}

impl LedgerError {
    /// Stable error code for collaborators
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::SelfTransferNotAllowed => "SELF_TRANSFER_NOT_ALLOWED",
            LedgerError::InvalidEntryType(_) => "INVALID_ENTRY_TYPE",
            LedgerError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::DuplicateTransaction(_) => "DUPLICATE_TRANSACTION",
            LedgerError::InvalidState(_) => "INVALID_STATE",
            LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            LedgerError::Storage(_) => "STORAGE_ERROR",
            LedgerError::QueryTimeout(_) => "QUERY_TIMEOUT",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::InvalidAmount(_)
            | LedgerError::SelfTransferNotAllowed
            | LedgerError::InvalidEntryType(_) => 400,
            LedgerError::AccountNotFound(_) | LedgerError::TransactionNotFound(_) => 404,
            LedgerError::DuplicateTransaction(_) | LedgerError::InvalidState(_) => 409,
            LedgerError::LimitExceeded(_) | LedgerError::InsufficientFunds { .. } => 422,
            LedgerError::Storage(_) => 500,
            LedgerError::QueryTimeout(_) => 504,
        }
    }

    /// Whether the failure happened before anything was written
    ///
    /// `Storage` and `QueryTimeout` are infrastructure failures; the caller
    /// cannot tell whether a commit that raised `Storage` landed.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, LedgerError::Storage(_) | LedgerError::QueryTimeout(_))
    }
}

/// PostgreSQL SQLSTATE for unique_violation
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e
            && db_err.code().as_deref() == Some(UNIQUE_VIOLATION)
        {
            return LedgerError::DuplicateTransaction(db_err.message().to_string());
        }
        LedgerError::Storage(e.to_string())
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            LedgerError::SelfTransferNotAllowed.code(),
            "SELF_TRANSFER_NOT_ALLOWED"
        );
        assert_eq!(
            LedgerError::DuplicateTransaction("TR1".into()).code(),
            "DUPLICATE_TRANSACTION"
        );
        assert_eq!(
            LedgerError::InsufficientFunds {
                user_id: 1,
                available: Decimal::ZERO,
                required: Decimal::ONE,
            }
            .code(),
            "INSUFFICIENT_FUNDS"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(LedgerError::InvalidAmount("0".into()).http_status(), 400);
        assert_eq!(LedgerError::AccountNotFound(7).http_status(), 404);
        assert_eq!(LedgerError::InvalidState("x".into()).http_status(), 409);
        assert_eq!(LedgerError::LimitExceeded("x".into()).http_status(), 422);
        assert_eq!(LedgerError::Storage("x".into()).http_status(), 500);
    }

    #[test]
    fn test_display() {
        let err = LedgerError::InsufficientFunds {
            user_id: 9,
            available: Decimal::from(10),
            required: Decimal::from(12),
        };
        assert_eq!(
            err.to_string(),
            "Insufficient funds for user 9: available 10, required 12"
        );
        assert!(err.is_rejection());
        assert!(!LedgerError::Storage("down".into()).is_rejection());
    }

    #[test]
    fn test_non_database_sqlx_error_is_storage() {
        let err: LedgerError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.code(), "STORAGE_ERROR");
    }
}
