//! Ledger Error Types
//!
//! One error enum for the financial core. Every variant maps to exactly one
//! [`ErrorKind`], a stable string code and a numeric business code used by the
//! HTTP envelope (`{code, message, data}`).

use thiserror::Error;

use crate::money::MoneyError;

/// Error kinds surfaced by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    InsufficientBalance,
    LockContended,
    UpstreamTransient,
    UpstreamTerminal,
    Integrity,
    Internal,
}

#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    // === Validation ===
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid profit-share rates: {0}")]
    InvalidRates(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // === Lookup ===
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // === Conflict ===
    #[error("Application already audited (status {0})")]
    AlreadyAudited(i16),

    #[error("Shop {0} is already bound to another owner")]
    ShopAlreadyBound(i64),

    #[error("Duplicate tx_no: {0}")]
    DuplicateTxNo(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // === Balance ===
    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Unfreeze exceeds frozen amount")]
    InvalidUnfreeze,

    // === Coordination ===
    #[error("Lock contended: {0}")]
    LockContended(String),

    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    // === Upstream ===
    #[error("Upstream transient error: {0}")]
    UpstreamTransient(String),

    #[error("Upstream terminal error: {0}")]
    UpstreamTerminal(String),

    // === Integrity / system ===
    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount(_)
            | LedgerError::InvalidRates(_)
            | LedgerError::Validation(_) => ErrorKind::Validation,
            LedgerError::NotFound { .. } => ErrorKind::NotFound,
            LedgerError::Forbidden(_) => ErrorKind::Forbidden,
            LedgerError::AlreadyAudited(_)
            | LedgerError::ShopAlreadyBound(_)
            | LedgerError::DuplicateTxNo(_)
            | LedgerError::Conflict(_) => ErrorKind::Conflict,
            LedgerError::InsufficientBalance | LedgerError::InvalidUnfreeze => {
                ErrorKind::InsufficientBalance
            }
            LedgerError::LockContended(_) => ErrorKind::LockContended,
            LedgerError::UpstreamTransient(_) => ErrorKind::UpstreamTransient,
            LedgerError::UpstreamTerminal(_) => ErrorKind::UpstreamTerminal,
            LedgerError::Integrity(_) | LedgerError::LeaseLost(_) => ErrorKind::Integrity,
            LedgerError::CoordinationUnavailable(_)
            | LedgerError::Database(_)
            | LedgerError::Cancelled
            | LedgerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable string code for logs and API messages
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InvalidRates(_) => "INVALID_RATES",
            LedgerError::Validation(_) => "VALIDATION",
            LedgerError::NotFound { .. } => "NOT_FOUND",
            LedgerError::Forbidden(_) => "FORBIDDEN",
            LedgerError::AlreadyAudited(_) => "ALREADY_AUDITED",
            LedgerError::ShopAlreadyBound(_) => "SHOP_ALREADY_BOUND",
            LedgerError::DuplicateTxNo(_) => "DUPLICATE_TX_NO",
            LedgerError::Conflict(_) => "CONFLICT",
            LedgerError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            LedgerError::InvalidUnfreeze => "INVALID_UNFREEZE",
            LedgerError::LockContended(_) => "LOCK_CONTENDED",
            LedgerError::LeaseLost(_) => "LEASE_LOST",
            LedgerError::CoordinationUnavailable(_) => "COORDINATION_UNAVAILABLE",
            LedgerError::UpstreamTransient(_) => "UPSTREAM_TRANSIENT",
            LedgerError::UpstreamTerminal(_) => "UPSTREAM_TERMINAL",
            LedgerError::Integrity(_) => "INTEGRITY",
            LedgerError::Database(_) => "DATABASE_ERROR",
            LedgerError::Cancelled => "CANCELLED",
            LedgerError::Internal(_) => "INTERNAL",
        }
    }

    /// Numeric business code carried in the response envelope
    pub fn business_code(&self) -> i32 {
        match self {
            LedgerError::InvalidAmount(_) => 1001,
            LedgerError::InvalidRates(_) => 1002,
            LedgerError::Validation(_) => 400,
            LedgerError::NotFound { .. } => 404,
            LedgerError::Forbidden(_) => 403,
            LedgerError::AlreadyAudited(_) => 1101,
            LedgerError::ShopAlreadyBound(_) => 1102,
            LedgerError::DuplicateTxNo(_) => 1103,
            LedgerError::Conflict(_) => 1100,
            LedgerError::InsufficientBalance => 1200,
            LedgerError::InvalidUnfreeze => 1201,
            LedgerError::LockContended(_) => 1300,
            LedgerError::UpstreamTransient(_) => 1400,
            LedgerError::UpstreamTerminal(_) => 1401,
            LedgerError::Integrity(_) | LedgerError::LeaseLost(_) => 1499,
            LedgerError::CoordinationUnavailable(_)
            | LedgerError::Database(_)
            | LedgerError::Cancelled
            | LedgerError::Internal(_) => 500,
        }
    }

    /// Lock contention is "try later", never a failure
    pub fn is_contention(&self) -> bool {
        self.kind() == ErrorKind::LockContended
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e
            && db_err.is_unique_violation()
            && db_err
                .constraint()
                .is_some_and(|c| c.starts_with("journal_tx_nos"))
        {
            return LedgerError::DuplicateTxNo(db_err.message().to_string());
        }
        LedgerError::Database(e.to_string())
    }
}

impl From<MoneyError> for LedgerError {
    fn from(e: MoneyError) -> Self {
        LedgerError::InvalidAmount(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            LedgerError::InsufficientBalance.kind(),
            ErrorKind::InsufficientBalance
        );
        assert_eq!(LedgerError::InvalidUnfreeze.kind(), ErrorKind::InsufficientBalance);
        assert_eq!(LedgerError::AlreadyAudited(1).kind(), ErrorKind::Conflict);
        assert_eq!(LedgerError::LeaseLost("x".into()).kind(), ErrorKind::Integrity);
        assert!(LedgerError::LockContended("account:operator:1".into()).is_contention());
    }

    #[test]
    fn test_business_codes() {
        assert_eq!(LedgerError::InsufficientBalance.business_code(), 1200);
        assert_eq!(LedgerError::not_found("order", "A1").business_code(), 404);
        assert_eq!(LedgerError::Internal("x".into()).business_code(), 500);
        assert_eq!(LedgerError::UpstreamTerminal("x".into()).business_code(), 1401);
    }

    #[test]
    fn test_display() {
        assert_eq!(LedgerError::InsufficientBalance.to_string(), "Insufficient balance");
        assert_eq!(
            LedgerError::not_found("withdraw application", 7).to_string(),
            "withdraw application not found: 7"
        );
    }

    #[test]
    fn test_money_error_maps_to_invalid_amount() {
        let err: LedgerError = MoneyError::NotPositive.into();
        assert_eq!(err.code(), "INVALID_AMOUNT");
    }
}
