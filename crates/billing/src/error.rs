//! Billing error types
//!
//! One error enum for the whole crate. Business-rule failures are typed
//! variants so callers can branch on them; storage and provider failures
//! carry their message.

use rust_decimal::Decimal;
use uuid::Uuid;

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors produced by billing operations
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("user not found: {0}")]
    UserNotFound(Uuid),

    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: Decimal, required: Decimal },

    /// Also returned when confirming an already-resolved payment. Callers
    /// should treat this as "likely already handled", not as an alert.
    #[error("transaction not found")]
    TransactionNotFound,

    #[error("transaction is not refundable")]
    NotRefundable,

    #[error("transaction has already been refunded")]
    AlreadyRefunded,

    #[error("promocode not found: {0}")]
    PromocodeNotFound(Uuid),

    #[error("promocode already used by this user")]
    AlreadyUsed,

    #[error("promocode has expired")]
    PromocodeExpired,

    #[error("promocode has reached its usage limit")]
    PromocodeExhausted,

    #[error("invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("invoice not found: {0}")]
    InvoiceNotFound(Uuid),

    #[error("invalid invoice status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("payment provider error: {0}")]
    Provider(String),

    #[error("missing configuration: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        BillingError::Provider(e.to_string())
    }
}

/// Postgres unique-constraint violation (SQLSTATE 23505).
///
/// Used where an application-level existence check races with a concurrent
/// insert and the storage constraint is the final guard.
pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}
