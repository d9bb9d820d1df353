//! Billing invariants
//!
//! Runnable consistency checks for the ledger and its satellites. Run them
//! after a webhook storm, a sweep, or a migration to confirm the system is
//! in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is a real SQL query
//! 2. **Explanatory**: violations carry enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected, where attributable
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - money may be wrong
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerDriftRow {
    user_id: Uuid,
    balance: Decimal,
    tx_sum: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotMismatchRow {
    tx_id: Uuid,
    user_id: Uuid,
    amount: Decimal,
    balance_before: Decimal,
    balance_after: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicatePendingRow {
    payment_id: String,
    payment_method: String,
    pending_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    user_id: Uuid,
    balance: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct SuspendedNoTimestampRow {
    server_id: Uuid,
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateInvoiceNumberRow {
    number: String,
    invoice_count: i64,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_ledger_sum().await?);
        violations.extend(self.check_snapshot_arithmetic().await?);
        violations.extend(self.check_single_pending_payment().await?);
        violations.extend(self.check_non_negative_balance().await?);
        violations.extend(self.check_suspended_has_timestamp().await?);
        violations.extend(self.check_invoice_numbers_unique().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: stored balance equals the sum of completed transactions
    ///
    /// The balance column is a cache over the ledger; any drift means an
    /// operation bypassed the ledger or half-committed.
    async fn check_ledger_sum(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<LedgerDriftRow> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id, u.balance,
                   COALESCE(SUM(t.amount) FILTER (WHERE t.status = 'completed'), 0) AS tx_sum
            FROM users u
            LEFT JOIN transactions t ON t.user_id = u.id
            GROUP BY u.id, u.balance
            HAVING u.balance != COALESCE(SUM(t.amount) FILTER (WHERE t.status = 'completed'), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ledger_sum".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User balance {} does not equal completed-transaction sum {}",
                    row.balance, row.tx_sum
                ),
                context: serde_json::json!({
                    "balance": row.balance,
                    "tx_sum": row.tx_sum,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: `balance_after - balance_before == amount` on every row
    async fn check_snapshot_arithmetic(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SnapshotMismatchRow> = sqlx::query_as(
            r#"
            SELECT id AS tx_id, user_id, amount, balance_before, balance_after
            FROM transactions
            WHERE balance_after - balance_before != amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "snapshot_arithmetic".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Transaction {} snapshots do not add up: {} + {} != {}",
                    row.tx_id, row.balance_before, row.amount, row.balance_after
                ),
                context: serde_json::json!({
                    "transaction_id": row.tx_id,
                    "amount": row.amount,
                    "balance_before": row.balance_before,
                    "balance_after": row.balance_after,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: at most one PENDING row per (payment_id, provider)
    ///
    /// The pair is the confirmation idempotency key; duplicates would let
    /// one webhook credit a balance twice.
    async fn check_single_pending_payment(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicatePendingRow> = sqlx::query_as(
            r#"
            SELECT payment_id, payment_method, COUNT(*) AS pending_count
            FROM transactions
            WHERE status = 'pending' AND payment_id IS NOT NULL
            GROUP BY payment_id, payment_method
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_pending_payment".to_string(),
                user_ids: vec![],
                description: format!(
                    "Payment ({}, {}) has {} pending transactions (expected 1)",
                    row.payment_id, row.payment_method, row.pending_count
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "payment_method": row.payment_method,
                    "pending_count": row.pending_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: no user balance below zero
    ///
    /// Withdrawal is the only gate, so a negative balance means a check was
    /// bypassed or raced.
    async fn check_non_negative_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> =
            sqlx::query_as("SELECT id AS user_id, balance FROM users WHERE balance < 0")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_balance".to_string(),
                user_ids: vec![row.user_id],
                description: format!("User balance is negative: {}", row.balance),
                context: serde_json::json!({ "balance": row.balance }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: suspended servers carry a suspension timestamp
    ///
    /// Termination is measured from `suspended_at`; without it a server can
    /// sit suspended forever.
    async fn check_suspended_has_timestamp(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SuspendedNoTimestampRow> = sqlx::query_as(
            r#"
            SELECT id AS server_id, user_id
            FROM servers
            WHERE status = 'suspended' AND suspended_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "suspended_has_timestamp".to_string(),
                user_ids: vec![row.user_id],
                description: "Suspended server has no suspended_at timestamp".to_string(),
                context: serde_json::json!({ "server_id": row.server_id }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: invoice numbers are unique
    async fn check_invoice_numbers_unique(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateInvoiceNumberRow> = sqlx::query_as(
            r#"
            SELECT number, COUNT(*) AS invoice_count
            FROM invoices
            GROUP BY number
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_numbers_unique".to_string(),
                user_ids: vec![],
                description: format!(
                    "Invoice number '{}' is used by {} invoices",
                    row.number, row.invoice_count
                ),
                context: serde_json::json!({
                    "number": row.number,
                    "invoice_count": row.invoice_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "ledger_sum" => self.check_ledger_sum().await,
            "snapshot_arithmetic" => self.check_snapshot_arithmetic().await,
            "single_pending_payment" => self.check_single_pending_payment().await,
            "non_negative_balance" => self.check_non_negative_balance().await,
            "suspended_has_timestamp" => self.check_suspended_has_timestamp().await,
            "invoice_numbers_unique" => self.check_invoice_numbers_unique().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "ledger_sum",
            "snapshot_arithmetic",
            "single_pending_payment",
            "non_negative_balance",
            "suspended_has_timestamp",
            "invoice_numbers_unique",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"ledger_sum"));
        assert!(checks.contains(&"snapshot_arithmetic"));
    }
}
