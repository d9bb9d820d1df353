//! Payment confirmation
//!
//! Turns a provider webhook or poll result into a ledger mutation. The
//! idempotency boundary is the `(payment_id, provider)` pair gated on
//! `status = 'pending'`: once a row has been flipped to completed or failed
//! it no longer matches the lookup, so a re-delivered webhook finds nothing
//! and surfaces `TransactionNotFound`. Callers treat that as "likely already
//! handled".

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventLogger, BillingEventType};
use crate::ledger::{Transaction, TRANSACTION_COLUMNS};
use crate::providers::ProviderKind;

/// Applies provider payment outcomes to the ledger
#[derive(Clone)]
pub struct PaymentConfirmationService {
    pool: PgPool,
    events: BillingEventLogger,
}

impl PaymentConfirmationService {
    pub fn new(pool: PgPool) -> Self {
        let events = BillingEventLogger::new(pool.clone());
        Self { pool, events }
    }

    /// Complete a pending payment and credit the user's balance
    ///
    /// One atomic unit: the pending row is located and locked, the user row
    /// is locked, the snapshots are refreshed to the balance at confirmation
    /// time, and both the transaction and the balance commit together.
    pub async fn confirm_payment(
        &self,
        payment_id: &str,
        provider: ProviderKind,
    ) -> BillingResult<Transaction> {
        let mut tx = self.pool.begin().await?;

        let pending: Option<Transaction> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE payment_id = $1 AND payment_method = $2 AND status = 'pending'
            FOR UPDATE
            "#
        ))
        .bind(payment_id)
        .bind(provider.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let pending = pending.ok_or(BillingError::TransactionNotFound)?;

        let balance: Option<(rust_decimal::Decimal,)> =
            sqlx::query_as("SELECT balance FROM users WHERE id = $1 FOR UPDATE")
                .bind(pending.user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let balance = balance
            .map(|(b,)| b)
            .ok_or(BillingError::UserNotFound(pending.user_id))?;

        let new_balance = balance + pending.amount;

        let confirmed = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            UPDATE transactions
            SET status = 'completed', balance_before = $2, balance_after = $3
            WHERE id = $1
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(pending.id)
        .bind(balance)
        .bind(new_balance)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE users SET balance = $2 WHERE id = $1")
            .bind(pending.user_id)
            .bind(new_balance)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %pending.user_id,
            payment_id = payment_id,
            provider = provider.as_str(),
            amount = %pending.amount,
            new_balance = %new_balance,
            "Payment confirmed"
        );

        self.events
            .log(
                BillingEventType::PaymentConfirmed,
                ActorType::Webhook,
                Some(pending.user_id),
                serde_json::json!({
                    "payment_id": payment_id,
                    "provider": provider.as_str(),
                    "amount": pending.amount,
                }),
            )
            .await;

        Ok(confirmed)
    }

    /// Mark a pending payment as failed
    ///
    /// The balance is untouched; the optional reason is appended to the
    /// description so the failure stays visible in transaction history.
    pub async fn fail_payment(
        &self,
        payment_id: &str,
        provider: ProviderKind,
        reason: Option<&str>,
    ) -> BillingResult<Transaction> {
        let failed: Option<Transaction> = sqlx::query_as(&format!(
            r#"
            UPDATE transactions
            SET status = 'failed',
                description = CASE
                    WHEN $3::TEXT IS NULL THEN description
                    ELSE COALESCE(description, '') || ' (' || $3 || ')'
                END
            WHERE payment_id = $1 AND payment_method = $2 AND status = 'pending'
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(payment_id)
        .bind(provider.as_str())
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        let failed = failed.ok_or(BillingError::TransactionNotFound)?;

        tracing::info!(
            user_id = %failed.user_id,
            payment_id = payment_id,
            provider = provider.as_str(),
            reason = reason.unwrap_or("none"),
            "Payment marked failed"
        );

        self.events
            .log(
                BillingEventType::PaymentFailed,
                ActorType::Webhook,
                Some(failed.user_id),
                serde_json::json!({
                    "payment_id": payment_id,
                    "provider": provider.as_str(),
                    "reason": reason,
                }),
            )
            .await;

        Ok(failed)
    }

    /// Pending deposits older than the given age, for poll reconciliation
    pub async fn stale_pending_payments(
        &self,
        older_than_minutes: i32,
    ) -> BillingResult<Vec<StalePendingPayment>> {
        let rows: Vec<StalePendingPayment> = sqlx::query_as(
            r#"
            SELECT t.user_id, u.email AS user_email, t.payment_id, t.payment_method
            FROM transactions t
            JOIN users u ON u.id = t.user_id
            WHERE t.status = 'pending'
              AND t.tx_type = 'deposit'
              AND t.payment_id IS NOT NULL
              AND t.payment_method IS NOT NULL
              AND t.created_at < NOW() - make_interval(mins => $1)
            ORDER BY t.created_at
            "#,
        )
        .bind(older_than_minutes)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// A pending deposit that has gone quiet and should be polled at its provider
#[derive(Debug, sqlx::FromRow)]
pub struct StalePendingPayment {
    pub user_id: Uuid,
    pub user_email: String,
    pub payment_id: String,
    pub payment_method: String,
}
