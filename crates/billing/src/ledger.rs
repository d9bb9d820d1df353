//! Balance ledger
//!
//! Every balance change is expressed as one immutable transaction row with a
//! before/after balance snapshot, created inside the same database
//! transaction that writes the new balance back to the user. The transaction
//! rows are the source of truth; the stored balance is a running sum that
//! must never drift from them.
//!
//! The read-modify-write of a user's balance is serialized with
//! `SELECT ... FOR UPDATE` on the user row, so concurrent operations on the
//! same user cannot lose updates. Operations on different users do not
//! contend.

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventLogger, BillingEventType};

/// Transaction type discriminants, stored as lowercase text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Purchase,
    Refund,
    Bonus,
    Referral,
    Promocode,
    Withdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Purchase => "purchase",
            TransactionType::Refund => "refund",
            TransactionType::Bonus => "bonus",
            TransactionType::Referral => "referral",
            TransactionType::Promocode => "promocode",
            TransactionType::Withdrawal => "withdrawal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "deposit" => Some(TransactionType::Deposit),
            "purchase" => Some(TransactionType::Purchase),
            "refund" => Some(TransactionType::Refund),
            "bonus" => Some(TransactionType::Bonus),
            "referral" => Some(TransactionType::Referral),
            "promocode" => Some(TransactionType::Promocode),
            "withdrawal" => Some(TransactionType::Withdrawal),
            _ => None,
        }
    }

    /// Debit types are the only refundable ones
    pub fn is_debit(&self) -> bool {
        matches!(self, TransactionType::Purchase | TransactionType::Withdrawal)
    }
}

/// Transaction status, stored as lowercase text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            "cancelled" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }
}

/// Immutable ledger entry
///
/// `balance_before`/`balance_after` are snapshots taken at the moment the
/// row reached its current status. They are historical fact and are never
/// recomputed; status may transition (pending -> completed/failed) but the
/// monetary fields are write-once after that.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tx_type: String,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub description: Option<String>,
    pub payment_method: Option<String>,
    pub payment_id: Option<String>,
    pub status: String,
    pub metadata: Option<Value>,
    pub created_at: OffsetDateTime,
}

pub(crate) const TRANSACTION_COLUMNS: &str =
    "id, user_id, tx_type, amount, balance_before, balance_after, \
     description, payment_method, payment_id, status, metadata, created_at";

/// Atomic balance mutation primitive
#[derive(Clone)]
pub struct LedgerService {
    pool: PgPool,
    events: BillingEventLogger,
}

impl LedgerService {
    pub fn new(pool: PgPool) -> Self {
        let events = BillingEventLogger::new(pool.clone());
        Self { pool, events }
    }

    /// Credit a user's balance
    ///
    /// Used for confirmed top-ups and admin credits. The ledger itself puts
    /// no upper bound on deposits.
    pub async fn deposit(
        &self,
        user_id: Uuid,
        amount: Decimal,
        description: Option<&str>,
        payment_method: Option<&str>,
        payment_id: Option<&str>,
        metadata: Option<Value>,
    ) -> BillingResult<Transaction> {
        ensure_positive(amount)?;

        let mut tx = self.pool.begin().await?;
        let balance = lock_balance(&mut tx, user_id).await?;
        let new_balance = balance + amount;

        let transaction = insert_transaction(
            &mut tx,
            NewTransaction {
                user_id,
                tx_type: TransactionType::Deposit,
                amount,
                balance_before: balance,
                balance_after: new_balance,
                description,
                payment_method,
                payment_id,
                status: TransactionStatus::Completed,
                metadata,
            },
        )
        .await?;

        write_balance(&mut tx, user_id, new_balance).await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            amount = %amount,
            new_balance = %new_balance,
            "Deposit completed"
        );

        self.events
            .log(
                BillingEventType::DepositCreated,
                ActorType::System,
                Some(user_id),
                serde_json::json!({ "amount": amount, "status": "completed" }),
            )
            .await;

        Ok(transaction)
    }

    /// Record a deposit that is awaiting provider confirmation
    ///
    /// The balance is untouched; the pending row carries provisional
    /// snapshots that the confirmation service refreshes when the provider
    /// reports success.
    pub async fn record_pending_deposit(
        &self,
        user_id: Uuid,
        amount: Decimal,
        payment_method: &str,
        payment_id: &str,
        description: Option<&str>,
        metadata: Option<Value>,
    ) -> BillingResult<Transaction> {
        ensure_positive(amount)?;

        let mut tx = self.pool.begin().await?;
        let balance = lock_balance(&mut tx, user_id).await?;

        let transaction = insert_transaction(
            &mut tx,
            NewTransaction {
                user_id,
                tx_type: TransactionType::Deposit,
                amount,
                balance_before: balance,
                balance_after: balance + amount,
                description,
                payment_method: Some(payment_method),
                payment_id: Some(payment_id),
                status: TransactionStatus::Pending,
                metadata,
            },
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            amount = %amount,
            payment_method = payment_method,
            payment_id = payment_id,
            "Pending deposit recorded"
        );

        self.events
            .log(
                BillingEventType::DepositCreated,
                ActorType::User,
                Some(user_id),
                serde_json::json!({
                    "amount": amount,
                    "status": "pending",
                    "payment_method": payment_method,
                    "payment_id": payment_id,
                }),
            )
            .await;

        Ok(transaction)
    }

    /// Debit a user's balance
    ///
    /// Fails with `InsufficientFunds` when the balance does not cover the
    /// amount; nothing is written in that case. The amount is stored
    /// negative, typed as a purchase.
    pub async fn withdraw(
        &self,
        user_id: Uuid,
        amount: Decimal,
        description: Option<&str>,
    ) -> BillingResult<Transaction> {
        ensure_positive(amount)?;

        let mut tx = self.pool.begin().await?;
        let balance = lock_balance(&mut tx, user_id).await?;

        if balance < amount {
            return Err(BillingError::InsufficientFunds {
                balance,
                required: amount,
            });
        }

        let new_balance = balance - amount;

        let transaction = insert_transaction(
            &mut tx,
            NewTransaction {
                user_id,
                tx_type: TransactionType::Purchase,
                amount: -amount,
                balance_before: balance,
                balance_after: new_balance,
                description,
                payment_method: None,
                payment_id: None,
                status: TransactionStatus::Completed,
                metadata: None,
            },
        )
        .await?;

        write_balance(&mut tx, user_id, new_balance).await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            amount = %amount,
            new_balance = %new_balance,
            "Withdrawal completed"
        );

        Ok(transaction)
    }

    /// Reverse a completed purchase, crediting its absolute amount back
    ///
    /// Refund rows back-reference the original via `metadata.refund_of`;
    /// a second refund attempt against the same original fails with
    /// `AlreadyRefunded`.
    pub async fn refund(
        &self,
        transaction_id: Uuid,
        reason: Option<&str>,
    ) -> BillingResult<Transaction> {
        let mut tx = self.pool.begin().await?;

        let original: Option<Transaction> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await?;

        let original = original.ok_or(BillingError::TransactionNotFound)?;

        let refundable = TransactionType::from_str(&original.tx_type)
            .map(|t| t.is_debit())
            .unwrap_or(false)
            && original.status == TransactionStatus::Completed.as_str();
        if !refundable {
            return Err(BillingError::NotRefundable);
        }

        let already_refunded: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM transactions
                WHERE tx_type = 'refund'
                  AND status = 'completed'
                  AND metadata->>'refund_of' = $1::TEXT
            )
            "#,
        )
        .bind(transaction_id)
        .fetch_one(&mut *tx)
        .await?;

        if already_refunded {
            return Err(BillingError::AlreadyRefunded);
        }

        let balance = lock_balance(&mut tx, original.user_id).await?;
        let credit = original.amount.abs();
        let new_balance = balance + credit;

        let description = match reason {
            Some(r) => format!("Refund of transaction {} ({})", original.id, r),
            None => format!("Refund of transaction {}", original.id),
        };

        let transaction = insert_transaction(
            &mut tx,
            NewTransaction {
                user_id: original.user_id,
                tx_type: TransactionType::Refund,
                amount: credit,
                balance_before: balance,
                balance_after: new_balance,
                description: Some(&description),
                payment_method: None,
                payment_id: None,
                status: TransactionStatus::Completed,
                metadata: Some(serde_json::json!({ "refund_of": original.id })),
            },
        )
        .await?;

        write_balance(&mut tx, original.user_id, new_balance).await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %original.user_id,
            original_id = %original.id,
            amount = %credit,
            "Refund completed"
        );

        Ok(transaction)
    }

    /// Credit a referral bonus
    ///
    /// Increments the separate referral counter alongside the main balance;
    /// both writes share the atomic unit with the ledger entry.
    pub async fn referral_bonus(
        &self,
        user_id: Uuid,
        amount: Decimal,
        referred_user_id: Uuid,
    ) -> BillingResult<Transaction> {
        ensure_positive(amount)?;

        let mut tx = self.pool.begin().await?;
        let balance = lock_balance(&mut tx, user_id).await?;
        let new_balance = balance + amount;

        let transaction = insert_transaction(
            &mut tx,
            NewTransaction {
                user_id,
                tx_type: TransactionType::Referral,
                amount,
                balance_before: balance,
                balance_after: new_balance,
                description: Some("Referral bonus"),
                payment_method: None,
                payment_id: None,
                status: TransactionStatus::Completed,
                metadata: Some(serde_json::json!({ "referred_user_id": referred_user_id })),
            },
        )
        .await?;

        sqlx::query(
            "UPDATE users SET balance = $2, referral_balance = referral_balance + $3 WHERE id = $1",
        )
        .bind(user_id)
        .bind(new_balance)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            referred_user_id = %referred_user_id,
            amount = %amount,
            "Referral bonus credited"
        );

        self.events
            .log(
                BillingEventType::ReferralBonus,
                ActorType::System,
                Some(user_id),
                serde_json::json!({
                    "amount": amount,
                    "referred_user_id": referred_user_id,
                }),
            )
            .await;

        Ok(transaction)
    }

    /// Current stored balance for a user
    pub async fn balance(&self, user_id: Uuid) -> BillingResult<Decimal> {
        let balance: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        balance.ok_or(BillingError::UserNotFound(user_id))
    }

    /// Full transaction history for a user, newest first
    pub async fn transactions_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

struct NewTransaction<'a> {
    user_id: Uuid,
    tx_type: TransactionType,
    amount: Decimal,
    balance_before: Decimal,
    balance_after: Decimal,
    description: Option<&'a str>,
    payment_method: Option<&'a str>,
    payment_id: Option<&'a str>,
    status: TransactionStatus,
    metadata: Option<Value>,
}

fn ensure_positive(amount: Decimal) -> BillingResult<()> {
    if amount <= Decimal::ZERO {
        return Err(BillingError::InvalidAmount(amount));
    }
    Ok(())
}

/// Lock the user row for the duration of the surrounding DB transaction
async fn lock_balance(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    user_id: Uuid,
) -> BillingResult<Decimal> {
    let row: Option<(Decimal,)> =
        sqlx::query_as("SELECT balance FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?;

    row.map(|(balance,)| balance)
        .ok_or(BillingError::UserNotFound(user_id))
}

async fn write_balance(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    user_id: Uuid,
    balance: Decimal,
) -> BillingResult<()> {
    sqlx::query("UPDATE users SET balance = $2 WHERE id = $1")
        .bind(user_id)
        .bind(balance)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

async fn insert_transaction(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    new: NewTransaction<'_>,
) -> BillingResult<Transaction> {
    let transaction = sqlx::query_as::<_, Transaction>(&format!(
        r#"
        INSERT INTO transactions
            (user_id, tx_type, amount, balance_before, balance_after,
             description, payment_method, payment_id, status, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING {TRANSACTION_COLUMNS}
        "#
    ))
    .bind(new.user_id)
    .bind(new.tx_type.as_str())
    .bind(new.amount)
    .bind(new.balance_before)
    .bind(new.balance_after)
    .bind(new.description)
    .bind(new.payment_method)
    .bind(new.payment_id)
    .bind(new.status.as_str())
    .bind(new.metadata)
    .fetch_one(&mut **tx)
    .await?;

    Ok(transaction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ensure_positive_rejects_zero_and_negative() {
        assert!(ensure_positive(dec!(0)).is_err());
        assert!(ensure_positive(dec!(-5)).is_err());
        assert!(ensure_positive(dec!(0.01)).is_ok());
    }

    #[test]
    fn test_transaction_type_round_trip() {
        for t in [
            TransactionType::Deposit,
            TransactionType::Purchase,
            TransactionType::Refund,
            TransactionType::Bonus,
            TransactionType::Referral,
            TransactionType::Promocode,
            TransactionType::Withdrawal,
        ] {
            assert_eq!(TransactionType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(TransactionType::from_str("chargeback"), None);
    }

    #[test]
    fn test_only_debit_types_are_refundable() {
        assert!(TransactionType::Purchase.is_debit());
        assert!(TransactionType::Withdrawal.is_debit());
        assert!(!TransactionType::Deposit.is_debit());
        assert!(!TransactionType::Refund.is_debit());
        assert!(!TransactionType::Promocode.is_debit());
    }
}
