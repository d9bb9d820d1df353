//! Promocode and referral bonuses
//!
//! Promocode redemption is one atomic unit: the bonus ledger entry, the
//! usage row, the used-count increment and the balance write commit
//! together. The `(promocode_id, user_id)` UNIQUE constraint on the usage
//! table is the final guard against a concurrent double redemption; the
//! application-level existence check only exists to produce a clean
//! `AlreadyUsed` instead of a constraint violation.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{is_unique_violation, BillingError, BillingResult};
use crate::events::{ActorType, BillingEventLogger, BillingEventType};
use crate::ledger::{Transaction, TRANSACTION_COLUMNS};

/// Promocode row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Promocode {
    pub id: Uuid,
    pub code: String,
    pub bonus_amount: Decimal,
    pub max_uses: Option<i32>,
    pub used_count: i32,
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Applies promocode bonuses as specialized ledger transactions
#[derive(Clone)]
pub struct PromotionService {
    pool: PgPool,
    events: BillingEventLogger,
}

impl PromotionService {
    pub fn new(pool: PgPool) -> Self {
        let events = BillingEventLogger::new(pool.clone());
        Self { pool, events }
    }

    /// Look up a promocode by its public code
    pub async fn find_by_code(&self, code: &str) -> BillingResult<Option<Promocode>> {
        let promo = sqlx::query_as::<_, Promocode>(
            r#"
            SELECT id, code, bonus_amount, max_uses, used_count, expires_at, created_at
            FROM promocodes
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(promo)
    }

    /// Redeem a promocode, crediting its bonus to the user's balance
    ///
    /// At most one usage per user per code. Fails with `AlreadyUsed` on a
    /// repeat redemption, `PromocodeNotFound` if the code id is unknown,
    /// `PromocodeExpired`/`PromocodeExhausted` when the code is no longer
    /// redeemable.
    pub async fn apply_promocode_to_balance(
        &self,
        user_id: Uuid,
        promocode_id: Uuid,
        amount: Decimal,
    ) -> BillingResult<Transaction> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(amount));
        }

        let mut tx = self.pool.begin().await?;

        let already_used: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM promocode_usages WHERE promocode_id = $1 AND user_id = $2)",
        )
        .bind(promocode_id)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        if already_used {
            return Err(BillingError::AlreadyUsed);
        }

        // Expiry and the global usage cap gate the increment itself; a zero
        // row count is then diagnosed against the row.
        let updated = sqlx::query(
            r#"
            UPDATE promocodes
            SET used_count = used_count + 1
            WHERE id = $1
              AND (expires_at IS NULL OR expires_at > NOW())
              AND (max_uses IS NULL OR used_count < max_uses)
            "#,
        )
        .bind(promocode_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let row: Option<(Option<OffsetDateTime>,)> = sqlx::query_as(
                "SELECT expires_at FROM promocodes WHERE id = $1",
            )
            .bind(promocode_id)
            .fetch_optional(&mut *tx)
            .await?;

            return Err(match row {
                None => BillingError::PromocodeNotFound(promocode_id),
                Some((Some(expires_at),)) if expires_at <= OffsetDateTime::now_utc() => {
                    BillingError::PromocodeExpired
                }
                Some(_) => BillingError::PromocodeExhausted,
            });
        }

        let balance: Option<(Decimal,)> =
            sqlx::query_as("SELECT balance FROM users WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let balance = balance
            .map(|(b,)| b)
            .ok_or(BillingError::UserNotFound(user_id))?;

        let new_balance = balance + amount;

        let insert_usage = sqlx::query(
            "INSERT INTO promocode_usages (promocode_id, user_id) VALUES ($1, $2)",
        )
        .bind(promocode_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert_usage {
            if is_unique_violation(&e) {
                return Err(BillingError::AlreadyUsed);
            }
            return Err(e.into());
        }

        let transaction = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            INSERT INTO transactions
                (user_id, tx_type, amount, balance_before, balance_after,
                 description, status, metadata)
            VALUES ($1, 'promocode', $2, $3, $4, $5, 'completed', $6)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(amount)
        .bind(balance)
        .bind(new_balance)
        .bind("Promocode bonus")
        .bind(serde_json::json!({ "promocode_id": promocode_id }))
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE users SET balance = $2 WHERE id = $1")
            .bind(user_id)
            .bind(new_balance)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            promocode_id = %promocode_id,
            amount = %amount,
            "Promocode applied"
        );

        self.events
            .log(
                BillingEventType::PromocodeApplied,
                ActorType::User,
                Some(user_id),
                serde_json::json!({ "promocode_id": promocode_id, "amount": amount }),
            )
            .await;

        Ok(transaction)
    }
}
