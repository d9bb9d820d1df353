//! Billing event audit stream
//!
//! Append-only record of every billing-relevant state change. Business
//! operations emit events after their own commit; consumers (notification
//! senders, admin dashboards) read the stream independently, so ledger
//! correctness never depends on a downstream channel being available.

use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    DepositCreated,
    PaymentConfirmed,
    PaymentFailed,
    PromocodeApplied,
    ReferralBonus,
    ServerRenewed,
    ServerSuspended,
    ServerTerminated,
    InvoiceCreated,
    InvoicePaid,
    InvoiceOverdue,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::DepositCreated => "deposit_created",
            BillingEventType::PaymentConfirmed => "payment_confirmed",
            BillingEventType::PaymentFailed => "payment_failed",
            BillingEventType::PromocodeApplied => "promocode_applied",
            BillingEventType::ReferralBonus => "referral_bonus",
            BillingEventType::ServerRenewed => "server_renewed",
            BillingEventType::ServerSuspended => "server_suspended",
            BillingEventType::ServerTerminated => "server_terminated",
            BillingEventType::InvoiceCreated => "invoice_created",
            BillingEventType::InvoicePaid => "invoice_paid",
            BillingEventType::InvoiceOverdue => "invoice_overdue",
        }
    }
}

/// Who triggered the change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Admin,
    System,
    Webhook,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Admin => "admin",
            ActorType::System => "system",
            ActorType::Webhook => "webhook",
        }
    }
}

/// Stored billing event
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub event_type: String,
    pub actor_type: String,
    pub user_id: Option<Uuid>,
    pub context: Value,
    pub created_at: OffsetDateTime,
}

/// Writes billing events; a failed write is logged, never propagated
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record an event. Infallible from the caller's perspective.
    pub async fn log(
        &self,
        event_type: BillingEventType,
        actor_type: ActorType,
        user_id: Option<Uuid>,
        context: Value,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_events (event_type, actor_type, user_id, context)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event_type.as_str())
        .bind(actor_type.as_str())
        .bind(user_id)
        .bind(&context)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(
                event_type = event_type.as_str(),
                error = %e,
                "Failed to record billing event"
            );
        }
    }

    /// Recent events for a user, newest first
    pub async fn events_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events = sqlx::query_as::<_, BillingEvent>(
            r#"
            SELECT id, event_type, actor_type, user_id, context, created_at
            FROM billing_events
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_strings_are_snake_case() {
        assert_eq!(BillingEventType::PaymentConfirmed.as_str(), "payment_confirmed");
        assert_eq!(BillingEventType::ServerSuspended.as_str(), "server_suspended");
        assert_eq!(ActorType::Webhook.as_str(), "webhook");
    }
}
