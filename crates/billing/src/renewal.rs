//! Server renewal sweep
//!
//! Single-pass batch job with three independent phases, run on a schedule:
//!
//! 1. Expired-server resolution: charge and extend auto-renew servers,
//!    suspend the rest.
//! 2. Expiry warnings at exactly 3 days and 1 day out.
//! 3. Termination of servers suspended past the grace period.
//!
//! Failures are per-server: one server's renewal failure never aborts the
//! sweep; everything is accumulated into the returned summary. The whole
//! sweep is safe to re-run - phase 1 keys off each server's own expiry
//! state, so a repeat run after a successful renewal finds nothing to do.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::BillingEmailService;
use crate::error::BillingResult;
use crate::events::{ActorType, BillingEventLogger, BillingEventType};
use crate::ledger::LedgerService;

/// Renewal extends from the current expiry, not from "now", so late sweeps
/// do not drift the billing anchor.
const RENEWAL_PERIOD_DAYS: i64 = 30;

const DEFAULT_GRACE_DAYS: i64 = 7;

/// Days-before-expiry boundaries that trigger a warning
const WARNING_DAYS: &[i64] = &[3, 1];

const EXPIRY_LOOKAHEAD_DAYS: i64 = 3;

/// Result of one sweep
#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub started_at: OffsetDateTime,
    pub renewed: u32,
    pub suspended: u32,
    pub terminated: u32,
    pub warnings_sent: u32,
    pub errors: Vec<SweepError>,
}

/// A per-server failure captured during the sweep
#[derive(Debug, Clone, Serialize)]
pub struct SweepError {
    pub server_id: Uuid,
    pub error: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ExpiredServerRow {
    server_id: Uuid,
    server_name: String,
    user_id: Uuid,
    user_email: String,
    auto_renew: bool,
    plan_name: String,
    plan_price: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct ExpiringServerRow {
    server_id: Uuid,
    server_name: String,
    user_email: String,
    notify_billing: bool,
    expires_at: OffsetDateTime,
    balance: Decimal,
    plan_price: Decimal,
}

/// The renewal scheduler's sweep implementation
#[derive(Clone)]
pub struct RenewalService {
    pool: PgPool,
    ledger: LedgerService,
    email: BillingEmailService,
    events: BillingEventLogger,
    grace_days: i64,
}

impl RenewalService {
    pub fn new(pool: PgPool, email: BillingEmailService) -> Self {
        let grace_days = std::env::var("RENEWAL_GRACE_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_GRACE_DAYS);

        Self {
            ledger: LedgerService::new(pool.clone()),
            events: BillingEventLogger::new(pool.clone()),
            pool,
            email,
            grace_days,
        }
    }

    /// Run one full sweep
    pub async fn run_sweep(&self) -> SweepSummary {
        let now = OffsetDateTime::now_utc();
        let mut summary = SweepSummary {
            started_at: now,
            renewed: 0,
            suspended: 0,
            terminated: 0,
            warnings_sent: 0,
            errors: Vec::new(),
        };

        if let Err(e) = self.resolve_expired(now, &mut summary).await {
            tracing::error!(error = %e, "Expired-server resolution phase failed");
        }
        if let Err(e) = self.send_expiry_warnings(now, &mut summary).await {
            tracing::error!(error = %e, "Expiry-warning phase failed");
        }
        if let Err(e) = self.terminate_abandoned(now, &mut summary).await {
            tracing::error!(error = %e, "Abandoned-termination phase failed");
        }

        tracing::info!(
            renewed = summary.renewed,
            suspended = summary.suspended,
            terminated = summary.terminated,
            warnings_sent = summary.warnings_sent,
            errors = summary.errors.len(),
            "Renewal sweep complete"
        );

        summary
    }

    /// Phase 1: renew or suspend every ACTIVE server past its expiry
    async fn resolve_expired(
        &self,
        now: OffsetDateTime,
        summary: &mut SweepSummary,
    ) -> BillingResult<()> {
        let expired: Vec<ExpiredServerRow> = sqlx::query_as(
            r#"
            SELECT s.id AS server_id, s.name AS server_name, s.user_id,
                   u.email AS user_email, s.auto_renew,
                   p.name AS plan_name, p.price AS plan_price
            FROM servers s
            JOIN users u ON u.id = s.user_id
            JOIN plans p ON p.id = s.plan_id
            WHERE s.status = 'active' AND s.expires_at < $1
            ORDER BY s.expires_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for server in expired {
            if !server.auto_renew {
                self.suspend_server(&server, now, "auto-renewal disabled", summary)
                    .await;
                continue;
            }

            let description = format!(
                "Renewal of server '{}' ({} plan)",
                server.server_name, server.plan_name
            );

            match self
                .ledger
                .withdraw(server.user_id, server.plan_price, Some(&description))
                .await
            {
                Ok(_) => {
                    let extended = self.extend_server(&server).await;
                    match extended {
                        Ok(new_expiry) => {
                            summary.renewed += 1;
                            self.email
                                .send_server_renewed(
                                    &server.user_email,
                                    &server.server_name,
                                    server.plan_price,
                                    new_expiry,
                                )
                                .await;
                            self.events
                                .log(
                                    BillingEventType::ServerRenewed,
                                    ActorType::System,
                                    Some(server.user_id),
                                    serde_json::json!({
                                        "server_id": server.server_id,
                                        "charged": server.plan_price,
                                        "expires_at": new_expiry,
                                    }),
                                )
                                .await;
                        }
                        Err(e) => {
                            // Charged but not extended - surface loudly, do
                            // not suspend on top of the charge.
                            tracing::error!(
                                server_id = %server.server_id,
                                error = %e,
                                "Server charged for renewal but expiry extension failed"
                            );
                            summary.errors.push(SweepError {
                                server_id: server.server_id,
                                error: e.to_string(),
                            });
                        }
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.suspend_server(&server, now, &reason, summary).await;
                    if !matches!(e, crate::error::BillingError::InsufficientFunds { .. }) {
                        summary.errors.push(SweepError {
                            server_id: server.server_id,
                            error: reason,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    async fn extend_server(&self, server: &ExpiredServerRow) -> BillingResult<OffsetDateTime> {
        let new_expiry: (OffsetDateTime,) = sqlx::query_as(
            r#"
            UPDATE servers
            SET expires_at = expires_at + make_interval(days => $2),
                status = 'active',
                suspended_at = NULL
            WHERE id = $1
            RETURNING expires_at
            "#,
        )
        .bind(server.server_id)
        .bind(RENEWAL_PERIOD_DAYS as i32)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            server_id = %server.server_id,
            expires_at = %new_expiry.0,
            "Server renewed"
        );

        Ok(new_expiry.0)
    }

    async fn suspend_server(
        &self,
        server: &ExpiredServerRow,
        now: OffsetDateTime,
        reason: &str,
        summary: &mut SweepSummary,
    ) {
        let result = sqlx::query(
            "UPDATE servers SET status = 'suspended', suspended_at = $2 WHERE id = $1",
        )
        .bind(server.server_id)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                summary.suspended += 1;
                tracing::warn!(
                    server_id = %server.server_id,
                    user_id = %server.user_id,
                    reason = reason,
                    "Server suspended"
                );
                self.email
                    .send_server_suspended(&server.user_email, &server.server_name, reason)
                    .await;
                self.events
                    .log(
                        BillingEventType::ServerSuspended,
                        ActorType::System,
                        Some(server.user_id),
                        serde_json::json!({
                            "server_id": server.server_id,
                            "reason": reason,
                        }),
                    )
                    .await;
            }
            Err(e) => {
                tracing::error!(
                    server_id = %server.server_id,
                    error = %e,
                    "Failed to suspend server"
                );
                summary.errors.push(SweepError {
                    server_id: server.server_id,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Phase 2: warn at exactly 3 days and 1 day before expiry
    ///
    /// Warning only on the exact day boundaries keeps a more-than-daily
    /// sweep from spamming every run inside the lookahead window.
    async fn send_expiry_warnings(
        &self,
        now: OffsetDateTime,
        summary: &mut SweepSummary,
    ) -> BillingResult<()> {
        let expiring: Vec<ExpiringServerRow> = sqlx::query_as(
            r#"
            SELECT s.id AS server_id, s.name AS server_name, u.email AS user_email,
                   u.notify_billing, s.expires_at, u.balance, p.price AS plan_price
            FROM servers s
            JOIN users u ON u.id = s.user_id
            JOIN plans p ON p.id = s.plan_id
            WHERE s.status IN ('active', 'suspended')
              AND s.expires_at > $1
              AND s.expires_at <= $1 + make_interval(days => $2)
            "#,
        )
        .bind(now)
        .bind(EXPIRY_LOOKAHEAD_DAYS as i32)
        .fetch_all(&self.pool)
        .await?;

        for server in expiring {
            if !server.notify_billing {
                continue;
            }
            let Some(days_left) = warning_day(server.expires_at, now) else {
                continue;
            };

            let can_auto_renew = server.balance >= server.plan_price;
            self.email
                .send_server_expiring(
                    &server.user_email,
                    &server.server_name,
                    days_left,
                    can_auto_renew,
                )
                .await;
            summary.warnings_sent += 1;

            tracing::info!(
                server_id = %server.server_id,
                days_left = days_left,
                can_auto_renew = can_auto_renew,
                "Expiry warning sent"
            );
        }

        Ok(())
    }

    /// Phase 3: terminate servers suspended past the grace period
    async fn terminate_abandoned(
        &self,
        now: OffsetDateTime,
        summary: &mut SweepSummary,
    ) -> BillingResult<()> {
        let cutoff = now - time::Duration::days(self.grace_days);

        let terminated: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE servers
            SET status = 'terminated'
            WHERE status = 'suspended' AND suspended_at < $1
            RETURNING id, user_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for (server_id, user_id) in &terminated {
            tracing::warn!(server_id = %server_id, user_id = %user_id, "Server terminated");
            self.events
                .log(
                    BillingEventType::ServerTerminated,
                    ActorType::System,
                    Some(*user_id),
                    serde_json::json!({ "server_id": server_id }),
                )
                .await;
        }

        summary.terminated += terminated.len() as u32;
        Ok(())
    }
}

/// Whole days until expiry when it sits on a warning boundary
fn warning_day(expires_at: OffsetDateTime, now: OffsetDateTime) -> Option<i64> {
    let days_left = (expires_at - now).whole_days();
    WARNING_DAYS.contains(&days_left).then_some(days_left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_warning_day_boundaries() {
        let now = datetime!(2025-06-10 12:00 UTC);

        // Exactly 3 whole days out
        assert_eq!(warning_day(datetime!(2025-06-13 12:30 UTC), now), Some(3));
        // Exactly 1 whole day out
        assert_eq!(warning_day(datetime!(2025-06-11 14:00 UTC), now), Some(1));
        // 2 days out is inside the window but not a boundary
        assert_eq!(warning_day(datetime!(2025-06-12 12:30 UTC), now), None);
        // Under a day
        assert_eq!(warning_day(datetime!(2025-06-10 20:00 UTC), now), None);
    }

    #[test]
    fn test_warning_day_ignores_far_expiries() {
        let now = datetime!(2025-06-10 12:00 UTC);
        assert_eq!(warning_day(datetime!(2025-06-20 12:00 UTC), now), None);
        assert_eq!(warning_day(datetime!(2025-06-14 13:00 UTC), now), None);
    }
}
