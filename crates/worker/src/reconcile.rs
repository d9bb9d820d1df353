//! Pending-payment reconciliation
//!
//! The polling half of webhook-or-poll confirmation: pending deposits that
//! have gone quiet are looked up at their provider and resolved through the
//! same idempotent confirm/fail path the webhooks use. A webhook landing
//! mid-poll is harmless - whoever flips the row first wins and the loser
//! gets `TransactionNotFound`.

use std::time::Duration;

use hostara_billing::{
    BillingEmailService, BillingError, PaymentConfirmationService, PaymentGatewayService,
    ProviderKind, RemotePaymentStatus,
};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info, warn};

/// Only poll payments that have been pending at least this long; fresh ones
/// are still likely to get a webhook.
const MIN_PENDING_AGE_MINUTES: i32 = 10;

/// Poll every stale pending payment once and resolve what has settled
pub async fn reconcile_pending_payments(
    gateway: &PaymentGatewayService,
    confirmation: &PaymentConfirmationService,
    email: &BillingEmailService,
) {
    let stale = match confirmation
        .stale_pending_payments(MIN_PENDING_AGE_MINUTES)
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "Failed to list stale pending payments");
            return;
        }
    };

    if stale.is_empty() {
        return;
    }

    let total = stale.len();
    let mut confirmed = 0;
    let mut failed = 0;
    let mut still_pending = 0;
    let mut errors = 0;

    for payment in stale {
        let Some(provider) = ProviderKind::from_str(&payment.payment_method) else {
            warn!(
                user_id = %payment.user_id,
                payment_method = %payment.payment_method,
                "Pending payment has unknown provider - skipping"
            );
            errors += 1;
            continue;
        };
        let payment_id = &payment.payment_id;

        // Status lookups are cheap and transient failures are common;
        // retry a couple of times with backoff before giving up this cycle.
        let retry_strategy = ExponentialBackoff::from_millis(200)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(2);

        let status = Retry::spawn(retry_strategy, || gateway.get_payment(provider, payment_id))
            .await;

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    payment_id = %payment_id,
                    provider = provider.as_str(),
                    error = %e,
                    "Provider status lookup failed - will retry next cycle"
                );
                errors += 1;
                continue;
            }
        };

        let outcome = match status {
            RemotePaymentStatus::Completed => {
                confirmation.confirm_payment(payment_id, provider).await
            }
            RemotePaymentStatus::Failed => {
                confirmation
                    .fail_payment(payment_id, provider, Some("provider reported failure"))
                    .await
            }
            RemotePaymentStatus::Cancelled => {
                confirmation
                    .fail_payment(payment_id, provider, Some("cancelled at provider"))
                    .await
            }
            RemotePaymentStatus::Pending => {
                still_pending += 1;
                continue;
            }
        };

        match (outcome, status) {
            (Ok(tx), RemotePaymentStatus::Completed) => {
                confirmed += 1;
                // The reconciler observed the COMPLETED transition, so the
                // reconciler sends the top-up confirmation.
                email
                    .send_topup_confirmation(&payment.user_email, tx.amount, tx.balance_after)
                    .await;
            }
            (Ok(_), _) => failed += 1,
            (Err(BillingError::TransactionNotFound), _) => {
                // A webhook beat us to it
                info!(payment_id = %payment_id, "Payment already resolved");
            }
            (Err(e), _) => {
                error!(
                    payment_id = %payment_id,
                    provider = provider.as_str(),
                    error = %e,
                    "Failed to resolve payment"
                );
                errors += 1;
            }
        }
    }

    info!(
        total = total,
        confirmed = confirmed,
        failed = failed,
        still_pending = still_pending,
        errors = errors,
        "Payment reconciliation cycle complete"
    );
}
