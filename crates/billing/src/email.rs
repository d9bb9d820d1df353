//! Billing email notifications
//!
//! Fire-and-forget: every send swallows its own failure and logs it. A
//! notification failure never rolls back or blocks the ledger or renewal
//! operation that triggered it, and callers invoke these only after their
//! own state has committed.

use rust_decimal::Decimal;
use serde_json::json;
use time::OffsetDateTime;

/// HTTP email sender
///
/// Talks to a JSON email API. With no API key configured the service is
/// disabled and sends become debug-logged no-ops, which keeps local
/// development and tests quiet.
#[derive(Clone)]
pub struct BillingEmailService {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from_address: String,
    enabled: bool,
}

impl BillingEmailService {
    pub fn from_env() -> Self {
        let api_key = std::env::var("EMAIL_API_KEY").unwrap_or_default();
        let api_url = std::env::var("EMAIL_API_URL")
            .unwrap_or_else(|_| "https://api.resend.com/emails".to_string());
        let from_address = std::env::var("EMAIL_FROM")
            .unwrap_or_else(|_| "Hostara Billing <billing@hostara.io>".to_string());
        let enabled = !api_key.is_empty();

        if !enabled {
            tracing::warn!("EMAIL_API_KEY not set - billing emails disabled");
        }

        Self {
            client: reqwest::Client::new(),
            api_url,
            api_key,
            from_address,
            enabled,
        }
    }

    /// Low-level send. Failures are logged and dropped.
    pub async fn send(&self, to: &str, subject: &str, html: &str) {
        if !self.enabled {
            tracing::debug!(to = to, subject = subject, "Email disabled - skipping send");
            return;
        }

        let body = json!({
            "from": self.from_address,
            "to": [to],
            "subject": subject,
            "html": html,
        });

        match self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = to, subject = subject, "Email sent");
            }
            Ok(resp) => {
                tracing::warn!(
                    to = to,
                    subject = subject,
                    status = %resp.status(),
                    "Email API rejected send"
                );
            }
            Err(e) => {
                tracing::warn!(to = to, subject = subject, error = %e, "Email send failed");
            }
        }
    }

    /// Balance top-up confirmation
    pub async fn send_topup_confirmation(&self, to: &str, amount: Decimal, new_balance: Decimal) {
        let html = format!(
            "<p>Your balance top-up of <strong>${amount}</strong> has been credited.</p>\
             <p>Current balance: <strong>${new_balance}</strong></p>"
        );
        self.send(to, "Balance top-up confirmed", &html).await;
    }

    /// Server renewed successfully
    pub async fn send_server_renewed(
        &self,
        to: &str,
        server_name: &str,
        charged: Decimal,
        expires_at: OffsetDateTime,
    ) {
        let html = format!(
            "<p>Your server <strong>{server_name}</strong> has been renewed for ${charged}.</p>\
             <p>New expiry date: {}</p>",
            expires_at.date()
        );
        self.send(to, &format!("Server {server_name} renewed"), &html)
            .await;
    }

    /// Expiry warning, sent at 3 days and 1 day before expiry
    ///
    /// `can_auto_renew` tells the customer whether their balance covers the
    /// upcoming renewal; no charge happens here.
    pub async fn send_server_expiring(
        &self,
        to: &str,
        server_name: &str,
        days_left: i64,
        can_auto_renew: bool,
    ) {
        let action = if can_auto_renew {
            "It will renew automatically."
        } else {
            "Your balance does not cover the renewal - please top up to avoid suspension."
        };
        let html = format!(
            "<p>Your server <strong>{server_name}</strong> expires in {days_left} day(s).</p>\
             <p>{action}</p>"
        );
        self.send(
            to,
            &format!("Server {server_name} expires in {days_left} day(s)"),
            &html,
        )
        .await;
    }

    /// Server suspended (renewal failed or auto-renew off)
    pub async fn send_server_suspended(&self, to: &str, server_name: &str, reason: &str) {
        let html = format!(
            "<p>Your server <strong>{server_name}</strong> has been suspended.</p>\
             <p>Reason: {reason}</p>\
             <p>Top up your balance and renew to restore service before it is terminated.</p>"
        );
        self.send(to, &format!("Server {server_name} suspended"), &html)
            .await;
    }

    /// Invoice delivery with the rendered document inline
    pub async fn send_invoice(&self, to: &str, number: &str, document_html: &str) {
        self.send(to, &format!("Invoice {number}"), document_html)
            .await;
    }
}
