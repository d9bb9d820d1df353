//! International card rail adapter
//!
//! Authenticates with short-lived OAuth client-credentials tokens. The
//! token lives in an expiry-checked cache owned by the adapter instance,
//! refreshed under a lock when it is within its renewal margin. Amounts are
//! sent as integer minor units; the rail settles in USD, EUR or GBP, so
//! other currencies are converted through the static rate table first.
//!
//! Webhooks carry a `t=<unix>,v1=<hex>` signature header; the signed
//! payload is `"{timestamp}.{body}"` and stale timestamps are rejected.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult};
use crate::rates;

use super::{minor_units, CreatePaymentRequest, PaymentCreated, RemotePaymentStatus};

type HmacSha256 = Hmac<Sha256>;

/// Timestamp tolerance for webhook signatures
const WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Refresh the token this long before it actually expires
const TOKEN_RENEWAL_MARGIN_SECS: i64 = 30;

const SETTLEMENT_CURRENCIES: &[&str] = &["USD", "EUR", "GBP"];

#[derive(Debug, Clone)]
pub struct IntlCardConfig {
    pub api_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub webhook_secret: String,
}

impl IntlCardConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            api_url: require_env("CARD_INTL_API_URL")?,
            client_id: require_env("CARD_INTL_CLIENT_ID")?,
            client_secret: require_env("CARD_INTL_CLIENT_SECRET")?,
            webhook_secret: require_env("CARD_INTL_WEBHOOK_SECRET")?,
        })
    }
}

fn require_env(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{name} not set")))
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct IntlPaymentResponse {
    id: String,
    #[serde(default)]
    checkout_url: Option<String>,
    status: String,
}

fn map_status(status: &str) -> RemotePaymentStatus {
    match status {
        "captured" | "settled" => RemotePaymentStatus::Completed,
        "voided" | "cancelled" => RemotePaymentStatus::Cancelled,
        "declined" | "failed" => RemotePaymentStatus::Failed,
        _ => RemotePaymentStatus::Pending,
    }
}

/// International card processor client
#[derive(Clone)]
pub struct IntlCardProvider {
    client: reqwest::Client,
    config: IntlCardConfig,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl IntlCardProvider {
    pub fn new(config: IntlCardConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            token: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(IntlCardConfig::from_env()?))
    }

    /// Current access token, refreshed on expiry
    async fn access_token(&self) -> BillingResult<String> {
        let mut guard = self.token.lock().await;

        if let Some(cached) = guard.as_ref() {
            let margin = time::Duration::seconds(TOKEN_RENEWAL_MARGIN_SECS);
            if cached.expires_at > OffsetDateTime::now_utc() + margin {
                return Ok(cached.token.clone());
            }
        }

        let resp = self
            .client
            .post(format!("{}/oauth/token", self.config.api_url))
            .json(&serde_json::json!({
                "grant_type": "client_credentials",
                "client_id": self.config.client_id,
                "client_secret": self.config.client_secret,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(BillingError::Provider(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }

        let token: TokenResponse = resp.json().await?;
        let expires_at = OffsetDateTime::now_utc() + time::Duration::seconds(token.expires_in);

        tracing::debug!(expires_at = %expires_at, "Refreshed international card rail token");

        *guard = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at,
        });

        Ok(token.access_token)
    }

    /// Create a remote payment. Never propagates transport errors.
    pub async fn create_payment(&self, req: &CreatePaymentRequest) -> PaymentCreated {
        match self.create_payment_inner(req).await {
            Ok(created) => created,
            Err(e) => {
                tracing::warn!(
                    user_id = %req.user_id,
                    amount = %req.amount,
                    error = %e,
                    "International card payment creation failed"
                );
                PaymentCreated::failed(e.to_string())
            }
        }
    }

    async fn create_payment_inner(
        &self,
        req: &CreatePaymentRequest,
    ) -> BillingResult<PaymentCreated> {
        // Settle in the requested currency when supported, else in USD at
        // the table rate.
        let (amount, currency) = if SETTLEMENT_CURRENCIES.contains(&req.currency.as_str()) {
            (req.amount, req.currency.clone())
        } else {
            (rates::convert(req.amount, &req.currency, "USD")?, "USD".to_string())
        };

        let token = self.access_token().await?;

        let body = serde_json::json!({
            "amount": minor_units(amount)?,
            "currency": currency,
            "capture": true,
            "description": req.description,
            "success_url": req.return_url,
            "metadata": req.metadata,
        });

        let resp = self
            .client
            .post(format!("{}/payments", self.config.api_url))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(BillingError::Provider(format!(
                "international card rail returned {status}: {text}"
            )));
        }

        let payment: IntlPaymentResponse = resp.json().await?;

        tracing::info!(
            payment_id = %payment.id,
            amount = %amount,
            currency = %currency,
            "International card payment created"
        );

        Ok(PaymentCreated::pending(payment.id, payment.checkout_url))
    }

    /// Remote status lookup
    pub async fn get_payment(&self, payment_id: &str) -> BillingResult<RemotePaymentStatus> {
        let token = self.access_token().await?;

        let resp = self
            .client
            .get(format!("{}/payments/{payment_id}", self.config.api_url))
            .bearer_auth(&token)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(BillingError::Provider(format!(
                "international card rail status lookup returned {}",
                resp.status()
            )));
        }

        let payment: IntlPaymentResponse = resp.json().await?;
        Ok(map_status(&payment.status))
    }

    /// Verify a `t=<unix>,v1=<hex>` signature header over `"{t}.{payload}"`
    pub fn verify_webhook(&self, payload: &str, signature_header: &str) -> bool {
        verify_signed_payload(
            &self.config.webhook_secret,
            payload,
            signature_header,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
    }
}

/// Signature check split out so the timestamp is injectable
fn verify_signed_payload(secret: &str, payload: &str, signature_header: &str, now: i64) -> bool {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1]),
                _ => {}
            }
        }
    }

    let (Some(timestamp), Some(v1_signature)) = (timestamp, v1_signature) else {
        tracing::warn!("Malformed international card webhook signature header");
        return false;
    };

    if (now - timestamp).abs() > WEBHOOK_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "International card webhook timestamp outside tolerance"
        );
        return false;
    }

    let signed_payload = format!("{timestamp}.{payload}");
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("International card webhook signature mismatch");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn sign(secret: &str, timestamp: i64, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_signed_payload_accepts_fresh_signature() {
        let payload = r#"{"id":"pay_1"}"#;
        let header = sign("secret", 1_700_000_000, payload);
        assert!(verify_signed_payload("secret", payload, &header, 1_700_000_100));
    }

    #[test]
    fn test_verify_signed_payload_rejects_stale_timestamp() {
        let payload = r#"{"id":"pay_1"}"#;
        let header = sign("secret", 1_700_000_000, payload);
        assert!(!verify_signed_payload(
            "secret",
            payload,
            &header,
            1_700_000_000 + WEBHOOK_TOLERANCE_SECS + 1
        ));
    }

    #[test]
    fn test_verify_signed_payload_rejects_tampering() {
        let header = sign("secret", 1_700_000_000, r#"{"id":"pay_1"}"#);
        assert!(!verify_signed_payload(
            "secret",
            r#"{"id":"pay_2"}"#,
            &header,
            1_700_000_010
        ));
        assert!(!verify_signed_payload(
            "other-secret",
            r#"{"id":"pay_1"}"#,
            &header,
            1_700_000_010
        ));
        assert!(!verify_signed_payload("secret", r#"{"id":"pay_1"}"#, "garbage", 0));
    }

    #[tokio::test]
    async fn test_token_is_cached_until_expiry() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token": "tok_abc", "expires_in": 3600}"#)
            .expect(1)
            .create_async()
            .await;

        let provider = IntlCardProvider::new(IntlCardConfig {
            api_url: server.url(),
            client_id: "cid".to_string(),
            client_secret: "csec".to_string(),
            webhook_secret: "whsec".to_string(),
        });

        assert_eq!(provider.access_token().await.unwrap(), "tok_abc");
        // Second call must come from the cache, not the endpoint
        assert_eq!(provider.access_token().await.unwrap(), "tok_abc");
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_payment_converts_unsupported_currency() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token": "tok_abc", "expires_in": 3600}"#)
            .create_async()
            .await;
        let payment_mock = server
            .mock("POST", "/payments")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "currency": "USD",
                "amount": 2500,
            })))
            .with_status(200)
            .with_body(r#"{"id": "pay_77", "status": "authorized"}"#)
            .create_async()
            .await;

        let provider = IntlCardProvider::new(IntlCardConfig {
            api_url: server.url(),
            client_id: "cid".to_string(),
            client_secret: "csec".to_string(),
            webhook_secret: "whsec".to_string(),
        });

        let result = provider
            .create_payment(&CreatePaymentRequest {
                amount: dec!(100),
                currency: "PLN".to_string(),
                user_id: Uuid::new_v4(),
                description: None,
                return_url: None,
                metadata: None,
            })
            .await;

        payment_mock.assert_async().await;
        assert!(result.success);
        assert_eq!(result.payment_id.as_deref(), Some("pay_77"));
    }
}
