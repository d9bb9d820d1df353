//! Domestic card rail adapter
//!
//! Amounts are sent as decimal strings. Webhooks are signed with
//! HMAC-SHA256 over the raw request body, hex-encoded.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{BillingError, BillingResult};

use super::{CreatePaymentRequest, PaymentCreated, RemotePaymentStatus};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct CardConfig {
    pub api_url: String,
    pub api_key: String,
    pub webhook_secret: String,
}

impl CardConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            api_url: require_env("CARD_API_URL")?,
            api_key: require_env("CARD_API_KEY")?,
            webhook_secret: require_env("CARD_WEBHOOK_SECRET")?,
        })
    }
}

fn require_env(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{name} not set")))
}

#[derive(Debug, Deserialize)]
struct CardPaymentResponse {
    id: String,
    #[serde(default)]
    payment_url: Option<String>,
    status: String,
}

fn map_status(status: &str) -> RemotePaymentStatus {
    match status {
        "succeeded" | "paid" => RemotePaymentStatus::Completed,
        "canceled" | "cancelled" => RemotePaymentStatus::Cancelled,
        "failed" | "declined" => RemotePaymentStatus::Failed,
        _ => RemotePaymentStatus::Pending,
    }
}

/// Domestic card processor client
#[derive(Clone)]
pub struct CardProvider {
    client: reqwest::Client,
    config: CardConfig,
}

impl CardProvider {
    pub fn new(config: CardConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(CardConfig::from_env()?))
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
                    "Card payment creation failed"
                );
                PaymentCreated::failed(e.to_string())
            }
        }
    }

    async fn create_payment_inner(
        &self,
        req: &CreatePaymentRequest,
    ) -> BillingResult<PaymentCreated> {
        let body = serde_json::json!({
            "amount": req.amount.to_string(),
            "currency": req.currency,
            "description": req.description,
            "return_url": req.return_url,
            "metadata": req.metadata,
        });

        let resp = self
            .client
            .post(format!("{}/payments", self.config.api_url))
            .header("X-Api-Key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(BillingError::Provider(format!(
                "card rail returned {status}: {text}"
            )));
        }

        let payment: CardPaymentResponse = resp.json().await?;

        tracing::info!(
            payment_id = %payment.id,
            amount = %req.amount,
            "Card payment created"
        );

        Ok(PaymentCreated::pending(payment.id, payment.payment_url))
    }

    /// Remote status lookup
    pub async fn get_payment(&self, payment_id: &str) -> BillingResult<RemotePaymentStatus> {
        let resp = self
            .client
            .get(format!("{}/payments/{payment_id}", self.config.api_url))
            .header("X-Api-Key", &self.config.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(BillingError::Provider(format!(
                "card rail status lookup returned {}",
                resp.status()
            )));
        }

        let payment: CardPaymentResponse = resp.json().await?;
        Ok(map_status(&payment.status))
    }

    /// HMAC-SHA256 over the raw body, hex-encoded
    pub fn verify_webhook(&self, payload: &str, signature: &str) -> bool {
        let mut mac = match HmacSha256::new_from_slice(self.config.webhook_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != signature {
            tracing::warn!("Card webhook signature mismatch");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn test_config(api_url: String) -> CardConfig {
        CardConfig {
            api_url,
            api_key: "test-key".to_string(),
            webhook_secret: "whsec-test".to_string(),
        }
    }

    fn sample_request() -> CreatePaymentRequest {
        CreatePaymentRequest {
            amount: dec!(25.00),
            currency: "USD".to_string(),
            user_id: Uuid::new_v4(),
            description: Some("Balance top-up".to_string()),
            return_url: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_create_payment_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments")
            .match_header("x-api-key", "test-key")
            .with_status(200)
            .with_body(r#"{"id": "pay_123", "payment_url": "https://rail/pay_123", "status": "created"}"#)
            .create_async()
            .await;

        let provider = CardProvider::new(test_config(server.url()));
        let result = provider.create_payment(&sample_request()).await;

        mock.assert_async().await;
        assert!(result.success);
        assert_eq!(result.payment_id.as_deref(), Some("pay_123"));
        assert_eq!(result.status, RemotePaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_payment_remote_error_becomes_failed_result() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/payments")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let provider = CardProvider::new(test_config(server.url()));
        let result = provider.create_payment(&sample_request()).await;

        assert!(!result.success);
        assert_eq!(result.status, RemotePaymentStatus::Failed);
        assert!(result.error.unwrap().contains("502"));
    }

    #[tokio::test]
    async fn test_get_payment_maps_statuses() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/payments/pay_9")
            .with_status(200)
            .with_body(r#"{"id": "pay_9", "status": "succeeded"}"#)
            .create_async()
            .await;

        let provider = CardProvider::new(test_config(server.url()));
        let status = provider.get_payment("pay_9").await.unwrap();
        assert_eq!(status, RemotePaymentStatus::Completed);
    }

    #[test]
    fn test_verify_webhook_accepts_valid_signature() {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let provider = CardProvider::new(test_config("http://unused".to_string()));
        let payload = r#"{"id":"pay_1","status":"succeeded"}"#;

        let mut mac = Hmac::<Sha256>::new_from_slice(b"whsec-test").unwrap();
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(provider.verify_webhook(payload, &signature));
        assert!(!provider.verify_webhook(payload, "deadbeef"));
        assert!(!provider.verify_webhook(r#"{"id":"pay_2"}"#, &signature));
    }
}
