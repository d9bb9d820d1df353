//! E-wallet rail adapter
//!
//! Amounts are sent as integer minor units and the rail settles in USD
//! only. Request and webhook signatures are HMAC-SHA256 over the
//! colon-joined fields `"{payment_id}:{amount}:{currency}"` (for requests,
//! `payment_id` is the merchant id), hex-encoded.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{BillingError, BillingResult};
use crate::rates;

use super::{minor_units, CreatePaymentRequest, PaymentCreated, RemotePaymentStatus};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub api_url: String,
    pub merchant_id: String,
    pub secret: String,
}

impl WalletConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            api_url: require_env("WALLET_API_URL")?,
            merchant_id: require_env("WALLET_MERCHANT_ID")?,
            secret: require_env("WALLET_SECRET")?,
        })
    }
}

fn require_env(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{name} not set")))
}

#[derive(Debug, Deserialize)]
struct WalletPaymentResponse {
    payment_id: String,
    #[serde(default)]
    redirect_url: Option<String>,
    state: String,
}

/// Fields a wallet webhook must carry for signature verification
#[derive(Debug, Deserialize)]
struct WalletWebhookPayload {
    payment_id: String,
    amount: i64,
    currency: String,
}

fn map_state(state: &str) -> RemotePaymentStatus {
    match state {
        "done" | "completed" => RemotePaymentStatus::Completed,
        "rejected" | "error" => RemotePaymentStatus::Failed,
        "cancelled" => RemotePaymentStatus::Cancelled,
        _ => RemotePaymentStatus::Pending,
    }
}

fn hmac_hex(secret: &str, message: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Wallet processor client
#[derive(Clone)]
pub struct WalletProvider {
    client: reqwest::Client,
    config: WalletConfig,
}

impl WalletProvider {
    pub fn new(config: WalletConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(WalletConfig::from_env()?))
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
                    "Wallet payment creation failed"
                );
                PaymentCreated::failed(e.to_string())
            }
        }
    }

    async fn create_payment_inner(
        &self,
        req: &CreatePaymentRequest,
    ) -> BillingResult<PaymentCreated> {
        let usd = rates::convert(req.amount, &req.currency, "USD")?;
        let amount = minor_units(usd)?;

        let message = format!("{}:{}:USD", self.config.merchant_id, amount);
        let signature = hmac_hex(&self.config.secret, &message)
            .ok_or_else(|| BillingError::Provider("signature construction failed".to_string()))?;

        let body = serde_json::json!({
            "merchant_id": self.config.merchant_id,
            "amount": amount,
            "currency": "USD",
            "description": req.description,
            "return_url": req.return_url,
            "signature": signature,
        });

        let resp = self
            .client
            .post(format!("{}/invoices", self.config.api_url))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(BillingError::Provider(format!(
                "wallet rail returned {status}: {text}"
            )));
        }

        let payment: WalletPaymentResponse = resp.json().await?;

        tracing::info!(
            payment_id = %payment.payment_id,
            amount_minor = amount,
            "Wallet payment created"
        );

        Ok(PaymentCreated::pending(
            payment.payment_id,
            payment.redirect_url,
        ))
    }

    /// Remote status lookup
    pub async fn get_payment(&self, payment_id: &str) -> BillingResult<RemotePaymentStatus> {
        let resp = self
            .client
            .get(format!(
                "{}/invoices/{payment_id}?merchant_id={}",
                self.config.api_url, self.config.merchant_id
            ))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(BillingError::Provider(format!(
                "wallet rail status lookup returned {}",
                resp.status()
            )));
        }

        let payment: WalletPaymentResponse = resp.json().await?;
        Ok(map_state(&payment.state))
    }

    /// Verify a webhook by recomputing the field signature from the payload
    ///
    /// Returns false on unparseable payloads.
    pub fn verify_webhook(&self, payload: &str, signature: &str) -> bool {
        let parsed: WalletWebhookPayload = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable wallet webhook payload");
                return false;
            }
        };

        let message = format!("{}:{}:{}", parsed.payment_id, parsed.amount, parsed.currency);
        match hmac_hex(&self.config.secret, &message) {
            Some(computed) if computed == signature => true,
            _ => {
                tracing::warn!("Wallet webhook signature mismatch");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn test_provider(api_url: String) -> WalletProvider {
        WalletProvider::new(WalletConfig {
            api_url,
            merchant_id: "m-42".to_string(),
            secret: "wallet-secret".to_string(),
        })
    }

    #[tokio::test]
    async fn test_create_payment_sends_minor_units() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/invoices")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "merchant_id": "m-42",
                "amount": 1999,
                "currency": "USD",
            })))
            .with_status(200)
            .with_body(r#"{"payment_id": "w_1", "redirect_url": "https://wallet/w_1", "state": "new"}"#)
            .create_async()
            .await;

        let result = test_provider(server.url())
            .create_payment(&CreatePaymentRequest {
                amount: dec!(19.99),
                currency: "USD".to_string(),
                user_id: Uuid::new_v4(),
                description: None,
                return_url: None,
                metadata: None,
            })
            .await;

        mock.assert_async().await;
        assert!(result.success);
        assert_eq!(result.payment_url.as_deref(), Some("https://wallet/w_1"));
    }

    #[tokio::test]
    async fn test_create_payment_network_failure_becomes_failed_result() {
        // Nothing listening on this port
        let provider = test_provider("http://127.0.0.1:1".to_string());
        let result = provider
            .create_payment(&CreatePaymentRequest {
                amount: dec!(5),
                currency: "USD".to_string(),
                user_id: Uuid::new_v4(),
                description: None,
                return_url: None,
                metadata: None,
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.status, RemotePaymentStatus::Failed);
        assert!(result.error.is_some());
    }

    #[test]
    fn test_verify_webhook_recomputes_field_signature() {
        let provider = test_provider("http://unused".to_string());
        let payload = r#"{"payment_id": "w_1", "amount": 1999, "currency": "USD"}"#;
        let signature = hmac_hex("wallet-secret", "w_1:1999:USD").unwrap();

        assert!(provider.verify_webhook(payload, &signature));
        assert!(!provider.verify_webhook(payload, "0000"));
        assert!(!provider.verify_webhook("not json", &signature));

        // Amount tampering breaks the signature
        let tampered = r#"{"payment_id": "w_1", "amount": 1, "currency": "USD"}"#;
        assert!(!provider.verify_webhook(tampered, &signature));
    }
}
