//! Cryptocurrency rail adapter
//!
//! Creates hosted crypto invoices priced in a fiat currency; the rail
//! quotes the asset amount itself. Exposes the rail's live exchange-rate
//! lookup, which is also the intended replacement for the static rate
//! table. Webhooks are signed with HMAC-SHA256 over the raw body using the
//! API secret, hex-encoded.

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{BillingError, BillingResult};

use super::{CreatePaymentRequest, PaymentCreated, RemotePaymentStatus};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct CryptoConfig {
    pub api_url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl CryptoConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            api_url: require_env("CRYPTO_API_URL")?,
            api_key: require_env("CRYPTO_API_KEY")?,
            api_secret: require_env("CRYPTO_API_SECRET")?,
        })
    }
}

fn require_env(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{name} not set")))
}

#[derive(Debug, Deserialize)]
struct CryptoInvoiceResponse {
    id: String,
    #[serde(default)]
    invoice_url: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RateResponse {
    rate: Decimal,
}

fn map_status(status: &str) -> RemotePaymentStatus {
    match status {
        "paid" | "confirmed" => RemotePaymentStatus::Completed,
        "invalid" | "expired" => RemotePaymentStatus::Failed,
        "canceled" | "cancelled" => RemotePaymentStatus::Cancelled,
        _ => RemotePaymentStatus::Pending,
    }
}

/// Crypto processor client
#[derive(Clone)]
pub struct CryptoProvider {
    client: reqwest::Client,
    config: CryptoConfig,
}

impl CryptoProvider {
    pub fn new(config: CryptoConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(CryptoConfig::from_env()?))
    }

    /// Create a remote invoice. Never propagates transport errors.
    pub async fn create_payment(&self, req: &CreatePaymentRequest) -> PaymentCreated {
        match self.create_payment_inner(req).await {
            Ok(created) => created,
            Err(e) => {
                tracing::warn!(
                    user_id = %req.user_id,
                    amount = %req.amount,
                    error = %e,
                    "Crypto invoice creation failed"
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
            "price_amount": req.amount.to_string(),
            "price_currency": req.currency,
            "order_description": req.description,
            "success_url": req.return_url,
            "metadata": req.metadata,
        });

        let resp = self
            .client
            .post(format!("{}/invoices", self.config.api_url))
            .header("X-Api-Key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(BillingError::Provider(format!(
                "crypto rail returned {status}: {text}"
            )));
        }

        let invoice: CryptoInvoiceResponse = resp.json().await?;

        tracing::info!(
            payment_id = %invoice.id,
            amount = %req.amount,
            currency = %req.currency,
            "Crypto invoice created"
        );

        Ok(PaymentCreated::pending(invoice.id, invoice.invoice_url))
    }

    /// Remote status lookup
    pub async fn get_payment(&self, payment_id: &str) -> BillingResult<RemotePaymentStatus> {
        let resp = self
            .client
            .get(format!("{}/invoices/{payment_id}", self.config.api_url))
            .header("X-Api-Key", &self.config.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(BillingError::Provider(format!(
                "crypto rail status lookup returned {}",
                resp.status()
            )));
        }

        let invoice: CryptoInvoiceResponse = resp.json().await?;
        Ok(map_status(&invoice.status))
    }

    /// Live exchange rate between two assets/currencies
    pub async fn exchange_rate(&self, from: &str, to: &str) -> BillingResult<Decimal> {
        let resp = self
            .client
            .get(format!("{}/rates/{from}/{to}", self.config.api_url))
            .header("X-Api-Key", &self.config.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(BillingError::Provider(format!(
                "crypto rate lookup returned {}",
                resp.status()
            )));
        }

        let rate: RateResponse = resp.json().await?;
        Ok(rate.rate)
    }

    /// HMAC-SHA256 over the raw body with the API secret, hex-encoded
    pub fn verify_webhook(&self, payload: &str, signature: &str) -> bool {
        let mut mac = match HmacSha256::new_from_slice(self.config.api_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != signature {
            tracing::warn!("Crypto webhook signature mismatch");
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

    fn test_provider(api_url: String) -> CryptoProvider {
        CryptoProvider::new(CryptoConfig {
            api_url,
            api_key: "ck".to_string(),
            api_secret: "cs".to_string(),
        })
    }

    #[tokio::test]
    async fn test_create_payment_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/invoices")
            .with_status(200)
            .with_body(r#"{"id": "inv_c1", "invoice_url": "https://crypto/inv_c1", "status": "new"}"#)
            .create_async()
            .await;

        let result = test_provider(server.url())
            .create_payment(&CreatePaymentRequest {
                amount: dec!(50),
                currency: "USD".to_string(),
                user_id: Uuid::new_v4(),
                description: Some("Top-up".to_string()),
                return_url: None,
                metadata: None,
            })
            .await;

        assert!(result.success);
        assert_eq!(result.payment_id.as_deref(), Some("inv_c1"));
        assert_eq!(result.status, RemotePaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_exchange_rate_lookup() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/rates/BTC/USD")
            .with_status(200)
            .with_body(r#"{"rate": "64123.55"}"#)
            .create_async()
            .await;

        let rate = test_provider(server.url())
            .exchange_rate("BTC", "USD")
            .await
            .unwrap();
        assert_eq!(rate, dec!(64123.55));
    }

    #[test]
    fn test_verify_webhook_uses_api_secret() {
        let provider = test_provider("http://unused".to_string());
        let payload = r#"{"id":"inv_c1","status":"paid"}"#;

        let mut mac = HmacSha256::new_from_slice(b"cs").unwrap();
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(provider.verify_webhook(payload, &signature));
        assert!(!provider.verify_webhook(payload, "bad"));
    }
}
