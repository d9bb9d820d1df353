//! Payment provider adapters
//!
//! One module per external payment rail, each translating the uniform
//! payment interface into that rail's API shape. Adapters never let a
//! network or remote-API error escape `create_payment`: failures come back
//! as `PaymentCreated { success: false, .. }` and callers branch on
//! `success`. Webhook signature verification is per-rail; a verification
//! failure means the webhook must be discarded without touching the ledger.

pub mod card;
pub mod card_intl;
pub mod crypto;
pub mod wallet;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// The four supported payment rails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Domestic card processor
    Card,
    /// International card processor
    CardIntl,
    /// E-wallet processor
    Wallet,
    /// Cryptocurrency processor
    Crypto,
}

impl ProviderKind {
    /// Wire string, also stored as `payment_method` on ledger rows
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Card => "card",
            ProviderKind::CardIntl => "card_intl",
            ProviderKind::Wallet => "wallet",
            ProviderKind::Crypto => "crypto",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "card" => Some(ProviderKind::Card),
            "card_intl" => Some(ProviderKind::CardIntl),
            "wallet" => Some(ProviderKind::Wallet),
            "crypto" => Some(ProviderKind::Crypto),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote payment state as reported by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemotePaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// Uniform payment-creation request handed to every adapter
#[derive(Debug, Clone)]
pub struct CreatePaymentRequest {
    pub amount: Decimal,
    pub currency: String,
    pub user_id: Uuid,
    pub description: Option<String>,
    pub return_url: Option<String>,
    pub metadata: Option<Value>,
}

/// Uniform payment-creation result
///
/// `success: false` carries the failure in `error`; nothing was recorded
/// remotely or locally in that case.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentCreated {
    pub success: bool,
    pub payment_id: Option<String>,
    pub payment_url: Option<String>,
    pub status: RemotePaymentStatus,
    pub error: Option<String>,
}

impl PaymentCreated {
    pub fn pending(payment_id: String, payment_url: Option<String>) -> Self {
        Self {
            success: true,
            payment_id: Some(payment_id),
            payment_url,
            status: RemotePaymentStatus::Pending,
            error: None,
        }
    }

    pub fn failed(error: String) -> Self {
        Self {
            success: false,
            payment_id: None,
            payment_url: None,
            status: RemotePaymentStatus::Failed,
            error: Some(error),
        }
    }
}

/// Convert a decimal amount to integer minor units (cents, kopecks)
pub fn minor_units(amount: Decimal) -> BillingResult<i64> {
    (amount * dec!(100))
        .round()
        .to_i64()
        .ok_or(BillingError::InvalidAmount(amount))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_provider_kind_round_trip() {
        for kind in [
            ProviderKind::Card,
            ProviderKind::CardIntl,
            ProviderKind::Wallet,
            ProviderKind::Crypto,
        ] {
            assert_eq!(ProviderKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ProviderKind::from_str("paypal"), None);
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(minor_units(dec!(19.99)).unwrap(), 1999);
        assert_eq!(minor_units(dec!(0.01)).unwrap(), 1);
        assert_eq!(minor_units(dec!(100)).unwrap(), 10000);
        // half-even is fine for sub-cent dust; exact cents stay exact
        assert_eq!(minor_units(dec!(10.005)).unwrap(), 1000);
    }

    #[test]
    fn test_failed_result_shape() {
        let r = PaymentCreated::failed("connection refused".to_string());
        assert!(!r.success);
        assert_eq!(r.status, RemotePaymentStatus::Failed);
        assert!(r.payment_id.is_none());
        assert_eq!(r.error.as_deref(), Some("connection refused"));
    }
}
