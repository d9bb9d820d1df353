//! Uniform payment gateway over the four provider rails
//!
//! Dispatches the uniform create/status/verify surface to the adapter for
//! the requested rail. Payment creation talks to the provider first and
//! only records the PENDING ledger row once the provider has acknowledged
//! the payment, so a provider failure leaves no local state behind.

use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerService;
use crate::providers::card::CardProvider;
use crate::providers::card_intl::IntlCardProvider;
use crate::providers::crypto::CryptoProvider;
use crate::providers::wallet::WalletProvider;
use crate::providers::{CreatePaymentRequest, PaymentCreated, ProviderKind, RemotePaymentStatus};

/// One client per rail plus the ledger for pending-row bookkeeping
#[derive(Clone)]
pub struct PaymentGatewayService {
    ledger: LedgerService,
    card: CardProvider,
    card_intl: IntlCardProvider,
    wallet: WalletProvider,
    crypto: CryptoProvider,
}

impl PaymentGatewayService {
    pub fn new(
        pool: PgPool,
        card: CardProvider,
        card_intl: IntlCardProvider,
        wallet: WalletProvider,
        crypto: CryptoProvider,
    ) -> Self {
        Self {
            ledger: LedgerService::new(pool),
            card,
            card_intl,
            wallet,
            crypto,
        }
    }

    /// Build all four rails from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(
            pool,
            CardProvider::from_env()?,
            IntlCardProvider::from_env()?,
            WalletProvider::from_env()?,
            CryptoProvider::from_env()?,
        ))
    }

    /// Create a payment on the given rail and record the pending deposit
    ///
    /// Validation problems are `Err`; provider-side failures come back as
    /// `Ok(PaymentCreated { success: false, .. })` with no ledger row.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_payment(
        &self,
        provider: ProviderKind,
        amount: Decimal,
        currency: &str,
        user_id: Uuid,
        description: Option<&str>,
        return_url: Option<&str>,
        metadata: Option<Value>,
    ) -> BillingResult<PaymentCreated> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(amount));
        }

        let req = CreatePaymentRequest {
            amount,
            currency: currency.to_string(),
            user_id,
            description: description.map(str::to_string),
            return_url: return_url.map(str::to_string),
            metadata: metadata.clone(),
        };

        let created = match provider {
            ProviderKind::Card => self.card.create_payment(&req).await,
            ProviderKind::CardIntl => self.card_intl.create_payment(&req).await,
            ProviderKind::Wallet => self.wallet.create_payment(&req).await,
            ProviderKind::Crypto => self.crypto.create_payment(&req).await,
        };

        if created.success {
            if let Some(payment_id) = &created.payment_id {
                self.ledger
                    .record_pending_deposit(
                        user_id,
                        amount,
                        provider.as_str(),
                        payment_id,
                        description.or(Some("Balance top-up")),
                        metadata,
                    )
                    .await?;
            }
        }

        Ok(created)
    }

    /// Remote status lookup on the rail that issued the payment
    pub async fn get_payment(
        &self,
        provider: ProviderKind,
        payment_id: &str,
    ) -> BillingResult<RemotePaymentStatus> {
        match provider {
            ProviderKind::Card => self.card.get_payment(payment_id).await,
            ProviderKind::CardIntl => self.card_intl.get_payment(payment_id).await,
            ProviderKind::Wallet => self.wallet.get_payment(payment_id).await,
            ProviderKind::Crypto => self.crypto.get_payment(payment_id).await,
        }
    }

    /// Verify a webhook signature for the given rail
    ///
    /// A `false` return means the webhook must be discarded before any
    /// confirm/fail call is made.
    pub fn verify_webhook(&self, provider: ProviderKind, payload: &str, signature: &str) -> bool {
        match provider {
            ProviderKind::Card => self.card.verify_webhook(payload, signature),
            ProviderKind::CardIntl => self.card_intl.verify_webhook(payload, signature),
            ProviderKind::Wallet => self.wallet.verify_webhook(payload, signature),
            ProviderKind::Crypto => self.crypto.verify_webhook(payload, signature),
        }
    }
}
