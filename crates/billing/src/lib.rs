// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries Decimal payloads for business-rule failures
#![allow(clippy::too_many_arguments)] // Ledger inserts carry the full snapshot column set
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Hostara Billing Module
//!
//! The balance ledger, payment rails, and renewal machinery behind the
//! Hostara control panel.
//!
//! ## Features
//!
//! - **Ledger**: atomic balance mutations recorded as immutable signed
//!   transactions with before/after snapshots
//! - **Payment Rails**: uniform adapter surface over card, international
//!   card, wallet, and crypto processors
//! - **Payment Confirmation**: webhook/poll driven, idempotent per
//!   `(payment_id, provider)`
//! - **Promotions**: promocode and referral bonuses as specialized ledger
//!   transactions
//! - **Invoices**: per-year sequential numbering, lifecycle tracking, HTML
//!   document rendering
//! - **Renewal Sweep**: expire, warn, suspend, and terminate hosted servers
//! - **Email Notifications**: fire-and-forget billing emails
//! - **Invariants**: runnable consistency checks over the ledger

pub mod confirmation;
pub mod email;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod invoice;
pub mod ledger;
pub mod promo;
pub mod providers;
pub mod rates;
pub mod renewal;

#[cfg(test)]
mod edge_case_tests;

// Confirmation
pub use confirmation::{PaymentConfirmationService, StalePendingPayment};

// Email
pub use email::BillingEmailService;

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, BillingEvent, BillingEventLogger, BillingEventType};

// Gateway
pub use gateway::PaymentGatewayService;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoice
pub use invoice::{
    format_invoice_number, render_html, sum_line_items, Invoice, InvoiceItem, InvoiceItemInput,
    InvoiceService, InvoiceStatus, IssuerInfo,
};

// Ledger
pub use ledger::{LedgerService, Transaction, TransactionStatus, TransactionType};

// Promo
pub use promo::{Promocode, PromotionService};

// Providers
pub use providers::{CreatePaymentRequest, PaymentCreated, ProviderKind, RemotePaymentStatus};

// Renewal
pub use renewal::{RenewalService, SweepError, SweepSummary};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub ledger: LedgerService,
    pub gateway: PaymentGatewayService,
    pub confirmation: PaymentConfirmationService,
    pub promo: PromotionService,
    pub invoices: InvoiceService,
    pub renewal: RenewalService,
    pub email: BillingEmailService,
    pub events: BillingEventLogger,
}

impl BillingService {
    /// Create a new billing service from environment variables
    ///
    /// Fails when any payment rail is missing its configuration; services
    /// that do not need the rails can be constructed individually instead.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let email = BillingEmailService::from_env();

        Ok(Self {
            ledger: LedgerService::new(pool.clone()),
            gateway: PaymentGatewayService::from_env(pool.clone())?,
            confirmation: PaymentConfirmationService::new(pool.clone()),
            promo: PromotionService::new(pool.clone()),
            invoices: InvoiceService::new(pool.clone()),
            renewal: RenewalService::new(pool.clone(), email.clone()),
            email,
            events: BillingEventLogger::new(pool),
        })
    }
}
