// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Tests critical boundary conditions in:
//! - Money encoding (BILL-M01 to BILL-M05)
//! - Currency conversion (BILL-C01 to BILL-C04)
//! - Invoice numbering (BILL-N01 to BILL-N04)
//! - Renewal warning windows (BILL-W01 to BILL-W03)
//! - Provider result mapping (BILL-P01 to BILL-P03)

#[cfg(test)]
mod money_tests {
    use crate::providers::minor_units;
    use rust_decimal_macros::dec;

    // =========================================================================
    // BILL-M01: Smallest representable charge - one cent
    // =========================================================================
    #[test]
    fn test_one_cent_is_one_minor_unit() {
        assert_eq!(minor_units(dec!(0.01)).unwrap(), 1);
    }

    // =========================================================================
    // BILL-M02: Whole amounts carry no fractional dust
    // =========================================================================
    #[test]
    fn test_whole_amounts_are_exact() {
        assert_eq!(minor_units(dec!(150)).unwrap(), 15000);
        assert_eq!(minor_units(dec!(0)).unwrap(), 0);
    }

    // =========================================================================
    // BILL-M03: Repeated decimal addition does not drift
    // =========================================================================
    #[test]
    fn test_repeated_addition_is_exact() {
        let mut total = dec!(0);
        for _ in 0..1000 {
            total += dec!(0.10);
        }
        assert_eq!(total, dec!(100.00));
        assert_eq!(minor_units(total).unwrap(), 10000);
    }

    // =========================================================================
    // BILL-M04: Sub-cent amounts round half-even
    // =========================================================================
    #[test]
    fn test_sub_cent_rounding() {
        assert_eq!(minor_units(dec!(0.005)).unwrap(), 0);
        assert_eq!(minor_units(dec!(0.015)).unwrap(), 2);
        assert_eq!(minor_units(dec!(0.016)).unwrap(), 2);
    }

    // =========================================================================
    // BILL-M05: Large balances stay within i64 minor units
    // =========================================================================
    #[test]
    fn test_large_amounts() {
        assert_eq!(minor_units(dec!(10000000)).unwrap(), 1_000_000_000);
    }
}

#[cfg(test)]
mod conversion_tests {
    use crate::rates::convert;
    use rust_decimal_macros::dec;

    // =========================================================================
    // BILL-C01: Same-currency conversion is the identity
    // =========================================================================
    #[test]
    fn test_identity() {
        assert_eq!(convert(dec!(0.01), "USD", "USD").unwrap(), dec!(0.01));
    }

    // =========================================================================
    // BILL-C02: Tiny cross-currency amounts can round to zero
    // =========================================================================
    #[test]
    fn test_tiny_amount_rounds_to_zero() {
        // 0.01 KZT is a fraction of a US cent
        assert_eq!(convert(dec!(0.01), "KZT", "USD").unwrap(), dec!(0.00));
    }

    // =========================================================================
    // BILL-C03: Conversion result is always 2 decimal places
    // =========================================================================
    #[test]
    fn test_two_decimal_places() {
        let converted = convert(dec!(33.33), "EUR", "GBP").unwrap();
        assert!(converted.scale() <= 2, "expected minor-unit scale, got {converted}");
    }

    // =========================================================================
    // BILL-C04: Unknown currency on either side fails, even for zero
    // =========================================================================
    #[test]
    fn test_unknown_currency_fails_regardless_of_amount() {
        assert!(convert(dec!(0), "USD", "DOGE").is_err());
        assert!(convert(dec!(0), "DOGE", "USD").is_err());
    }
}

#[cfg(test)]
mod invoice_numbering_tests {
    use crate::invoice::format_invoice_number;

    // =========================================================================
    // BILL-N01: First invoice of the year
    // =========================================================================
    #[test]
    fn test_first_of_year() {
        assert_eq!(format_invoice_number(2025, 1), "INV-2025-00001");
    }

    // =========================================================================
    // BILL-N02: Padding boundary at 5 digits
    // =========================================================================
    #[test]
    fn test_padding_boundary() {
        assert_eq!(format_invoice_number(2025, 99999), "INV-2025-99999");
        assert_eq!(format_invoice_number(2025, 100000), "INV-2025-100000");
    }

    // =========================================================================
    // BILL-N03: Year rollover resets nothing in the format itself
    // =========================================================================
    #[test]
    fn test_year_rollover_distinct_prefixes() {
        let dec_last = format_invoice_number(2025, 4521);
        let jan_first = format_invoice_number(2026, 1);
        assert_eq!(jan_first, "INV-2026-00001");
        assert!(jan_first > dec_last, "numbers sort by year first");
    }

    // =========================================================================
    // BILL-N04: Consumers can parse the sequence back out
    // =========================================================================
    #[test]
    fn test_number_is_parseable() {
        let number = format_invoice_number(2025, 7);
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts, vec!["INV", "2025", "00007"]);
        assert_eq!(parts[2].parse::<i32>().unwrap(), 7);
    }
}

#[cfg(test)]
mod provider_result_tests {
    use crate::providers::{PaymentCreated, ProviderKind, RemotePaymentStatus};

    // =========================================================================
    // BILL-P01: Failure results never carry a payment id
    // =========================================================================
    #[test]
    fn test_failed_has_no_payment_id() {
        let failed = PaymentCreated::failed("timeout".to_string());
        assert!(!failed.success);
        assert!(failed.payment_id.is_none());
        assert!(failed.payment_url.is_none());
    }

    // =========================================================================
    // BILL-P02: Success results start pending, never completed
    // =========================================================================
    #[test]
    fn test_created_payment_starts_pending() {
        let created = PaymentCreated::pending("p_1".to_string(), None);
        assert!(created.success);
        assert_eq!(created.status, RemotePaymentStatus::Pending);
        assert!(created.error.is_none());
    }

    // =========================================================================
    // BILL-P03: Provider wire strings match the payment_method column values
    // =========================================================================
    #[test]
    fn test_provider_wire_strings() {
        assert_eq!(ProviderKind::Card.as_str(), "card");
        assert_eq!(ProviderKind::CardIntl.as_str(), "card_intl");
        assert_eq!(ProviderKind::Wallet.as_str(), "wallet");
        assert_eq!(ProviderKind::Crypto.as_str(), "crypto");

        let json = serde_json::to_string(&ProviderKind::CardIntl).unwrap();
        assert_eq!(json, r#""card_intl""#);
    }
}

#[cfg(test)]
mod error_tests {
    use crate::error::BillingError;
    use rust_decimal_macros::dec;

    // =========================================================================
    // Insufficient funds surfaces both sides of the comparison
    // =========================================================================
    #[test]
    fn test_insufficient_funds_message() {
        let e = BillingError::InsufficientFunds {
            balance: dec!(100),
            required: dec!(150),
        };
        let msg = e.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("150"));
    }

    #[test]
    fn test_transaction_not_found_is_nonspecific() {
        // Deliberately indistinguishable between "already confirmed" and
        // "never created" so re-delivered webhooks stay quiet.
        let msg = BillingError::TransactionNotFound.to_string();
        assert!(!msg.contains("payment"));
    }
}
