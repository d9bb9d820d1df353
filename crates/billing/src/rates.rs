//! Best-effort currency conversion
//!
//! A static rate table pivoting through USD. These are coarse
//! approximations used to route a charge onto a rail that settles in a
//! different currency; they are not a live-rate service. The crypto rail
//! exposes a real exchange-rate lookup for asset pricing.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::{BillingError, BillingResult};

/// USD value of one unit of the given currency
fn usd_rate(currency: &str) -> Option<Decimal> {
    match currency {
        "USD" => Some(dec!(1)),
        "EUR" => Some(dec!(1.08)),
        "GBP" => Some(dec!(1.27)),
        "PLN" => Some(dec!(0.25)),
        "TRY" => Some(dec!(0.031)),
        "UAH" => Some(dec!(0.024)),
        "KZT" => Some(dec!(0.0021)),
        "RUB" => Some(dec!(0.011)),
        _ => None,
    }
}

pub fn is_supported(currency: &str) -> bool {
    usd_rate(currency).is_some()
}

/// Convert between two supported currencies, pivoting through USD
///
/// Result is rounded to 2 decimal places (minor units).
pub fn convert(amount: Decimal, from: &str, to: &str) -> BillingResult<Decimal> {
    if from == to {
        return Ok(amount);
    }

    let from_rate =
        usd_rate(from).ok_or_else(|| BillingError::UnsupportedCurrency(from.to_string()))?;
    let to_rate = usd_rate(to).ok_or_else(|| BillingError::UnsupportedCurrency(to.to_string()))?;

    Ok((amount * from_rate / to_rate).round_dp(2))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_identity_conversion_is_exact() {
        assert_eq!(convert(dec!(19.99), "EUR", "EUR").unwrap(), dec!(19.99));
    }

    #[test]
    fn test_pivot_through_usd() {
        // 100 EUR -> USD at 1.08
        assert_eq!(convert(dec!(100), "EUR", "USD").unwrap(), dec!(108.00));
        // 108 USD -> GBP at 1.27
        assert_eq!(convert(dec!(108), "USD", "GBP").unwrap(), dec!(85.04));
    }

    #[test]
    fn test_unknown_currency_is_rejected() {
        assert!(matches!(
            convert(dec!(10), "USD", "XAU"),
            Err(BillingError::UnsupportedCurrency(c)) if c == "XAU"
        ));
        assert!(convert(dec!(10), "ZZZ", "USD").is_err());
    }

    #[test]
    fn test_round_trip_stays_close() {
        let eur = dec!(50);
        let usd = convert(eur, "EUR", "USD").unwrap();
        let back = convert(usd, "USD", "EUR").unwrap();
        assert!((back - eur).abs() < dec!(0.01));
    }
}
