//! Type-safe price representation using decimal arithmetic.
//!
//! Prices never go through floating point. A cart total is the sum of
//! `unit price × quantity` over its lines, computed with [`Price::times`] and
//! [`Price::sum`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A price with currency information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Price {
    /// Amount in the currency's standard unit (e.g., dollars, not cents).
    pub amount: Decimal,
    /// ISO 4217 currency code.
    #[serde(default)]
    pub currency_code: CurrencyCode,
}

impl Price {
    /// Create a new price.
    #[must_use]
    pub const fn new(amount: Decimal, currency_code: CurrencyCode) -> Self {
        Self {
            amount,
            currency_code,
        }
    }

    /// A zero amount in the given currency.
    #[must_use]
    pub const fn zero(currency_code: CurrencyCode) -> Self {
        Self::new(Decimal::ZERO, currency_code)
    }

    /// Build a price from minor units (e.g. cents), assuming two decimal places.
    #[must_use]
    pub fn from_minor_units(minor: i64, currency_code: CurrencyCode) -> Self {
        Self::new(Decimal::new(minor, 2), currency_code)
    }

    /// This price multiplied by a line quantity.
    #[must_use]
    pub fn times(&self, quantity: u32) -> Self {
        Self::new(self.amount * Decimal::from(quantity), self.currency_code)
    }

    /// Sum a sequence of prices.
    ///
    /// The currency of the result is the currency of the first price, or
    /// `fallback` when the sequence is empty. Carts are single-currency, so
    /// amounts are added as-is.
    #[must_use]
    pub fn sum<I>(prices: I, fallback: CurrencyCode) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let mut iter = prices.into_iter();
        let Some(first) = iter.next() else {
            return Self::zero(fallback);
        };
        iter.fold(first, |acc, p| Self::new(acc.amount + p.amount, acc.currency_code))
    }

    /// Format for display (e.g., "$19.99").
    #[must_use]
    pub fn display(&self) -> String {
        format!(
            "{}{:.2}",
            self.currency_code.symbol(),
            self.amount.round_dp(2)
        )
    }
}

/// ISO 4217 currency codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CurrencyCode {
    #[default]
    USD,
    EUR,
    GBP,
    CAD,
    AUD,
}

impl CurrencyCode {
    /// Display symbol for the currency.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::USD | Self::CAD | Self::AUD => "$",
            Self::EUR => "€",
            Self::GBP => "£",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_times_and_sum() {
        let ten = Price::from_minor_units(1000, CurrencyCode::USD);
        let total = Price::sum([ten.times(3), ten.times(0)], CurrencyCode::USD);
        assert_eq!(total.amount, Decimal::new(30, 0));
    }

    #[test]
    fn test_sum_empty_uses_fallback_currency() {
        let total = Price::sum(std::iter::empty(), CurrencyCode::EUR);
        assert_eq!(total, Price::zero(CurrencyCode::EUR));
    }

    #[test]
    fn test_display() {
        let price = Price::from_minor_units(1999, CurrencyCode::GBP);
        assert_eq!(price.display(), "£19.99");
    }

    #[test]
    fn test_amount_serializes_as_string() {
        let price = Price::from_minor_units(1050, CurrencyCode::USD);
        let json = serde_json::to_value(price).unwrap_or_default();
        assert_eq!(json["amount"], "10.50");
        assert_eq!(json["currencyCode"], "USD");
    }
}
