//! Type-safe price representation using decimal arithmetic.
//!
//! All monetary arithmetic in Cartwright is done on [`Decimal`]; floating
//! point never touches an amount. Rounding happens only for display, to two
//! decimal places, half-up.

use core::fmt;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Number of decimal places used when displaying an amount.
pub const DISPLAY_SCALE: u32 = 2;

/// Round an amount to two decimal places, half-up, keeping a fixed scale.
///
/// ```
/// use cartwright_core::round_half_up;
/// use rust_decimal::Decimal;
///
/// assert_eq!(round_half_up(Decimal::new(1005, 3)).to_string(), "1.01");
/// assert_eq!(round_half_up(Decimal::from(18)).to_string(), "18.00");
/// ```
#[must_use]
pub fn round_half_up(amount: Decimal) -> Decimal {
    let mut rounded =
        amount.round_dp_with_strategy(DISPLAY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(DISPLAY_SCALE);
    rounded
}

/// A price with currency information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    /// Amount in the currency's standard unit (e.g., dollars, not cents).
    pub amount: Decimal,
    /// ISO 4217 currency code.
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

    /// The same price rounded for display.
    #[must_use]
    pub fn rounded(&self) -> Self {
        Self::new(round_half_up(self.amount), self.currency_code)
    }

    /// Format for display (e.g., "$19.99").
    #[must_use]
    pub fn display(&self) -> String {
        let amount = round_half_up(self.amount);
        if amount.is_sign_negative() && !amount.is_zero() {
            format!("-{}{}", self.currency_code.symbol(), amount.abs())
        } else {
            format!("{}{}", self.currency_code.symbol(), amount)
        }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
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

    /// ISO 4217 code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::USD => "USD",
            Self::EUR => "EUR",
            Self::GBP => "GBP",
            Self::CAD => "CAD",
            Self::AUD => "AUD",
        }
    }
}

impl core::str::FromStr for CurrencyCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USD" => Ok(Self::USD),
            "EUR" => Ok(Self::EUR),
            "GBP" => Ok(Self::GBP),
            "CAD" => Ok(Self::CAD),
            "AUD" => Ok(Self::AUD),
            other => Err(format!("unsupported currency code '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_half_up_midpoint() {
        assert_eq!(round_half_up(Decimal::new(125, 3)).to_string(), "0.13");
        assert_eq!(round_half_up(Decimal::new(124, 3)).to_string(), "0.12");
        assert_eq!(round_half_up(Decimal::new(-125, 3)).to_string(), "-0.13");
    }

    #[test]
    fn test_round_half_up_pads_scale() {
        assert_eq!(round_half_up(Decimal::new(3, 0)).to_string(), "3.00");
        assert_eq!(round_half_up(Decimal::new(15, 1)).to_string(), "1.50");
    }

    #[test]
    fn test_price_display() {
        let price = Price::new(Decimal::new(1999, 2), CurrencyCode::USD);
        assert_eq!(price.display(), "$19.99");

        let price = Price::new(Decimal::new(5, 0), CurrencyCode::GBP);
        assert_eq!(price.to_string(), "£5.00");
    }

    #[test]
    fn test_price_display_negative() {
        let price = Price::new(Decimal::new(-250, 2), CurrencyCode::EUR);
        assert_eq!(price.display(), "-€2.50");
    }

    #[test]
    fn test_currency_from_str() {
        assert_eq!("usd".parse::<CurrencyCode>(), Ok(CurrencyCode::USD));
        assert!("XYZ".parse::<CurrencyCode>().is_err());
    }
}
