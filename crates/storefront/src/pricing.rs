//! Order summary derived from cart items and applied offers.
//!
//! A pure function of its inputs: recomputed on demand, never cached.

use cartwright_core::{AppliedOffer, CartItem, CurrencyCode, Price, round_half_up};
use rust_decimal::Decimal;
use serde::Serialize;

/// Priced order summary.
///
/// Amounts are exact; use [`PriceSummary::rounded`] or
/// [`PriceSummary::lines`] for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PriceSummary {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub taxable_amount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

impl PriceSummary {
    /// Compute the summary. Applied discounts are independent and additive;
    /// the taxable amount never goes below zero.
    #[must_use]
    pub fn compute(items: &[CartItem], applied: &[AppliedOffer], tax_rate: Decimal) -> Self {
        let subtotal: Decimal = items.iter().map(CartItem::line_total).sum();
        let discount: Decimal = applied.iter().map(|a| a.discount_amount).sum();
        let taxable_amount = (subtotal - discount).max(Decimal::ZERO);
        let tax = taxable_amount * tax_rate;
        Self {
            subtotal,
            discount,
            taxable_amount,
            tax,
            total: taxable_amount + tax,
        }
    }

    /// Every amount rounded half-up to two decimal places.
    #[must_use]
    pub fn rounded(&self) -> Self {
        Self {
            subtotal: round_half_up(self.subtotal),
            discount: round_half_up(self.discount),
            taxable_amount: round_half_up(self.taxable_amount),
            tax: round_half_up(self.tax),
            total: round_half_up(self.total),
        }
    }

    /// Labelled display lines, e.g. `("Total", "$18.00")`.
    #[must_use]
    pub fn lines(&self, currency: CurrencyCode) -> Vec<(&'static str, String)> {
        let show = |amount| Price::new(amount, currency).display();
        let mut lines = vec![("Subtotal", show(self.subtotal))];
        if !self.discount.is_zero() {
            lines.push(("Discount", show(-self.discount)));
        }
        lines.push(("Tax", show(self.tax)));
        lines.push(("Total", show(self.total)));
        lines
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cartwright_core::{DiscountKind, OfferScope};
    use chrono::Utc;

    use super::*;
    use crate::testing::{cart_item, offer};

    fn applied(amount: i64) -> AppliedOffer {
        let now = Utc::now();
        AppliedOffer {
            offer: offer(
                "F",
                OfferScope::Product,
                "1",
                DiscountKind::Flat,
                Decimal::from(amount),
                now,
            ),
            discount_amount: Decimal::from(amount),
            cart_revision: 1,
            applied_at: now,
        }
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_flat_offer_with_tax() {
        let items = [cart_item(1, "10").with_quantity(2).unwrap()];
        let summary = PriceSummary::compute(&items, &[applied(5)], dec("0.2")).rounded();

        assert_eq!(summary.subtotal, dec("20.00"));
        assert_eq!(summary.discount, dec("5.00"));
        assert_eq!(summary.taxable_amount, dec("15.00"));
        assert_eq!(summary.tax.to_string(), "3.00");
        assert_eq!(summary.total.to_string(), "18.00");
    }

    #[test]
    fn test_discounts_add_up_and_floor_at_zero() {
        let items = [cart_item(1, "3")];
        let summary = PriceSummary::compute(&items, &[applied(2), applied(2)], dec("0.1"));

        assert_eq!(summary.discount, Decimal::from(4));
        assert_eq!(summary.taxable_amount, Decimal::ZERO);
        assert_eq!(summary.tax, Decimal::ZERO);
        assert_eq!(summary.total, Decimal::ZERO);
    }

    #[test]
    fn test_empty_cart() {
        assert_eq!(
            PriceSummary::compute(&[], &[], dec("0.2")),
            PriceSummary::default()
        );
    }

    #[test]
    fn test_rounding_is_half_up() {
        let items = [cart_item(1, "0.05")];
        let summary = PriceSummary::compute(&items, &[], dec("0.1")).rounded();
        // 0.005 rounds away from zero
        assert_eq!(summary.tax.to_string(), "0.01");
    }

    #[test]
    fn test_display_lines() {
        let items = [cart_item(1, "10").with_quantity(2).unwrap()];
        let summary = PriceSummary::compute(&items, &[applied(5)], dec("0.2"));
        let lines = summary.lines(CurrencyCode::USD);

        assert_eq!(
            lines,
            vec![
                ("Subtotal", "$20.00".to_string()),
                ("Discount", "-$5.00".to_string()),
                ("Tax", "$3.00".to_string()),
                ("Total", "$18.00".to_string()),
            ]
        );
    }
}
