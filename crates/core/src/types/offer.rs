//! Promotional offers and their validation payloads.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::id::OfferId;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Errors raised by [`Offer::validate`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OfferError {
    /// `starts_at` is after `ends_at`.
    #[error("offer {0} starts after it ends")]
    InvertedWindow(OfferId),
    /// Discount values must be strictly positive.
    #[error("offer {0} has a non-positive discount value")]
    NonPositiveDiscount(OfferId),
    /// A percentage above 100 cannot be honoured.
    #[error("offer {0} discounts more than 100 percent")]
    PercentOverflow(OfferId),
    /// Scoped offers need to name the thing they apply to.
    #[error("offer {0} is missing its scope id")]
    MissingScopeId(OfferId),
}

/// What an offer's discount applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferScope {
    /// Every item sold by the seller named in `scope_id`.
    StoreWide,
    /// A specific product.
    Product,
    /// A specific bookable service.
    Service,
}

/// How the discount value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountKind {
    /// `discount_value` is a percentage of the amount.
    Percent,
    /// `discount_value` is a fixed amount.
    Flat,
}

/// A candidate promotional offer from the offer catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    #[serde(default)]
    pub title: String,
    pub scope: OfferScope,
    /// Seller id for store-wide offers, product/service id otherwise.
    #[serde(default, alias = "scopeId")]
    pub scope_id: Option<String>,
    #[serde(alias = "discountKind")]
    pub discount_kind: DiscountKind,
    #[serde(alias = "discountValue")]
    pub discount_value: Decimal,
    #[serde(alias = "startsAt")]
    pub starts_at: DateTime<Utc>,
    #[serde(alias = "endsAt")]
    pub ends_at: DateTime<Utc>,
}

impl Offer {
    /// Check the offer's structural invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), OfferError> {
        if self.starts_at > self.ends_at {
            return Err(OfferError::InvertedWindow(self.id.clone()));
        }
        if self.discount_value <= Decimal::ZERO {
            return Err(OfferError::NonPositiveDiscount(self.id.clone()));
        }
        if self.discount_kind == DiscountKind::Percent && self.discount_value > HUNDRED {
            return Err(OfferError::PercentOverflow(self.id.clone()));
        }
        if self.scope_id().is_none() && self.scope != OfferScope::StoreWide {
            return Err(OfferError::MissingScopeId(self.id.clone()));
        }
        Ok(())
    }

    /// The scope id, ignoring blank values.
    #[must_use]
    pub fn scope_id(&self) -> Option<&str> {
        self.scope_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Whether `now` falls inside `[starts_at, ends_at]`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now <= self.ends_at
    }

    /// Local estimate of the discount on `amount`, for display only.
    ///
    /// The applied discount always comes from the remote validation service.
    #[must_use]
    pub fn estimated_discount(&self, amount: Decimal) -> Decimal {
        if amount <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let raw = match self.discount_kind {
            DiscountKind::Percent => amount * self.discount_value / HUNDRED,
            DiscountKind::Flat => self.discount_value,
        };
        raw.min(amount)
    }
}

/// An offer whose discount has been confirmed for a specific cart snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOffer {
    pub offer: Offer,
    /// Server-confirmed discount, never negative.
    pub discount_amount: Decimal,
    /// Cart revision the discount was computed against.
    pub cart_revision: u64,
    pub applied_at: DateTime<Utc>,
}

/// Payload sent to the remote validation authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    pub offer_id: OfferId,
    /// Cart amount before any discount.
    pub amount: Decimal,
    /// Scope ids from the cart that made the offer eligible.
    pub scope_ids: Vec<String>,
}

/// Verdict returned by the remote validation authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(default, alias = "discountAmount")]
    pub discount_amount: Decimal,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ValidationOutcome {
    /// A positive verdict with the given discount.
    #[must_use]
    pub const fn accepted(discount_amount: Decimal) -> Self {
        Self {
            valid: true,
            discount_amount,
            reason: None,
        }
    }

    /// A negative verdict.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            discount_amount: Decimal::ZERO,
            reason: Some(reason.into()),
        }
    }
}
