//! Core types for Cartwright.
//!
//! This module provides type-safe wrappers for the cart domain.

pub mod id;
pub mod item;
pub mod offer;
pub mod price;
pub mod status;

pub use id::*;
pub use item::{CartItem, ItemError, WishlistItem};
pub use offer::{
    AppliedOffer, DiscountKind, Offer, OfferError, OfferScope, ValidationOutcome,
    ValidationRequest,
};
pub use price::{CurrencyCode, Price, round_half_up};
pub use status::*;
