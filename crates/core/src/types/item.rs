//! Cart and wishlist items.
//!
//! [`CartItem`] and [`WishlistItem`] are the canonical item shapes. Payloads
//! coming from local storage or a remote service are accepted in the loose
//! shapes those sources use (string or numeric ids, camelCase or snake_case
//! field names, `qty`/`price` aliases) and normalised here, once.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::id::{IdError, ProductId, RawId, SellerId};

/// Errors that can occur when building an item.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ItemError {
    /// The product or seller identity is invalid.
    #[error("invalid id: {0}")]
    Id(#[from] IdError),
    /// Unit prices can never be negative.
    #[error("unit price cannot be negative (got {0})")]
    NegativePrice(Decimal),
    /// Stored quantities are always positive.
    #[error("quantity must be positive (got {0})")]
    NonPositiveQuantity(i64),
    /// The quantity does not fit the store's counter.
    #[error("quantity {0} is too large")]
    QuantityOverflow(i64),
}

/// A line in the shopping cart.
///
/// ## Invariants
///
/// - `unit_price >= 0`
/// - `quantity > 0` (a removal deletes the row rather than storing 0)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCartItem")]
pub struct CartItem {
    /// External product identity.
    pub id: ProductId,
    /// Display name.
    pub name: String,
    /// Price of a single unit.
    pub unit_price: Decimal,
    /// Image URI.
    pub image: String,
    /// Number of units, always positive.
    pub quantity: u32,
    /// Seller (store) the product belongs to, used by store-wide offers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller_id: Option<SellerId>,
}

impl CartItem {
    /// Create a cart item with quantity 1.
    ///
    /// # Errors
    ///
    /// Returns [`ItemError::NegativePrice`] if `unit_price` is negative.
    pub fn new(
        id: ProductId,
        name: impl Into<String>,
        unit_price: Decimal,
        image: impl Into<String>,
    ) -> Result<Self, ItemError> {
        if unit_price.is_sign_negative() && !unit_price.is_zero() {
            return Err(ItemError::NegativePrice(unit_price));
        }
        Ok(Self {
            id,
            name: name.into(),
            unit_price,
            image: image.into(),
            quantity: 1,
            seller_id: None,
        })
    }

    /// Set the quantity.
    ///
    /// # Errors
    ///
    /// Returns [`ItemError::NonPositiveQuantity`] if `quantity` is zero.
    pub fn with_quantity(mut self, quantity: u32) -> Result<Self, ItemError> {
        if quantity == 0 {
            return Err(ItemError::NonPositiveQuantity(0));
        }
        self.quantity = quantity;
        Ok(self)
    }

    /// Attach the seller the product belongs to.
    #[must_use]
    pub fn with_seller(mut self, seller_id: SellerId) -> Self {
        self.seller_id = Some(seller_id);
        self
    }

    /// `unit_price × quantity`.
    #[must_use]
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Loose wire shape of a cart item.
#[derive(Deserialize)]
struct RawCartItem {
    #[serde(alias = "productId", alias = "product_id")]
    id: RawId,
    #[serde(default, alias = "title")]
    name: String,
    #[serde(alias = "unitPrice", alias = "price")]
    unit_price: Decimal,
    #[serde(default, alias = "imageUrl", alias = "image_url")]
    image: String,
    #[serde(default = "default_quantity", alias = "qty")]
    quantity: i64,
    #[serde(default, alias = "sellerId", alias = "storeId", alias = "store_id")]
    seller_id: Option<RawId>,
}

const fn default_quantity() -> i64 {
    1
}

impl TryFrom<RawCartItem> for CartItem {
    type Error = ItemError;

    fn try_from(raw: RawCartItem) -> Result<Self, Self::Error> {
        if raw.quantity <= 0 {
            return Err(ItemError::NonPositiveQuantity(raw.quantity));
        }
        let quantity =
            u32::try_from(raw.quantity).map_err(|_| ItemError::QuantityOverflow(raw.quantity))?;
        let item = Self::new(
            ProductId::try_from(raw.id)?,
            raw.name,
            raw.unit_price,
            raw.image,
        )?
        .with_quantity(quantity)?;
        match raw.seller_id {
            Some(seller) => Ok(item.with_seller(SellerId::try_from(seller)?)),
            None => Ok(item),
        }
    }
}

/// A saved-for-later product. Same shape as [`CartItem`] without quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWishlistItem")]
pub struct WishlistItem {
    /// External product identity.
    pub id: ProductId,
    /// Display name.
    pub name: String,
    /// Price of a single unit.
    pub unit_price: Decimal,
    /// Image URI.
    pub image: String,
    /// Seller (store) the product belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller_id: Option<SellerId>,
}

impl WishlistItem {
    /// Build a cart item for this product with the given quantity.
    ///
    /// # Errors
    ///
    /// Returns [`ItemError::NonPositiveQuantity`] if `quantity` is zero.
    pub fn to_cart_item(&self, quantity: u32) -> Result<CartItem, ItemError> {
        CartItem {
            id: self.id.clone(),
            name: self.name.clone(),
            unit_price: self.unit_price,
            image: self.image.clone(),
            quantity: 1,
            seller_id: self.seller_id.clone(),
        }
        .with_quantity(quantity)
    }
}

impl From<&CartItem> for WishlistItem {
    fn from(item: &CartItem) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            unit_price: item.unit_price,
            image: item.image.clone(),
            seller_id: item.seller_id.clone(),
        }
    }
}

#[derive(Deserialize)]
struct RawWishlistItem {
    #[serde(alias = "productId", alias = "product_id")]
    id: RawId,
    #[serde(default, alias = "title")]
    name: String,
    #[serde(alias = "unitPrice", alias = "price")]
    unit_price: Decimal,
    #[serde(default, alias = "imageUrl", alias = "image_url")]
    image: String,
    #[serde(default, alias = "sellerId", alias = "storeId", alias = "store_id")]
    seller_id: Option<RawId>,
}

impl TryFrom<RawWishlistItem> for WishlistItem {
    type Error = ItemError;

    fn try_from(raw: RawWishlistItem) -> Result<Self, Self::Error> {
        if raw.unit_price.is_sign_negative() && !raw.unit_price.is_zero() {
            return Err(ItemError::NegativePrice(raw.unit_price));
        }
        Ok(Self {
            id: ProductId::try_from(raw.id)?,
            name: raw.name,
            unit_price: raw.unit_price,
            image: raw.image,
            seller_id: raw.seller_id.map(SellerId::try_from).transpose()?,
        })
    }
}
