//! Cache types for remote service responses.

use cartwright_core::Offer;

/// Cache key for cacheable responses.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum CacheKey {
    OfferCatalog,
}

/// Cached value types.
#[derive(Debug, Clone)]
pub enum CacheValue {
    Offers(Vec<Offer>),
}
