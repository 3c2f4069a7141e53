//! Integration tests for Cartwright.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p cartwright-integration-tests
//! ```
//!
//! # Test Categories
//!
//! - `cart_properties` - Cart invariants through the [`Storefront`] facade
//! - `login_merge` - Guest-to-account merge, logout and cross-instance sync
//! - `offers_pricing` - Offer eligibility, validation and the price summary
//! - `http_backend` - The HTTP adapter against unreachable services
//!
//! Every test runs against in-memory fakes of the remote services, so no
//! network or external process is needed.

#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::sync::Arc;

use cartwright_core::Offer;
use cartwright_storefront::Storefront;
use cartwright_storefront::config::EngineConfig;
use cartwright_storefront::state::Services;
use cartwright_storefront::storage::MemoryStorage;
use cartwright_storefront::testing::{
    FakeCartService, FakeOfferService, FakeWishlistService, ManualClock,
};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;

/// Fixed "now" used by every test clock.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap()
}

/// A storefront over shared fakes.
pub struct TestContext {
    pub storage: MemoryStorage,
    pub cart_remote: FakeCartService,
    pub wishlist_remote: FakeWishlistService,
    pub offer_remote: FakeOfferService,
    pub clock: ManualClock,
    pub storefront: Storefront,
}

impl TestContext {
    /// A started storefront with no offers and tax rate 0.2.
    pub async fn new() -> Self {
        Self::with_offers(Vec::new()).await
    }

    pub async fn with_offers(offers: Vec<Offer>) -> Self {
        let storage = MemoryStorage::new();
        let cart_remote = FakeCartService::new();
        let wishlist_remote = FakeWishlistService::new();
        let offer_remote = FakeOfferService::new(offers);
        let clock = ManualClock::new(now());
        let storefront = open(
            &storage,
            &cart_remote,
            &wishlist_remote,
            &offer_remote,
            &clock,
        )
        .await;
        Self {
            storage,
            cart_remote,
            wishlist_remote,
            offer_remote,
            clock,
            storefront,
        }
    }

    /// Another storefront over the same storage and remote services, as a
    /// second client instance would be.
    pub async fn second_instance(&self) -> Storefront {
        open(
            &self.storage,
            &self.cart_remote,
            &self.wishlist_remote,
            &self.offer_remote,
            &self.clock,
        )
        .await
    }

    pub async fn login(&self) {
        self.storefront
            .login(SecretString::from("session-token"), None)
            .await
            .unwrap();
    }
}

async fn open(
    storage: &MemoryStorage,
    cart: &FakeCartService,
    wishlist: &FakeWishlistService,
    offers: &FakeOfferService,
    clock: &ManualClock,
) -> Storefront {
    let services = Services {
        cart: Arc::new(cart.clone()),
        wishlist: Arc::new(wishlist.clone()),
        offers: Arc::new(offers.clone()),
    };
    let config = EngineConfig {
        tax_rate: Decimal::new(2, 1),
        ..EngineConfig::default()
    };
    let storefront = Storefront::open(
        config,
        Arc::new(storage.clone()),
        services,
        Arc::new(clock.clone()),
    )
    .await
    .unwrap();
    storefront.start().await;
    storefront
}
