//! In-memory fakes of the remote services and item builders for tests.
//!
//! Enabled for this crate's unit tests and, through the `test-util` feature,
//! for the integration tests.

#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cartwright_core::{
    CartItem, DiscountKind, Offer, OfferId, OfferScope, ProductId, ValidationOutcome,
    ValidationRequest, WishlistItem,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use tokio::sync::Semaphore;

use crate::offers::Clock;
use crate::remote::{RemoteCartService, RemoteError, RemoteOfferService, RemoteWishlistService};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unavailable(id: &ProductId) -> RemoteError {
    RemoteError::Status {
        status: 503,
        body: format!("injected failure for {id}"),
    }
}

/// A cart item with quantity 1.
#[must_use]
pub fn cart_item(n: i64, price: &str) -> CartItem {
    CartItem::new(
        ProductId::from(n),
        format!("Product {n}"),
        price.parse().unwrap(),
        format!("https://img.example.com/{n}.jpg"),
    )
    .unwrap()
}

#[must_use]
pub fn wishlist_item(n: i64) -> WishlistItem {
    WishlistItem::from(&cart_item(n, "10"))
}

/// An offer active from a day before `now` until a week after it.
#[must_use]
pub fn offer(
    id: &str,
    scope: OfferScope,
    scope_id: &str,
    discount_kind: DiscountKind,
    discount_value: Decimal,
    now: DateTime<Utc>,
) -> Offer {
    Offer {
        id: OfferId::parse(id).unwrap(),
        title: format!("Offer {id}"),
        scope,
        scope_id: Some(scope_id.to_string()),
        discount_kind,
        discount_value,
        starts_at: now - chrono::Duration::days(1),
        ends_at: now + chrono::Duration::days(7),
    }
}

// =============================================================================
// Cart
// =============================================================================

/// Remote cart kept in a `Vec`, so duplicate rows can be simulated.
#[derive(Clone, Default)]
pub struct FakeCartService {
    inner: Arc<Mutex<FakeCart>>,
}

#[derive(Default)]
struct FakeCart {
    items: Vec<CartItem>,
    catalog: HashMap<ProductId, CartItem>,
    failing: HashSet<ProductId>,
    fail_reads: bool,
    unauthorized: bool,
    delay: Option<Duration>,
    add_calls: usize,
}

impl FakeCartService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a product known so `add_item` accepts it.
    pub fn register(&self, item: CartItem) {
        lock(&self.inner).catalog.insert(item.id.clone(), item);
    }

    /// Put a line in the remote cart.
    pub fn seed(&self, item: CartItem) {
        let mut cart = lock(&self.inner);
        cart.catalog.insert(item.id.clone(), item.clone());
        cart.items.push(item);
    }

    /// Append a second row for an id already in the cart.
    pub fn seed_duplicate(&self, item: CartItem) {
        lock(&self.inner).items.push(item);
    }

    /// Fail every mutation touching `id` with a 503.
    pub fn fail_on(&self, id: &ProductId) {
        lock(&self.inner).failing.insert(id.clone());
    }

    pub fn clear_failures(&self) {
        lock(&self.inner).failing.clear();
    }

    /// Fail `get_cart` with a 503.
    pub fn fail_reads(&self, fail: bool) {
        lock(&self.inner).fail_reads = fail;
    }

    /// Answer every call with `Unauthorized`.
    pub fn set_unauthorized(&self, unauthorized: bool) {
        lock(&self.inner).unauthorized = unauthorized;
    }

    /// Delay every call.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.inner).delay = Some(delay);
    }

    #[must_use]
    pub fn add_calls(&self) -> usize {
        lock(&self.inner).add_calls
    }

    #[must_use]
    pub fn quantity_of(&self, id: &ProductId) -> Option<u32> {
        lock(&self.inner)
            .items
            .iter()
            .filter(|item| &item.id == id)
            .map(|item| item.quantity)
            .reduce(u32::saturating_add)
    }

    #[must_use]
    pub fn items(&self) -> Vec<CartItem> {
        lock(&self.inner).items.clone()
    }

    async fn enter(&self, id: Option<&ProductId>) -> Result<(), RemoteError> {
        let delay = lock(&self.inner).delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let cart = lock(&self.inner);
        if cart.unauthorized {
            return Err(RemoteError::Unauthorized);
        }
        match id {
            Some(id) if cart.failing.contains(id) => Err(unavailable(id)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteCartService for FakeCartService {
    async fn get_cart(&self, _token: &SecretString) -> Result<Vec<CartItem>, RemoteError> {
        self.enter(None).await?;
        let cart = lock(&self.inner);
        if cart.fail_reads {
            return Err(RemoteError::Unavailable("cart reads disabled".to_string()));
        }
        Ok(cart.items.clone())
    }

    async fn add_item(
        &self,
        _token: &SecretString,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<(), RemoteError> {
        lock(&self.inner).add_calls += 1;
        self.enter(Some(product_id)).await?;
        let mut cart = lock(&self.inner);
        if let Some(line) = cart.items.iter_mut().find(|item| &item.id == product_id) {
            line.quantity = line.quantity.saturating_add(quantity);
            return Ok(());
        }
        let item = cart
            .catalog
            .get(product_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("product {product_id}")))?;
        cart.items.push(CartItem { quantity, ..item });
        Ok(())
    }

    async fn update_item(
        &self,
        _token: &SecretString,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<(), RemoteError> {
        self.enter(Some(product_id)).await?;
        let mut cart = lock(&self.inner);
        let line = cart
            .items
            .iter_mut()
            .find(|item| &item.id == product_id)
            .ok_or_else(|| RemoteError::NotFound(format!("cart line {product_id}")))?;
        line.quantity = quantity;
        Ok(())
    }

    async fn remove_item(
        &self,
        _token: &SecretString,
        product_id: &ProductId,
    ) -> Result<(), RemoteError> {
        self.enter(Some(product_id)).await?;
        let mut cart = lock(&self.inner);
        let before = cart.items.len();
        cart.items.retain(|item| &item.id != product_id);
        if cart.items.len() == before {
            return Err(RemoteError::NotFound(format!("cart line {product_id}")));
        }
        Ok(())
    }

    async fn clear_cart(&self, _token: &SecretString) -> Result<(), RemoteError> {
        self.enter(None).await?;
        lock(&self.inner).items.clear();
        Ok(())
    }
}

// =============================================================================
// Wishlist
// =============================================================================

#[derive(Clone, Default)]
pub struct FakeWishlistService {
    inner: Arc<Mutex<FakeWishlist>>,
}

#[derive(Default)]
struct FakeWishlist {
    items: Vec<WishlistItem>,
    catalog: HashMap<ProductId, WishlistItem>,
    failing: HashSet<ProductId>,
}

impl FakeWishlistService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, item: WishlistItem) {
        lock(&self.inner).catalog.insert(item.id.clone(), item);
    }

    pub fn seed(&self, item: WishlistItem) {
        let mut wishlist = lock(&self.inner);
        wishlist.catalog.insert(item.id.clone(), item.clone());
        wishlist.items.push(item);
    }

    pub fn fail_on(&self, id: &ProductId) {
        lock(&self.inner).failing.insert(id.clone());
    }

    #[must_use]
    pub fn contains(&self, id: &ProductId) -> bool {
        lock(&self.inner).items.iter().any(|item| &item.id == id)
    }

    fn check(wishlist: &FakeWishlist, id: &ProductId) -> Result<(), RemoteError> {
        if wishlist.failing.contains(id) {
            return Err(unavailable(id));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteWishlistService for FakeWishlistService {
    async fn get_wishlist(&self, _token: &SecretString) -> Result<Vec<WishlistItem>, RemoteError> {
        Ok(lock(&self.inner).items.clone())
    }

    async fn add_item(
        &self,
        _token: &SecretString,
        product_id: &ProductId,
    ) -> Result<(), RemoteError> {
        let mut wishlist = lock(&self.inner);
        Self::check(&wishlist, product_id)?;
        if wishlist.items.iter().any(|item| &item.id == product_id) {
            return Ok(());
        }
        let item = wishlist
            .catalog
            .get(product_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("product {product_id}")))?;
        wishlist.items.push(item);
        Ok(())
    }

    async fn remove_item(
        &self,
        _token: &SecretString,
        product_id: &ProductId,
    ) -> Result<(), RemoteError> {
        let mut wishlist = lock(&self.inner);
        Self::check(&wishlist, product_id)?;
        wishlist.items.retain(|item| &item.id != product_id);
        Ok(())
    }

    async fn clear_wishlist(&self, _token: &SecretString) -> Result<(), RemoteError> {
        lock(&self.inner).items.clear();
        Ok(())
    }
}

// =============================================================================
// Offers
// =============================================================================

/// Offer catalog with scripted validation verdicts.
#[derive(Clone)]
pub struct FakeOfferService {
    inner: Arc<FakeOffersInner>,
}

struct FakeOffersInner {
    state: Mutex<FakeOffers>,
    gate: Arc<Semaphore>,
}

struct FakeOffers {
    offers: Vec<Offer>,
    responses: HashMap<OfferId, ValidationOutcome>,
    requests: Vec<ValidationRequest>,
    held: bool,
}

impl FakeOfferService {
    #[must_use]
    pub fn new(offers: Vec<Offer>) -> Self {
        Self {
            inner: Arc::new(FakeOffersInner {
                state: Mutex::new(FakeOffers {
                    offers,
                    responses: HashMap::new(),
                    requests: Vec::new(),
                    held: false,
                }),
                gate: Arc::new(Semaphore::new(0)),
            }),
        }
    }

    /// Verdict returned for `offer_id`. Unscripted offers are rejected.
    pub fn respond(&self, offer_id: &OfferId, outcome: ValidationOutcome) {
        lock(&self.inner.state)
            .responses
            .insert(offer_id.clone(), outcome);
    }

    pub fn set_offers(&self, offers: Vec<Offer>) {
        lock(&self.inner.state).offers = offers;
    }

    /// Park validations until permits are added to the returned semaphore.
    #[must_use]
    pub fn hold_validations(&self) -> Arc<Semaphore> {
        lock(&self.inner.state).held = true;
        Arc::clone(&self.inner.gate)
    }

    #[must_use]
    pub fn validation_calls(&self) -> usize {
        lock(&self.inner.state).requests.len()
    }

    #[must_use]
    pub fn last_request(&self) -> Option<ValidationRequest> {
        lock(&self.inner.state).requests.last().cloned()
    }
}

#[async_trait]
impl RemoteOfferService for FakeOfferService {
    async fn list_offers(&self) -> Result<Vec<Offer>, RemoteError> {
        Ok(lock(&self.inner.state).offers.clone())
    }

    async fn validate_offer(
        &self,
        request: &ValidationRequest,
    ) -> Result<ValidationOutcome, RemoteError> {
        let held = {
            let mut state = lock(&self.inner.state);
            state.requests.push(request.clone());
            state.held
        };
        if held {
            let permit = self
                .inner
                .gate
                .acquire()
                .await
                .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
            permit.forget();
        }
        Ok(lock(&self.inner.state)
            .responses
            .get(&request.offer_id)
            .cloned()
            .unwrap_or_else(|| ValidationOutcome::rejected("No verdict scripted")))
    }
}

// =============================================================================
// Clock
// =============================================================================

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *lock(&self.now) += by;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *lock(&self.now) = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}
