//! The storefront engine shared by UI code.
//!
//! [`Storefront`] owns the session, both item stores, the reconciler and the
//! offer engine, and reacts to session transitions:
//!
//! - `LoggedIn` merges guest state into the account
//! - `Refreshed` reloads both stores from the remote service
//! - `LoggedOut` / `Expired` drop to guest mode and forget applied offers
//!
//! A login made by another instance sharing the same storage only switches
//! mode and reloads: the instance that logged in runs the merge.
//!
//! Every failed user action produces exactly one notification on
//! [`Storefront::notifications`]; server-class failures also go to Sentry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use cartwright_core::{
    AppliedOffer, CartItem, Offer, OfferId, ProductId, SessionMode, UserId, WishlistItem,
};
use secrecy::SecretString;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{self, Result, StoreError};
use crate::notify::{Notification, Notifier};
use crate::offers::{ApplyOutcome, Clock, OfferEngine, OfferView};
use crate::pricing::PriceSummary;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::remote::{HttpBackend, RemoteCartService, RemoteOfferService, RemoteWishlistService};
use crate::session::{SessionEvent, SessionState};
use crate::storage::{Storage, StorageError, StorageEvent, keys};
use crate::store::{CartSnapshot, CartStore, WishlistStore};

/// Remote collaborators of the engine.
#[derive(Clone)]
pub struct Services {
    pub cart: Arc<dyn RemoteCartService>,
    pub wishlist: Arc<dyn RemoteWishlistService>,
    pub offers: Arc<dyn RemoteOfferService>,
}

impl Services {
    /// All three services over one HTTP backend.
    #[must_use]
    pub fn http(backend: &HttpBackend) -> Self {
        Self {
            cart: Arc::new(backend.clone()),
            wishlist: Arc::new(backend.clone()),
            offers: Arc::new(backend.clone()),
        }
    }
}

/// Cart, wishlist and offers for one client. Cheaply cloneable.
#[derive(Clone)]
pub struct Storefront {
    inner: Arc<StorefrontInner>,
}

struct StorefrontInner {
    config: EngineConfig,
    storage: Arc<dyn Storage>,
    session: SessionState,
    cart: CartStore,
    wishlist: WishlistStore,
    reconciler: Reconciler,
    offers: OfferEngine,
    notifier: Notifier,
    /// Highest session epoch whose transition has been handled.
    applied_epoch: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Storefront {
    /// Restore the persisted session and wire the components together.
    ///
    /// Nothing is loaded until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted session cannot be read.
    pub async fn open(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        services: Services,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let session = SessionState::restore(Arc::clone(&storage)).await?;
        let notifier = Notifier::new();
        let timeout = config.remote_timeout;

        let cart = CartStore::new(
            session.clone(),
            Arc::clone(&storage),
            Arc::clone(&services.cart),
            timeout,
        );
        let wishlist = WishlistStore::new(
            session.clone(),
            Arc::clone(&storage),
            Arc::clone(&services.wishlist),
            timeout,
        );
        let reconciler = Reconciler::new(
            session.clone(),
            Arc::clone(&storage),
            cart.clone(),
            wishlist.clone(),
            services.cart,
            services.wishlist,
            notifier.clone(),
            timeout,
        );
        let offers = OfferEngine::new(
            services.offers,
            cart.clone(),
            session.clone(),
            clock,
            notifier.clone(),
            timeout,
        );

        Ok(Self {
            inner: Arc::new(StorefrontInner {
                config,
                storage,
                session,
                cart,
                wishlist,
                reconciler,
                offers,
                notifier,
                applied_epoch: AtomicU64::new(0),
                listener: Mutex::new(None),
            }),
        })
    }

    /// Start listening for session changes and load the initial state.
    ///
    /// A session restored as authenticated is merged first, so guest data
    /// left over from an interrupted merge is not lost. Load failures are
    /// notified, not returned.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        self.spawn_listener();

        let (session, epoch) = self.inner.session.snapshot();
        if session.is_authenticated() {
            if let Some(user_id) = session.user_id() {
                error::set_sentry_user(user_id);
            }
            self.merge(epoch).await;
        } else {
            self.refresh_stores().await;
        }
        if let Err(e) = self.inner.offers.refresh_catalog().await {
            self.fail(e, "offers.refresh_catalog");
        }
        info!(mode = ?session.mode(), "Storefront started");
    }

    /// Stop the session listener. In-flight operations run to completion.
    pub fn shutdown(&self) {
        let handle = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("Storefront listener stopped");
        }
    }

    fn spawn_listener(&self) {
        let mut slot = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let mut sessions = self.inner.session.subscribe();
        let mut changes = self.inner.storage.subscribe();
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = sessions.recv() => match event {
                        Ok(event) => {
                            let Some(storefront) = upgrade(&weak) else { break };
                            storefront.on_session_event(event).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Session listener lagged, resyncing");
                            let Some(storefront) = upgrade(&weak) else { break };
                            storefront.resync().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    change = changes.recv() => match change {
                        Ok(change) => {
                            let Some(storefront) = upgrade(&weak) else { break };
                            storefront.on_storage_change(&change).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Storage listener lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Session listener exited");
        }));
    }

    async fn on_session_event(&self, event: SessionEvent) {
        let epoch = event.epoch();
        if !self.claim(epoch) {
            debug!(epoch, "Transition already handled");
            return;
        }
        match event {
            SessionEvent::LoggedIn { .. } => {
                self.merge(epoch).await;
            }
            SessionEvent::Refreshed { .. } => self.refresh_stores().await,
            SessionEvent::LoggedOut { .. } | SessionEvent::Expired { .. } => {
                self.enter_guest().await;
            }
        }
    }

    /// Converge on a session written by another instance.
    async fn on_storage_change(&self, change: &StorageEvent) {
        if change.key != keys::SESSION {
            return;
        }
        // A later write will arrive as its own event
        match self.inner.storage.get(keys::SESSION).await {
            Ok(current) if current == change.new_value => {}
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read session after change");
                return;
            }
        }
        let Some(event) = self.inner.session.observe_storage_change(change) else {
            return;
        };
        // Claimed before the published event reaches this listener
        if !self.claim(event.epoch()) {
            return;
        }
        info!(mode = ?event.mode(), "Session changed by another instance");
        match event {
            SessionEvent::LoggedIn { .. } | SessionEvent::Refreshed { .. } => {
                self.refresh_stores().await;
            }
            SessionEvent::LoggedOut { .. } | SessionEvent::Expired { .. } => {
                self.enter_guest().await;
            }
        }
    }

    /// Catch up after missed events. Logins made here are claimed directly,
    /// so a missed authenticated transition only needs a reload.
    async fn resync(&self) {
        let (session, epoch) = self.inner.session.snapshot();
        if !self.claim(epoch) {
            return;
        }
        if session.is_authenticated() {
            self.refresh_stores().await;
        } else {
            self.enter_guest().await;
        }
    }

    /// Mark `epoch` as handled. Returns `false` if it (or a later epoch)
    /// already was.
    fn claim(&self, epoch: u64) -> bool {
        self.inner.applied_epoch.fetch_max(epoch, Ordering::AcqRel) < epoch
    }

    async fn merge(&self, epoch: u64) -> Option<ReconcileOutcome> {
        match self.inner.reconciler.run(epoch).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.fail(e, "reconcile");
                None
            }
        }
    }

    async fn refresh_stores(&self) {
        if let Err(e) = self.inner.cart.refresh().await {
            self.fail(e, "cart.refresh");
        }
        if let Err(e) = self.inner.wishlist.refresh().await {
            self.fail(e, "wishlist.refresh");
        }
    }

    async fn enter_guest(&self) {
        self.inner.offers.reset();
        error::clear_sentry_user();
        if let Err(e) = self.inner.cart.switch_to_guest().await {
            error::report(&e, "cart.switch_to_guest");
        }
        if let Err(e) = self.inner.wishlist.switch_to_guest().await {
            error::report(&e, "wishlist.switch_to_guest");
        }
    }

    /// Report and notify a failed action, handing the error back.
    fn fail(&self, err: StoreError, operation: &str) -> StoreError {
        error::report(&err, operation);
        self.inner.notifier.error(err.user_message());
        err
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Record a login and merge guest state into the account.
    ///
    /// Returns the merge outcome, or `None` if the token did not change, the
    /// listener already picked up the transition, or the merge failed (the
    /// failure is notified).
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be persisted. The in-memory
    /// session is authenticated regardless.
    #[instrument(skip(self, token))]
    pub async fn login(
        &self,
        token: SecretString,
        user_id: Option<UserId>,
    ) -> Result<Option<ReconcileOutcome>> {
        if let Some(user_id) = &user_id {
            error::set_sentry_user(user_id);
        }
        error::add_breadcrumb("auth", "Logged in", None);

        let event = match self.inner.session.login(token, user_id).await {
            Ok(event) => event,
            Err(e) => return Err(self.fail(e.into(), "session.login")),
        };
        match event {
            Some(SessionEvent::LoggedIn { epoch }) if self.claim(epoch) => {
                Ok(self.merge(epoch).await)
            }
            Some(SessionEvent::Refreshed { epoch }) if self.claim(epoch) => {
                self.refresh_stores().await;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Log out. The visible cart and wishlist are empty when this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted session cannot be removed.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<()> {
        error::add_breadcrumb("auth", "Logged out", None);
        let event = self.inner.session.logout().await;
        self.leave(event, "session.logout").await
    }

    /// Tell the engine the session token was refused elsewhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted session cannot be removed.
    #[instrument(skip(self))]
    pub async fn session_expired(&self) -> Result<()> {
        let event = self.inner.session.expire().await;
        self.leave(event, "session.expire").await
    }

    async fn leave(
        &self,
        event: std::result::Result<Option<SessionEvent>, StorageError>,
        operation: &str,
    ) -> Result<()> {
        // The in-memory mode has flipped even if persisting failed
        let (_, epoch) = self.inner.session.snapshot();
        if self.claim(epoch) {
            self.enter_guest().await;
        }
        match event {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(e.into(), operation)),
        }
    }

    #[must_use]
    pub fn mode(&self) -> SessionMode {
        self.inner.session.mode()
    }

    #[must_use]
    pub fn session(&self) -> &SessionState {
        &self.inner.session
    }

    // =========================================================================
    // Cart
    // =========================================================================

    /// Add `quantity` units of `item`.
    ///
    /// # Errors
    ///
    /// Returns the failure after notifying it; the cart is unchanged.
    pub async fn add_to_cart(&self, item: CartItem, quantity: u32) -> Result<CartItem> {
        error::add_breadcrumb("cart", "Add to cart", Some(&[("product_id", item.id.as_str())]));
        self.inner
            .cart
            .add(item, quantity)
            .await
            .map_err(|e| self.fail(e, "cart.add"))
    }

    /// Remove a line.
    ///
    /// # Errors
    ///
    /// Returns the failure after notifying it; the cart is unchanged.
    pub async fn remove_from_cart(&self, id: &ProductId) -> Result<()> {
        error::add_breadcrumb("cart", "Remove from cart", Some(&[("product_id", id.as_str())]));
        self.inner
            .cart
            .remove(id)
            .await
            .map_err(|e| self.fail(e, "cart.remove"))
    }

    /// Set a line's quantity; zero or less removes it.
    ///
    /// # Errors
    ///
    /// Returns the failure after notifying it; the cart is unchanged.
    pub async fn set_cart_quantity(
        &self,
        id: &ProductId,
        quantity: i64,
    ) -> Result<Option<CartItem>> {
        self.inner
            .cart
            .set_quantity(id, quantity)
            .await
            .map_err(|e| self.fail(e, "cart.set_quantity"))
    }

    /// Empty the cart.
    ///
    /// # Errors
    ///
    /// Returns the failure after notifying it; the cart is unchanged.
    pub async fn clear_cart(&self) -> Result<()> {
        self.inner
            .cart
            .clear()
            .await
            .map_err(|e| self.fail(e, "cart.clear"))
    }

    /// Move a saved product into the cart and off the wishlist.
    ///
    /// # Errors
    ///
    /// Returns the failure after notifying it. If the wishlist removal fails
    /// the product stays in both.
    pub async fn move_to_cart(&self, id: &ProductId, quantity: u32) -> Result<CartItem> {
        let item = self
            .inner
            .wishlist
            .all()
            .into_iter()
            .find(|item| &item.id == id)
            .ok_or_else(|| {
                let err = StoreError::NotFound(format!("wishlist item {id}"));
                self.fail(err, "wishlist.move")
            })?;
        let cart_item = item
            .to_cart_item(1)
            .map_err(|e| self.fail(e.into(), "wishlist.move"))?;
        let line = self.add_to_cart(cart_item, quantity).await?;
        self.inner
            .wishlist
            .remove(id)
            .await
            .map_err(|e| self.fail(e, "wishlist.remove"))?;
        Ok(line)
    }

    #[must_use]
    pub fn cart(&self) -> &CartStore {
        &self.inner.cart
    }

    #[must_use]
    pub fn cart_snapshot(&self) -> CartSnapshot {
        self.inner.cart.snapshot()
    }

    // =========================================================================
    // Wishlist
    // =========================================================================

    /// Save a product. Returns `false` if it was already saved.
    ///
    /// # Errors
    ///
    /// Returns the failure after notifying it.
    pub async fn add_to_wishlist(&self, item: WishlistItem) -> Result<bool> {
        error::add_breadcrumb("wishlist", "Save item", Some(&[("product_id", item.id.as_str())]));
        self.inner
            .wishlist
            .add(item)
            .await
            .map_err(|e| self.fail(e, "wishlist.add"))
    }

    /// Unsave a product. Returns `false` if it was not saved.
    ///
    /// # Errors
    ///
    /// Returns the failure after notifying it.
    pub async fn remove_from_wishlist(&self, id: &ProductId) -> Result<bool> {
        self.inner
            .wishlist
            .remove(id)
            .await
            .map_err(|e| self.fail(e, "wishlist.remove"))
    }

    /// Flip whether a product is saved. Returns whether it is saved now.
    ///
    /// # Errors
    ///
    /// Returns the failure after notifying it.
    pub async fn toggle_wishlist(&self, item: WishlistItem) -> Result<bool> {
        self.inner
            .wishlist
            .toggle(item)
            .await
            .map_err(|e| self.fail(e, "wishlist.toggle"))
    }

    #[must_use]
    pub fn wishlist(&self) -> &WishlistStore {
        &self.inner.wishlist
    }

    // =========================================================================
    // Offers and pricing
    // =========================================================================

    /// Validate and apply an offer.
    ///
    /// Rejections and validation failures are notified by the offer engine.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown offer, or the
    /// validation failure.
    pub async fn apply_offer(&self, id: &OfferId) -> Result<ApplyOutcome> {
        error::add_breadcrumb("offers", "Apply offer", Some(&[("offer_id", id.as_str())]));
        self.inner.offers.apply(id).await.inspect_err(|e| {
            error::report(e, "offers.apply");
        })
    }

    /// Un-apply an offer. Returns whether it was applied.
    pub fn remove_offer(&self, id: &OfferId) -> bool {
        self.inner.offers.remove(id)
    }

    /// Reload the offer catalog. Returns the number of offers.
    ///
    /// # Errors
    ///
    /// Returns the failure after notifying it; the old catalog is kept.
    pub async fn refresh_offers(&self) -> Result<usize> {
        self.inner
            .offers
            .refresh_catalog()
            .await
            .map_err(|e| self.fail(e, "offers.refresh_catalog"))
    }

    #[must_use]
    pub fn offers(&self) -> Vec<OfferView> {
        self.inner.offers.offers()
    }

    #[must_use]
    pub fn eligible_offers(&self) -> Vec<Offer> {
        self.inner.offers.eligible()
    }

    #[must_use]
    pub fn applied_offers(&self) -> Vec<AppliedOffer> {
        self.inner.offers.applied()
    }

    #[must_use]
    pub fn offer_engine(&self) -> &OfferEngine {
        &self.inner.offers
    }

    /// Price the current cart with the offers applied to it.
    #[must_use]
    pub fn price_summary(&self) -> PriceSummary {
        let applied = self.inner.offers.applied();
        let items = self.inner.cart.all();
        PriceSummary::compute(&items, &applied, self.inner.config.tax_rate)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Receive user-facing notifications from now on.
    #[must_use]
    pub fn notifications(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.inner.notifier.subscribe()
    }

    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }
}

fn upgrade(weak: &Weak<StorefrontInner>) -> Option<Storefront> {
    weak.upgrade().map(|inner| Storefront { inner })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use cartwright_core::{DiscountKind, OfferScope, ValidationOutcome};
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::testing::{
        FakeCartService, FakeOfferService, FakeWishlistService, ManualClock, cart_item, offer,
        wishlist_item,
    };

    struct Fixture {
        storage: MemoryStorage,
        cart_remote: FakeCartService,
        offer_remote: FakeOfferService,
        storefront: Storefront,
    }

    async fn fixture(offers: Vec<Offer>) -> Fixture {
        let storage = MemoryStorage::new();
        let cart_remote = FakeCartService::new();
        let offer_remote = FakeOfferService::new(offers);
        let services = Services {
            cart: Arc::new(cart_remote.clone()),
            wishlist: Arc::new(FakeWishlistService::new()),
            offers: Arc::new(offer_remote.clone()),
        };
        let config = EngineConfig {
            tax_rate: "0.2".parse().unwrap(),
            ..EngineConfig::default()
        };
        let storefront = Storefront::open(
            config,
            Arc::new(storage.clone()),
            services,
            Arc::new(ManualClock::new(Utc::now())),
        )
        .await
        .unwrap();
        storefront.start().await;
        Fixture {
            storage,
            cart_remote,
            offer_remote,
            storefront,
        }
    }

    #[tokio::test]
    async fn test_login_merges_and_logout_empties() {
        let fx = fixture(vec![]).await;
        fx.storefront.add_to_cart(cart_item(1, "10"), 2).await.unwrap();
        fx.cart_remote.register(cart_item(1, "10"));

        let outcome = fx
            .storefront
            .login(SecretString::from("token"), Some(UserId::from(9)))
            .await
            .unwrap();
        assert!(matches!(outcome, Some(ReconcileOutcome::Completed(_))));
        assert_eq!(fx.storefront.mode(), SessionMode::Authenticated);
        assert_eq!(fx.cart_remote.quantity_of(&ProductId::from(1)), Some(2));

        fx.storefront.logout().await.unwrap();
        assert!(fx.storefront.cart().all().is_empty());
        assert!(fx.storefront.wishlist().is_empty());
    }

    #[tokio::test]
    async fn test_failed_action_notifies_once() {
        let fx = fixture(vec![]).await;
        let mut notifications = fx.storefront.notifications();
        fx.storefront
            .login(SecretString::from("token"), None)
            .await
            .unwrap();

        // Product unknown to the remote cart
        let result = fx.storefront.add_to_cart(cart_item(5, "1"), 1).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(notifications.try_recv().is_ok());
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_price_summary_with_applied_offer() {
        let now = Utc::now();
        let f5 = offer(
            "F5",
            OfferScope::Product,
            "1",
            DiscountKind::Flat,
            Decimal::from(5),
            now,
        );
        let fx = fixture(vec![f5.clone()]).await;
        fx.offer_remote
            .respond(&f5.id, ValidationOutcome::accepted(Decimal::from(5)));

        fx.storefront.add_to_cart(cart_item(1, "10"), 2).await.unwrap();
        let outcome = fx.storefront.apply_offer(&f5.id).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(_)));

        let summary = fx.storefront.price_summary().rounded();
        assert_eq!(summary.taxable_amount, Decimal::from(15));
        assert_eq!(summary.tax.to_string(), "3.00");
        assert_eq!(summary.total.to_string(), "18.00");
    }

    #[tokio::test]
    async fn test_move_to_cart() {
        let fx = fixture(vec![]).await;
        fx.storefront.add_to_wishlist(wishlist_item(3)).await.unwrap();

        let line = fx
            .storefront
            .move_to_cart(&ProductId::from(3), 2)
            .await
            .unwrap();
        assert_eq!(line.quantity, 2);
        assert!(fx.storefront.wishlist().is_empty());
        assert!(fx.storefront.cart().contains(&ProductId::from(3)));
    }

    #[tokio::test]
    async fn test_session_change_from_other_instance_converges() {
        let fx = fixture(vec![]).await;
        let other = SessionState::new(Arc::new(fx.storage.clone()));
        let mut events = fx.storefront.session().subscribe();

        other
            .login(SecretString::from("elsewhere"), None)
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SessionEvent::LoggedIn { .. }));
        assert!(fx.storefront.session().is_authenticated());

        fx.storefront.shutdown();
    }
}
