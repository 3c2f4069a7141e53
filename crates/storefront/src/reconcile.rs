//! Guest-to-account merge performed at login.
//!
//! # Protocol
//!
//! 1. Snapshot the guest cart (plus the remainder of an earlier partial
//!    merge, quantities summed) and the guest wishlist (set union).
//! 2. Push every item to the remote store. Items already present remotely
//!    are summed server-side. Individual failures are collected.
//! 3. Reload the mirrors from the remote store.
//! 4. Only then discard the guest snapshot. Failed items move to a separate
//!    remainder key and are retried at the next login.
//!
//! An interruption before step 4 leaves the guest data in place, so every
//! item is merged at least once. A session change mid-run discards the
//! reload; items not yet confirmed by the remote store move to the remainder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cartwright_core::{CartItem, ProductId, WishlistItem};
use indexmap::IndexMap;
use secrecy::SecretString;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StoreError};
use crate::notify::Notifier;
use crate::remote::{RemoteCartService, RemoteWishlistService, bounded};
use crate::session::SessionState;
use crate::storage::{self, Storage, keys};
use crate::store::{
    CartStore, WishlistStore, index_cart_items, index_wishlist_items, persist_items,
    remote_failure,
};

/// Which store a merge item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeTarget {
    Cart,
    Wishlist,
}

/// An item that could not be merged.
#[derive(Debug)]
pub struct MergeFailure {
    pub target: MergeTarget,
    pub product_id: ProductId,
    /// Units that failed to move (1 for wishlist items).
    pub quantity: u32,
    pub error: StoreError,
}

/// Result of a completed merge.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub epoch: u64,
    /// Cart lines pushed successfully.
    pub cart_merged: usize,
    /// Wishlist items pushed successfully.
    pub wishlist_merged: usize,
    pub failures: Vec<MergeFailure>,
}

impl ReconcileReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// How a call to [`Reconciler::run`] ended.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// The merge ran to completion, possibly with item failures.
    Completed(ReconcileReport),
    /// Another run was in flight; this trigger was ignored.
    AlreadyRunning,
    /// This epoch was already merged.
    AlreadyMerged,
    /// The session changed during the run. The mirrors were not reloaded and
    /// unconfirmed items wait in the remainder for the next login.
    Superseded,
}

/// Runs the merge once per login. Cheaply cloneable.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<ReconcilerInner>,
}

struct ReconcilerInner {
    session: SessionState,
    storage: Arc<dyn Storage>,
    cart: CartStore,
    wishlist: WishlistStore,
    cart_remote: Arc<dyn RemoteCartService>,
    wishlist_remote: Arc<dyn RemoteWishlistService>,
    notifier: Notifier,
    timeout: Duration,
    running: AtomicBool,
    /// Last epoch merged to completion. `None` until the first merge, so a
    /// session restored at epoch 0 is merged exactly once.
    merged_epoch: Mutex<Option<u64>>,
}

/// Clears the running flag however the run ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Guest data captured at the start of a run.
struct GuestSnapshot {
    cart: IndexMap<ProductId, CartItem>,
    wishlist: IndexMap<ProductId, WishlistItem>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        session: SessionState,
        storage: Arc<dyn Storage>,
        cart: CartStore,
        wishlist: WishlistStore,
        cart_remote: Arc<dyn RemoteCartService>,
        wishlist_remote: Arc<dyn RemoteWishlistService>,
        notifier: Notifier,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ReconcilerInner {
                session,
                storage,
                cart,
                wishlist,
                cart_remote,
                wishlist_remote,
                notifier,
                timeout,
                running: AtomicBool::new(false),
                merged_epoch: Mutex::new(None),
            }),
        }
    }

    /// Whether a run is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Merge guest state into the account for the session at `epoch`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AuthRequired`] if the token is refused (the
    /// session is expired and unmerged items move to the remainder), or the
    /// error of the final remote reload (guest data is kept).
    #[instrument(skip(self))]
    pub async fn run(&self, epoch: u64) -> Result<ReconcileOutcome> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Merge already in flight, ignoring trigger");
            return Ok(ReconcileOutcome::AlreadyRunning);
        }
        let _running = RunningGuard(&self.inner.running);

        if self.is_merged(epoch) {
            debug!("Epoch already merged");
            return Ok(ReconcileOutcome::AlreadyMerged);
        }

        let (session, current_epoch) = self.inner.session.snapshot();
        let Some(token) = session.token().cloned() else {
            return Ok(ReconcileOutcome::Superseded);
        };
        if current_epoch != epoch {
            return Ok(ReconcileOutcome::Superseded);
        }

        // Guest writes and item mutations wait until the merge is done
        let cart_gate = self.inner.cart.lock_store().await;
        let wishlist_gate = self.inner.wishlist.lock_store().await;
        if self.inner.session.epoch() != epoch {
            // Leaving the session already moved the guest data aside
            debug!("Session changed before merge started");
            return Ok(ReconcileOutcome::Superseded);
        }

        let snapshot = self.snapshot().await?;
        let mut report = ReconcileReport {
            epoch,
            ..ReconcileReport::default()
        };

        let cart_remainder = self
            .push_cart(&token, epoch, &snapshot.cart, &mut report)
            .await;
        let wishlist_remainder = self
            .push_wishlist(&token, epoch, &snapshot.wishlist, &mut report)
            .await;

        let refused = report
            .failures
            .iter()
            .any(|failure| matches!(failure.error, StoreError::AuthRequired));
        if refused || self.inner.session.epoch() != epoch {
            self.discard_snapshot(&cart_remainder, &wishlist_remainder)
                .await?;
            if refused {
                warn!("Token refused during merge, unmerged items kept");
                return Err(StoreError::AuthRequired);
            }
            info!("Session changed during merge, unmerged items kept");
            return Ok(ReconcileOutcome::Superseded);
        }

        let reloaded: Result<bool> = async {
            Ok(self.inner.cart.reload_locked(&cart_gate, epoch).await?
                && self
                    .inner
                    .wishlist
                    .reload_locked(&wishlist_gate, epoch)
                    .await?)
        }
        .await;
        match reloaded {
            Ok(true) => {}
            Ok(false) => {
                self.discard_snapshot(&cart_remainder, &wishlist_remainder)
                    .await?;
                info!("Session changed during merge, unmerged items kept");
                return Ok(ReconcileOutcome::Superseded);
            }
            Err(e) => {
                // Still signed in: the guest data stays for a later attempt
                if self.inner.session.epoch() != epoch {
                    self.discard_snapshot(&cart_remainder, &wishlist_remainder)
                        .await?;
                }
                return Err(e);
            }
        }

        self.discard_snapshot(&cart_remainder, &wishlist_remainder)
            .await?;
        *self
            .inner
            .merged_epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(epoch);

        if !report.is_clean() {
            self.inner.notifier.warning(format!(
                "{} saved item(s) could not be added to your account. \
                 We'll try again next time you sign in.",
                report.failures.len()
            ));
        }
        info!(
            cart_merged = report.cart_merged,
            wishlist_merged = report.wishlist_merged,
            failed = report.failures.len(),
            "Guest state merged"
        );
        Ok(ReconcileOutcome::Completed(report))
    }

    fn is_merged(&self, epoch: u64) -> bool {
        self.inner
            .merged_epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|merged| merged >= epoch)
    }

    async fn snapshot(&self) -> Result<GuestSnapshot> {
        let storage = self.inner.storage.as_ref();

        let mut cart: Vec<CartItem> = storage::load_list_lenient(storage, keys::CART).await?;
        cart.extend(
            storage::load_list_lenient::<CartItem>(storage, keys::CART_MERGE_REMAINDER).await?,
        );

        let mut wishlist: Vec<WishlistItem> =
            storage::load_list_lenient(storage, keys::WISHLIST).await?;
        wishlist.extend(
            storage::load_list_lenient::<WishlistItem>(storage, keys::WISHLIST_MERGE_REMAINDER)
                .await?,
        );

        Ok(GuestSnapshot {
            cart: index_cart_items(cart),
            wishlist: index_wishlist_items(wishlist),
        })
    }

    /// Push guest cart lines. Returns the lines the remote store did not
    /// confirm, including those skipped after the session changed.
    async fn push_cart(
        &self,
        token: &SecretString,
        epoch: u64,
        items: &IndexMap<ProductId, CartItem>,
        report: &mut ReconcileReport,
    ) -> IndexMap<ProductId, CartItem> {
        let mut remainder = IndexMap::new();
        for (id, item) in items {
            if self.inner.session.epoch() != epoch {
                remainder.insert(id.clone(), item.clone());
                continue;
            }
            let call = self.inner.cart_remote.add_item(token, id, item.quantity);
            match bounded(self.inner.timeout, call).await {
                Ok(()) => report.cart_merged += 1,
                Err(e) => {
                    let error = remote_failure(&self.inner.session, epoch, e).await;
                    warn!(product_id = %id, error = %error, "Failed to merge cart item");
                    report.failures.push(MergeFailure {
                        target: MergeTarget::Cart,
                        product_id: id.clone(),
                        quantity: item.quantity,
                        error,
                    });
                    remainder.insert(id.clone(), item.clone());
                }
            }
        }
        remainder
    }

    /// Push guest wishlist items. Returns the items the remote store did not
    /// confirm.
    async fn push_wishlist(
        &self,
        token: &SecretString,
        epoch: u64,
        items: &IndexMap<ProductId, WishlistItem>,
        report: &mut ReconcileReport,
    ) -> IndexMap<ProductId, WishlistItem> {
        let mut remainder = IndexMap::new();
        for (id, item) in items {
            if self.inner.session.epoch() != epoch {
                remainder.insert(id.clone(), item.clone());
                continue;
            }
            let call = self.inner.wishlist_remote.add_item(token, id);
            match bounded(self.inner.timeout, call).await {
                Ok(()) => report.wishlist_merged += 1,
                Err(e) => {
                    let error = remote_failure(&self.inner.session, epoch, e).await;
                    warn!(product_id = %id, error = %error, "Failed to merge wishlist item");
                    report.failures.push(MergeFailure {
                        target: MergeTarget::Wishlist,
                        product_id: id.clone(),
                        quantity: 1,
                        error,
                    });
                    remainder.insert(id.clone(), item.clone());
                }
            }
        }
        remainder
    }

    /// Drop the guest copy, keeping `*_remainder` for the next login.
    async fn discard_snapshot(
        &self,
        cart_remainder: &IndexMap<ProductId, CartItem>,
        wishlist_remainder: &IndexMap<ProductId, WishlistItem>,
    ) -> Result<()> {
        let storage = self.inner.storage.as_ref();
        storage.remove(keys::CART).await?;
        storage.remove(keys::WISHLIST).await?;
        persist_items(storage, keys::CART_MERGE_REMAINDER, cart_remainder).await?;
        persist_items(storage, keys::WISHLIST_MERGE_REMAINDER, wishlist_remainder).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::testing::{FakeCartService, FakeWishlistService, cart_item, wishlist_item};

    struct Fixture {
        session: SessionState,
        storage: MemoryStorage,
        remote: FakeCartService,
        wishlist_remote: FakeWishlistService,
        cart: CartStore,
        wishlist: WishlistStore,
        reconciler: Reconciler,
        notifier: Notifier,
    }

    fn fixture() -> Fixture {
        let storage = MemoryStorage::new();
        let session = SessionState::new(Arc::new(storage.clone()));
        fixture_on(storage, session)
    }

    fn fixture_on(storage: MemoryStorage, session: SessionState) -> Fixture {
        let shared: Arc<dyn Storage> = Arc::new(storage.clone());
        let remote = FakeCartService::new();
        let wishlist_remote = FakeWishlistService::new();
        let timeout = Duration::from_secs(5);
        let cart = CartStore::new(
            session.clone(),
            Arc::clone(&shared),
            Arc::new(remote.clone()),
            timeout,
        );
        let wishlist = WishlistStore::new(
            session.clone(),
            Arc::clone(&shared),
            Arc::new(wishlist_remote.clone()),
            timeout,
        );
        let notifier = Notifier::new();
        let reconciler = Reconciler::new(
            session.clone(),
            shared,
            cart.clone(),
            wishlist.clone(),
            Arc::new(remote.clone()),
            Arc::new(wishlist_remote.clone()),
            notifier.clone(),
            timeout,
        );
        Fixture {
            session,
            storage,
            remote,
            wishlist_remote,
            cart,
            wishlist,
            reconciler,
            notifier,
        }
    }

    async fn login(fx: &Fixture) -> u64 {
        fx.session
            .login(SecretString::from("token"), None)
            .await
            .unwrap()
            .unwrap()
            .epoch()
    }

    fn quantities(items: &[CartItem]) -> HashMap<ProductId, u32> {
        items.iter().map(|i| (i.id.clone(), i.quantity)).collect()
    }

    #[tokio::test]
    async fn test_merge_sums_with_remote_cart() {
        let fx = fixture();
        fx.cart.add(cart_item(1, "10"), 2).await.unwrap();
        fx.cart.add(cart_item(2, "5"), 1).await.unwrap();
        fx.remote.seed(cart_item(2, "5"));
        fx.remote.seed(cart_item(3, "1").with_quantity(5).unwrap());
        fx.remote.register(cart_item(1, "10"));

        let epoch = login(&fx).await;
        let outcome = fx.reconciler.run(epoch).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Completed(ref r) if r.is_clean()));

        let merged = quantities(&fx.cart.all());
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[&ProductId::from(1)], 2);
        assert_eq!(merged[&ProductId::from(2)], 2);
        assert_eq!(merged[&ProductId::from(3)], 5);
        assert!(fx.storage.get(keys::CART).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_guest_cart_only_refreshes() {
        let fx = fixture();
        fx.remote.seed(cart_item(7, "3"));

        let epoch = login(&fx).await;
        fx.reconciler.run(epoch).await.unwrap();
        assert_eq!(fx.remote.add_calls(), 0);
        assert_eq!(fx.cart.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_remainder_for_next_login() {
        let fx = fixture();
        let mut notifications = fx.notifier.subscribe();
        fx.cart.add(cart_item(1, "10"), 2).await.unwrap();
        fx.cart.add(cart_item(2, "5"), 1).await.unwrap();
        fx.remote.register(cart_item(1, "10"));
        fx.remote.register(cart_item(2, "5"));
        fx.remote.fail_on(&ProductId::from(2));

        let epoch = login(&fx).await;
        let ReconcileOutcome::Completed(report) = fx.reconciler.run(epoch).await.unwrap() else {
            panic!("merge did not complete");
        };
        assert_eq!(report.cart_merged, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].product_id, ProductId::from(2));

        // One summary notification
        assert!(notifications.try_recv().is_ok());
        assert!(notifications.try_recv().is_err());

        let remainder: Vec<CartItem> =
            storage::load_list_lenient(&fx.storage, keys::CART_MERGE_REMAINDER)
                .await
                .unwrap();
        assert_eq!(remainder.len(), 1);

        // Next login retries the remainder
        fx.remote.clear_failures();
        fx.session.logout().await.unwrap();
        let epoch = login(&fx).await;
        fx.reconciler.run(epoch).await.unwrap();
        assert_eq!(fx.remote.quantity_of(&ProductId::from(2)), Some(1));
        assert!(
            fx.storage
                .get(keys::CART_MERGE_REMAINDER)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_guest_cart() {
        let fx = fixture();
        fx.cart.add(cart_item(1, "10"), 1).await.unwrap();
        fx.remote.register(cart_item(1, "10"));
        fx.remote.fail_reads(true);

        let epoch = login(&fx).await;
        assert!(fx.reconciler.run(epoch).await.is_err());
        assert!(fx.storage.get(keys::CART).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unauthorized_expires_and_keeps_items_for_next_login() {
        let fx = fixture();
        fx.cart.add(cart_item(1, "10"), 1).await.unwrap();
        fx.cart.add(cart_item(2, "5"), 3).await.unwrap();
        fx.remote.set_unauthorized(true);

        let epoch = login(&fx).await;
        let result = fx.reconciler.run(epoch).await;
        assert!(matches!(result, Err(StoreError::AuthRequired)));
        assert!(!fx.session.is_authenticated());

        let remainder: Vec<CartItem> =
            storage::load_list_lenient(&fx.storage, keys::CART_MERGE_REMAINDER)
                .await
                .unwrap();
        assert_eq!(
            quantities(&remainder),
            HashMap::from([(ProductId::from(1), 1), (ProductId::from(2), 3)])
        );
        assert!(fx.storage.get(keys::CART).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_epoch_never_merges_twice() {
        let fx = fixture();
        fx.cart.add(cart_item(1, "10"), 1).await.unwrap();
        fx.remote.register(cart_item(1, "10"));

        let epoch = login(&fx).await;
        fx.reconciler.run(epoch).await.unwrap();
        let again = fx.reconciler.run(epoch).await.unwrap();
        assert!(matches!(again, ReconcileOutcome::AlreadyMerged));
        assert_eq!(fx.remote.quantity_of(&ProductId::from(1)), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_trigger_is_ignored() {
        let fx = fixture();
        fx.cart.add(cart_item(1, "10"), 1).await.unwrap();
        fx.remote.register(cart_item(1, "10"));
        fx.remote.set_delay(Duration::from_secs(1));

        let epoch = login(&fx).await;
        let first = {
            let reconciler = fx.reconciler.clone();
            tokio::spawn(async move { reconciler.run(epoch).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fx.reconciler.is_running());

        let second = fx.reconciler.run(epoch).await.unwrap();
        assert!(matches!(second, ReconcileOutcome::AlreadyRunning));
        assert!(matches!(
            first.await.unwrap().unwrap(),
            ReconcileOutcome::Completed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_merge_keeps_unpushed_items() {
        let fx = fixture();
        fx.cart.add(cart_item(1, "10"), 1).await.unwrap();
        fx.cart.add(cart_item(2, "5"), 1).await.unwrap();
        fx.wishlist.add(wishlist_item(3)).await.unwrap();
        fx.remote.register(cart_item(1, "10"));
        fx.remote.register(cart_item(2, "5"));
        fx.remote.set_delay(Duration::from_secs(1));

        let epoch = login(&fx).await;
        let run = {
            let reconciler = fx.reconciler.clone();
            tokio::spawn(async move { reconciler.run(epoch).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.session.logout().await.unwrap();

        let outcome = run.await.unwrap().unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Superseded));
        assert!(fx.cart.all().is_empty());

        // The line in flight landed; the rest waits for the next login
        assert_eq!(fx.remote.quantity_of(&ProductId::from(1)), Some(1));
        assert_eq!(fx.remote.quantity_of(&ProductId::from(2)), None);
        let remainder: Vec<CartItem> =
            storage::load_list_lenient(&fx.storage, keys::CART_MERGE_REMAINDER)
                .await
                .unwrap();
        assert_eq!(quantities(&remainder), HashMap::from([(ProductId::from(2), 1)]));
        let saved: Vec<WishlistItem> =
            storage::load_list_lenient(&fx.storage, keys::WISHLIST_MERGE_REMAINDER)
                .await
                .unwrap();
        assert_eq!(saved.len(), 1);
        assert!(fx.storage.get(keys::CART).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restored_session_merges_once() {
        let storage = MemoryStorage::new();
        let guest = fixture_on(storage.clone(), SessionState::new(Arc::new(storage.clone())));
        guest.cart.add(cart_item(1, "10"), 1).await.unwrap();
        login(&guest).await;

        let restored = SessionState::restore(Arc::new(storage.clone()))
            .await
            .unwrap();
        assert_eq!(restored.epoch(), 0);
        let fx = fixture_on(storage, restored);
        fx.remote.register(cart_item(1, "10"));

        let first = fx.reconciler.run(0).await.unwrap();
        assert!(matches!(first, ReconcileOutcome::Completed(_)));
        let again = fx.reconciler.run(0).await.unwrap();
        assert!(matches!(again, ReconcileOutcome::AlreadyMerged));
        assert_eq!(fx.remote.quantity_of(&ProductId::from(1)), Some(1));
    }

    #[tokio::test]
    async fn test_wishlist_merge_is_a_union() {
        let fx = fixture();
        fx.wishlist.add(wishlist_item(1)).await.unwrap();
        fx.wishlist.add(wishlist_item(2)).await.unwrap();
        fx.wishlist_remote.seed(wishlist_item(2));
        fx.wishlist_remote.register(wishlist_item(1));

        let epoch = login(&fx).await;
        fx.reconciler.run(epoch).await.unwrap();

        assert_eq!(fx.wishlist.len(), 2);
        assert!(fx.storage.get(keys::WISHLIST).await.unwrap().is_none());
    }
}
