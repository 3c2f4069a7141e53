//! The cart store.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use cartwright_core::{CartItem, ItemError, ProductId, SessionMode};
use indexmap::IndexMap;
use indexmap::map::Entry;
use rust_decimal::Decimal;
use tokio::sync::{RwLockWriteGuard, watch};
use tracing::{debug, info, instrument};

use super::locks::MutationLocks;
use super::{Access, Mirror, persist_items, read, remote_failure, write};
use crate::error::Result;
use crate::remote::{RemoteCartService, RemoteError, bounded};
use crate::session::SessionState;
use crate::storage::{self, Storage, keys};

/// Items and the revision they were published at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CartSnapshot {
    pub revision: u64,
    pub items: Vec<CartItem>,
}

/// Ordered cart backed by local storage (guest) or the remote cart service
/// (authenticated). Cheaply cloneable.
#[derive(Clone)]
pub struct CartStore {
    inner: Arc<CartStoreInner>,
}

struct CartStoreInner {
    session: SessionState,
    storage: Arc<dyn Storage>,
    remote: Arc<dyn RemoteCartService>,
    mirror: RwLock<Mirror<CartItem>>,
    locks: MutationLocks,
    snapshots: watch::Sender<CartSnapshot>,
    timeout: Duration,
}

impl CartStore {
    /// Create an empty store. Call [`refresh`](Self::refresh) to load it.
    #[must_use]
    pub fn new(
        session: SessionState,
        storage: Arc<dyn Storage>,
        remote: Arc<dyn RemoteCartService>,
        timeout: Duration,
    ) -> Self {
        let mirror = Mirror::new(SessionMode::Guest, session.epoch());
        Self {
            inner: Arc::new(CartStoreInner {
                session,
                storage,
                remote,
                mirror: RwLock::new(mirror),
                locks: MutationLocks::default(),
                snapshots: watch::Sender::new(CartSnapshot::default()),
                timeout,
            }),
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Add `amount` units of `item`, summing with an existing line.
    ///
    /// `item.quantity` is ignored. Returns the updated line.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] if `amount` is zero, otherwise
    /// any backend failure. The cart is unchanged on error.
    ///
    /// [`StoreError::InvalidInput`]: crate::error::StoreError::InvalidInput
    #[instrument(skip(self, item), fields(product_id = %item.id))]
    pub async fn add(&self, item: CartItem, amount: u32) -> Result<CartItem> {
        if amount == 0 {
            return Err(ItemError::NonPositiveQuantity(0).into());
        }
        let access = Access::item(&self.inner.locks, &self.inner.session, &item.id).await;

        let Some(token) = &access.token else {
            let mut items = self.items();
            let line = match items.entry(item.id.clone()) {
                Entry::Occupied(mut entry) => {
                    let line = entry.get_mut();
                    line.quantity = add_quantity(line.quantity, amount)?;
                    line.clone()
                }
                Entry::Vacant(entry) => entry.insert(item.with_quantity(amount)?).clone(),
            };
            self.commit_guest(access.epoch, items).await?;
            return Ok(line);
        };

        let call = self.inner.remote.add_item(token, &item.id, amount);
        if let Err(e) = bounded(self.inner.timeout, call).await {
            return Err(remote_failure(&self.inner.session, access.epoch, e).await);
        }

        let mut line = item.with_quantity(amount)?;
        self.commit(access.epoch, |mirror| {
            match mirror.items.entry(line.id.clone()) {
                Entry::Occupied(mut entry) => {
                    let existing = entry.get_mut();
                    existing.quantity = existing.quantity.saturating_add(amount);
                    line = existing.clone();
                }
                Entry::Vacant(entry) => {
                    entry.insert(line.clone());
                }
            }
            mirror.bump();
            true
        });
        Ok(line)
    }

    /// Delete a line. Removing an absent id is not an error.
    ///
    /// # Errors
    ///
    /// Returns any backend failure; the cart is unchanged on error.
    #[instrument(skip(self), fields(product_id = %id))]
    pub async fn remove(&self, id: &ProductId) -> Result<()> {
        let access = Access::item(&self.inner.locks, &self.inner.session, id).await;

        let Some(token) = &access.token else {
            let mut items = self.items();
            if items.shift_remove(id).is_none() {
                debug!("Item not in cart, nothing to remove");
                return Ok(());
            }
            return self.commit_guest(access.epoch, items).await;
        };

        let call = self.inner.remote.remove_item(token, id);
        match bounded(self.inner.timeout, call).await {
            Ok(()) => {}
            Err(RemoteError::NotFound(_)) => debug!("Item already absent remotely"),
            Err(e) => return Err(remote_failure(&self.inner.session, access.epoch, e).await),
        }

        self.commit(access.epoch, |mirror| {
            let removed = mirror.items.shift_remove(id).is_some();
            if removed {
                mirror.bump();
            }
            removed
        });
        Ok(())
    }

    /// Overwrite a line's quantity. `quantity <= 0` removes the line.
    ///
    /// Never creates a line: an absent id is a no-op returning `None`.
    ///
    /// # Errors
    ///
    /// Returns an invalid-input error if `quantity` is too large, otherwise
    /// any backend failure.
    #[instrument(skip(self), fields(product_id = %id))]
    pub async fn set_quantity(&self, id: &ProductId, quantity: i64) -> Result<Option<CartItem>> {
        if quantity <= 0 {
            self.remove(id).await?;
            return Ok(None);
        }
        let quantity =
            u32::try_from(quantity).map_err(|_| ItemError::QuantityOverflow(quantity))?;

        let access = Access::item(&self.inner.locks, &self.inner.session, id).await;

        let Some(token) = &access.token else {
            let mut items = self.items();
            let Some(line) = items.get_mut(id) else {
                debug!("Item not in cart, quantity unchanged");
                return Ok(None);
            };
            if line.quantity == quantity {
                return Ok(Some(line.clone()));
            }
            line.quantity = quantity;
            let line = line.clone();
            self.commit_guest(access.epoch, items).await?;
            return Ok(Some(line));
        };

        if !self.contains(id) {
            debug!("Item not in cart, quantity unchanged");
            return Ok(None);
        }

        let call = self.inner.remote.update_item(token, id, quantity);
        match bounded(self.inner.timeout, call).await {
            Ok(()) => {}
            Err(RemoteError::NotFound(_)) => {
                debug!("Item vanished remotely, dropping line");
                self.commit(access.epoch, |mirror| {
                    let removed = mirror.items.shift_remove(id).is_some();
                    if removed {
                        mirror.bump();
                    }
                    removed
                });
                return Ok(None);
            }
            Err(e) => return Err(remote_failure(&self.inner.session, access.epoch, e).await),
        }

        let mut updated = None;
        self.commit(access.epoch, |mirror| {
            let Some(line) = mirror.items.get_mut(id) else {
                return false;
            };
            if line.quantity == quantity {
                updated = Some(line.clone());
                return false;
            }
            line.quantity = quantity;
            updated = Some(line.clone());
            mirror.bump();
            true
        });
        Ok(updated)
    }

    /// Empty the cart.
    ///
    /// # Errors
    ///
    /// Returns any backend failure; the cart is unchanged on error.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        let access = Access::store(&self.inner.locks, &self.inner.session).await;

        match &access.token {
            None => self.inner.storage.remove(keys::CART).await?,
            Some(token) => {
                let call = self.inner.remote.clear_cart(token);
                if let Err(e) = bounded(self.inner.timeout, call).await {
                    return Err(remote_failure(&self.inner.session, access.epoch, e).await);
                }
            }
        }

        self.commit(access.epoch, |mirror| {
            if mirror.items.is_empty() {
                return false;
            }
            mirror.items.clear();
            mirror.bump();
            true
        });
        Ok(())
    }

    /// Reload the mirror from the backend the session currently selects.
    ///
    /// # Errors
    ///
    /// Returns any backend failure; the mirror is unchanged on error.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<()> {
        let gate = self.lock_store().await;
        self.reload_locked(&gate, self.inner.session.epoch())
            .await
            .map(drop)
    }

    // =========================================================================
    // Mode switching
    // =========================================================================

    /// Drop everything after the session left authenticated mode.
    ///
    /// Empties the mirror at once, then waits for a running merge. A guest
    /// cart still on disk afterwards was never merged: it moves to the merge
    /// remainder, which is not shown and is retried at the next login.
    ///
    /// # Errors
    ///
    /// Returns an error if the leftover guest cart cannot be moved.
    #[instrument(skip(self))]
    pub async fn switch_to_guest(&self) -> Result<()> {
        let (session, epoch) = self.inner.session.snapshot();
        if session.is_authenticated() {
            return Ok(());
        }
        {
            let mut mirror = write(&self.inner.mirror);
            if mirror.replace(SessionMode::Guest, epoch, IndexMap::new()) {
                self.publish(&mirror);
            }
        }

        let _gate = self.lock_store().await;
        let storage = self.inner.storage.as_ref();
        let leftover: Vec<CartItem> = storage::load_list_lenient(storage, keys::CART).await?;
        if !leftover.is_empty() {
            let count = leftover.len();
            let mut pending: Vec<CartItem> =
                storage::load_list_lenient(storage, keys::CART_MERGE_REMAINDER).await?;
            pending.extend(leftover);
            persist_items(storage, keys::CART_MERGE_REMAINDER, &index_items(pending)).await?;
            info!(count, "Unmerged guest cart kept for the next login");
        }
        storage.remove(keys::CART).await?;
        info!(epoch, "Cart switched to guest mode");
        Ok(())
    }

    /// Take the store gate, waiting for in-flight mutations.
    pub(crate) async fn lock_store(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.locks.exclusive().await
    }

    /// Reload the mirror for `epoch` while the caller holds the store gate.
    ///
    /// Returns `false` without touching the mirror if the session has moved
    /// past `epoch`.
    pub(crate) async fn reload_locked(
        &self,
        _gate: &RwLockWriteGuard<'_, ()>,
        epoch: u64,
    ) -> Result<bool> {
        let (session, current_epoch) = self.inner.session.snapshot();
        if current_epoch != epoch {
            return Ok(false);
        }

        let (mode, items) = match session.token() {
            Some(token) => {
                let call = self.inner.remote.get_cart(token);
                let items = match bounded(self.inner.timeout, call).await {
                    Ok(items) => items,
                    Err(e) => return Err(remote_failure(&self.inner.session, epoch, e).await),
                };
                (SessionMode::Authenticated, index_items(items))
            }
            None => {
                let items =
                    storage::load_list_lenient(self.inner.storage.as_ref(), keys::CART).await?;
                (SessionMode::Guest, index_items(items))
            }
        };

        let mut mirror = write(&self.inner.mirror);
        if self.inner.session.epoch() != epoch {
            debug!(epoch, "Discarding reload for superseded session");
            return Ok(false);
        }
        if mirror.replace(mode, epoch, items) {
            self.publish(&mirror);
        }
        Ok(true)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Snapshot of every line, in backend order.
    #[must_use]
    pub fn all(&self) -> Vec<CartItem> {
        self.settled(|mirror| mirror.items.values().cloned().collect())
    }

    #[must_use]
    pub fn get(&self, id: &ProductId) -> Option<CartItem> {
        self.settled(|mirror| mirror.items.get(id).cloned())
    }

    #[must_use]
    pub fn contains(&self, id: &ProductId) -> bool {
        self.settled(|mirror| mirror.items.contains_key(id))
    }

    /// Number of distinct lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.settled(|mirror| mirror.items.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of every line's quantity.
    #[must_use]
    pub fn total_item_count(&self) -> u64 {
        self.settled(|mirror| {
            mirror
                .items
                .values()
                .map(|item| u64::from(item.quantity))
                .sum()
        })
    }

    /// `Σ unit_price × quantity`, unrounded.
    #[must_use]
    pub fn total_price(&self) -> Decimal {
        self.settled(|mirror| mirror.items.values().map(CartItem::line_total).sum())
    }

    /// Bumped whenever the cart's composition changes.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.settled(|mirror| mirror.revision)
    }

    /// Items and revision read together.
    #[must_use]
    pub fn snapshot(&self) -> CartSnapshot {
        self.settled(|mirror| CartSnapshot {
            revision: mirror.revision,
            items: mirror.items.values().cloned().collect(),
        })
    }

    /// Backend the mirror currently reflects.
    #[must_use]
    pub fn mode(&self) -> SessionMode {
        self.settled(|mirror| mirror.mode)
    }

    /// Receive a snapshot whenever the cart changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<CartSnapshot> {
        self.inner.snapshots.subscribe()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn settled<R>(&self, f: impl FnOnce(&Mirror<CartItem>) -> R) -> R {
        {
            let mirror = read(&self.inner.mirror);
            if !mirror.is_stale(&self.inner.session) {
                return f(&mirror);
            }
        }
        let mut mirror = write(&self.inner.mirror);
        if mirror.settle(&self.inner.session, "cart") {
            self.publish(&mirror);
        }
        f(&mirror)
    }

    /// Working copy of the guest items.
    fn items(&self) -> IndexMap<ProductId, CartItem> {
        self.settled(|mirror| mirror.items.clone())
    }

    async fn commit_guest(&self, epoch: u64, items: IndexMap<ProductId, CartItem>) -> Result<()> {
        persist_items(self.inner.storage.as_ref(), keys::CART, &items).await?;
        self.commit(epoch, |mirror| mirror.replace(SessionMode::Guest, epoch, items));
        Ok(())
    }

    /// Apply `f` to the mirror if it still belongs to `epoch`.
    fn commit(&self, epoch: u64, f: impl FnOnce(&mut Mirror<CartItem>) -> bool) -> bool {
        let mut mirror = write(&self.inner.mirror);
        let settled = mirror.settle(&self.inner.session, "cart");
        let changed = if self.inner.session.epoch() == epoch && mirror.epoch == epoch {
            f(&mut mirror)
        } else {
            debug!(epoch, "Discarding result for superseded session");
            false
        };
        if settled || changed {
            self.publish(&mirror);
        }
        changed
    }

    fn publish(&self, mirror: &Mirror<CartItem>) {
        self.inner.snapshots.send_replace(CartSnapshot {
            revision: mirror.revision,
            items: mirror.items.values().cloned().collect(),
        });
    }
}

fn add_quantity(current: u32, amount: u32) -> Result<u32> {
    current
        .checked_add(amount)
        .ok_or_else(|| ItemError::QuantityOverflow(i64::from(current) + i64::from(amount)).into())
}

/// Index items by id, summing the quantities of repeated ids.
pub(crate) fn index_items(items: Vec<CartItem>) -> IndexMap<ProductId, CartItem> {
    let mut indexed = IndexMap::with_capacity(items.len());
    for item in items {
        match indexed.entry(item.id.clone()) {
            Entry::Occupied(mut entry) => {
                let line: &mut CartItem = entry.get_mut();
                line.quantity = line.quantity.saturating_add(item.quantity);
            }
            Entry::Vacant(entry) => {
                entry.insert(item);
            }
        }
    }
    indexed
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::error::StoreError;
    use crate::storage::MemoryStorage;
    use crate::testing::{FakeCartService, cart_item};

    struct Fixture {
        session: SessionState,
        storage: MemoryStorage,
        remote: FakeCartService,
        cart: CartStore,
    }

    fn fixture() -> Fixture {
        let storage = MemoryStorage::new();
        let session = SessionState::new(Arc::new(storage.clone()));
        let remote = FakeCartService::new();
        let cart = CartStore::new(
            session.clone(),
            Arc::new(storage.clone()),
            Arc::new(remote.clone()),
            Duration::from_secs(5),
        );
        Fixture {
            session,
            storage,
            remote,
            cart,
        }
    }

    async fn authenticated() -> Fixture {
        let fx = fixture();
        fx.session
            .login(SecretString::from("token"), None)
            .await
            .unwrap();
        fx.cart.refresh().await.unwrap();
        fx
    }

    fn id(n: i64) -> ProductId {
        ProductId::from(n)
    }

    #[tokio::test]
    async fn test_guest_add_sums_quantities() {
        let fx = fixture();
        fx.cart.add(cart_item(1, "10"), 2).await.unwrap();
        let line = fx.cart.add(cart_item(1, "10"), 3).await.unwrap();

        assert_eq!(line.quantity, 5);
        assert_eq!(fx.cart.len(), 1);
        assert_eq!(fx.cart.total_item_count(), 5);
    }

    #[tokio::test]
    async fn test_guest_add_zero_rejected() {
        let fx = fixture();
        let result = fx.cart.add(cart_item(1, "10"), 0).await;
        assert!(matches!(result, Err(StoreError::InvalidInput(_))));
        assert!(fx.cart.is_empty());
    }

    #[tokio::test]
    async fn test_guest_cart_is_persisted_in_order() {
        let fx = fixture();
        fx.cart.add(cart_item(3, "1"), 1).await.unwrap();
        fx.cart.add(cart_item(1, "1"), 1).await.unwrap();
        fx.cart.add(cart_item(2, "1"), 1).await.unwrap();

        let reloaded = CartStore::new(
            fx.session.clone(),
            Arc::new(fx.storage.clone()),
            Arc::new(fx.remote.clone()),
            Duration::from_secs(5),
        );
        reloaded.refresh().await.unwrap();
        let ids: Vec<_> = reloaded.all().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![id(3), id(1), id(2)]);
    }

    #[tokio::test]
    async fn test_set_quantity_zero_is_remove() {
        let fx = fixture();
        fx.cart.add(cart_item(1, "10"), 2).await.unwrap();

        assert_eq!(fx.cart.set_quantity(&id(1), 0).await.unwrap(), None);
        assert!(fx.cart.is_empty());
        assert!(fx.storage.get(keys::CART).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_quantity_never_creates() {
        let fx = fixture();
        assert_eq!(fx.cart.set_quantity(&id(9), 4).await.unwrap(), None);
        assert!(fx.cart.is_empty());
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let fx = fixture();
        let before = fx.cart.revision();
        fx.cart.remove(&id(1)).await.unwrap();
        assert_eq!(fx.cart.revision(), before);
    }

    #[tokio::test]
    async fn test_totals() {
        let fx = fixture();
        fx.cart.add(cart_item(1, "10"), 2).await.unwrap();
        fx.cart.add(cart_item(2, "2.50"), 3).await.unwrap();
        assert_eq!(fx.cart.total_item_count(), 5);
        assert_eq!(fx.cart.total_price(), Decimal::new(2750, 2));
    }

    #[tokio::test]
    async fn test_revision_and_watch() {
        let fx = fixture();
        let mut rx = fx.cart.watch();
        fx.cart.add(cart_item(1, "10"), 1).await.unwrap();

        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.revision, fx.cart.revision());
        assert_eq!(snapshot.items.len(), 1);

        // Same quantity is not a change
        fx.cart.set_quantity(&id(1), 1).await.unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_authenticated_add_round_trips() {
        let fx = authenticated().await;
        fx.remote.register(cart_item(1, "10"));

        let line = fx.cart.add(cart_item(1, "10"), 2).await.unwrap();
        assert_eq!(line.quantity, 2);
        assert_eq!(fx.remote.quantity_of(&id(1)), Some(2));
        assert_eq!(fx.cart.all(), fx.remote.items());
        // Guest storage is untouched
        assert!(fx.storage.get(keys::CART).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_authenticated_failure_leaves_mirror_unchanged() {
        let fx = authenticated().await;
        fx.remote.seed(cart_item(1, "10").with_quantity(2).unwrap());
        fx.cart.refresh().await.unwrap();
        let before = fx.cart.snapshot();

        fx.remote.fail_on(&id(1));
        let result = fx.cart.set_quantity(&id(1), 7).await;
        assert!(matches!(result, Err(StoreError::NetworkFailure { .. })));
        assert_eq!(fx.cart.snapshot(), before);
    }

    #[tokio::test]
    async fn test_authenticated_remove_not_found_is_ok() {
        let fx = authenticated().await;
        fx.cart.remove(&id(42)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_expires_session_and_clears() {
        let fx = authenticated().await;
        fx.remote.seed(cart_item(1, "10"));
        fx.cart.refresh().await.unwrap();
        assert_eq!(fx.cart.len(), 1);

        fx.remote.set_unauthorized(true);
        let result = fx.cart.add(cart_item(2, "5"), 1).await;
        assert!(matches!(result, Err(StoreError::AuthRequired)));
        assert!(!fx.session.is_authenticated());
        assert!(fx.cart.is_empty());
    }

    #[tokio::test]
    async fn test_logout_empties_visible_cart_immediately() {
        let fx = authenticated().await;
        fx.remote.seed(cart_item(1, "10"));
        fx.cart.refresh().await.unwrap();

        fx.session.logout().await.unwrap();
        assert!(fx.cart.all().is_empty());
        assert_eq!(fx.cart.mode(), SessionMode::Guest);
    }

    #[tokio::test]
    async fn test_switch_to_guest_moves_unmerged_cart_aside() {
        let fx = fixture();
        fx.cart.add(cart_item(1, "10"), 1).await.unwrap();
        fx.session
            .login(SecretString::from("token"), None)
            .await
            .unwrap();
        fx.session.logout().await.unwrap();

        fx.cart.switch_to_guest().await.unwrap();
        assert!(fx.cart.is_empty());
        assert!(fx.storage.get(keys::CART).await.unwrap().is_none());

        let pending: Vec<CartItem> =
            storage::load_list_lenient(&fx.storage, keys::CART_MERGE_REMAINDER)
                .await
                .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id(1));

        // A fresh guest session starts empty
        fx.cart.refresh().await.unwrap();
        assert!(fx.cart.is_empty());
    }

    #[tokio::test]
    async fn test_remote_duplicates_are_collapsed() {
        let fx = authenticated().await;
        fx.remote.seed(cart_item(1, "10"));
        fx.remote.seed_duplicate(cart_item(1, "10").with_quantity(2).unwrap());
        fx.cart.refresh().await.unwrap();

        assert_eq!(fx.cart.len(), 1);
        assert_eq!(fx.cart.total_item_count(), 3);
    }
}
