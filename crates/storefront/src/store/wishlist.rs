//! The wishlist store.
//!
//! Same dual-backend rules as the cart, with set semantics: adding a product
//! that is already saved is a no-op.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use cartwright_core::{ProductId, SessionMode, WishlistItem};
use indexmap::IndexMap;
use tokio::sync::RwLockWriteGuard;
use tracing::{debug, info, instrument};

use super::locks::MutationLocks;
use super::{Access, Mirror, persist_items, read, remote_failure, write};
use crate::error::Result;
use crate::remote::{RemoteError, RemoteWishlistService, bounded};
use crate::session::SessionState;
use crate::storage::{self, Storage, keys};

/// Saved-for-later products. Cheaply cloneable.
#[derive(Clone)]
pub struct WishlistStore {
    inner: Arc<WishlistStoreInner>,
}

struct WishlistStoreInner {
    session: SessionState,
    storage: Arc<dyn Storage>,
    remote: Arc<dyn RemoteWishlistService>,
    mirror: RwLock<Mirror<WishlistItem>>,
    locks: MutationLocks,
    timeout: Duration,
}

impl WishlistStore {
    #[must_use]
    pub fn new(
        session: SessionState,
        storage: Arc<dyn Storage>,
        remote: Arc<dyn RemoteWishlistService>,
        timeout: Duration,
    ) -> Self {
        let mirror = Mirror::new(SessionMode::Guest, session.epoch());
        Self {
            inner: Arc::new(WishlistStoreInner {
                session,
                storage,
                remote,
                mirror: RwLock::new(mirror),
                locks: MutationLocks::default(),
                timeout,
            }),
        }
    }

    /// Save a product. Returns `false` if it was already saved.
    ///
    /// # Errors
    ///
    /// Returns any backend failure; the wishlist is unchanged on error.
    #[instrument(skip(self, item), fields(product_id = %item.id))]
    pub async fn add(&self, item: WishlistItem) -> Result<bool> {
        let access = Access::item(&self.inner.locks, &self.inner.session, &item.id).await;
        if self.contains(&item.id) {
            debug!("Already in wishlist");
            return Ok(false);
        }

        let Some(token) = &access.token else {
            let mut items = self.items();
            items.insert(item.id.clone(), item);
            self.commit_guest(access.epoch, items).await?;
            return Ok(true);
        };

        let call = self.inner.remote.add_item(token, &item.id);
        if let Err(e) = bounded(self.inner.timeout, call).await {
            return Err(remote_failure(&self.inner.session, access.epoch, e).await);
        }
        Ok(self.commit(access.epoch, |mirror| {
            if mirror.items.contains_key(&item.id) {
                return false;
            }
            mirror.items.insert(item.id.clone(), item);
            mirror.bump();
            true
        }))
    }

    /// Remove a product. Returns `false` if it was not saved.
    ///
    /// # Errors
    ///
    /// Returns any backend failure; the wishlist is unchanged on error.
    #[instrument(skip(self), fields(product_id = %id))]
    pub async fn remove(&self, id: &ProductId) -> Result<bool> {
        let access = Access::item(&self.inner.locks, &self.inner.session, id).await;
        if !self.contains(id) {
            debug!("Not in wishlist, nothing to remove");
            return Ok(false);
        }

        let Some(token) = &access.token else {
            let mut items = self.items();
            items.shift_remove(id);
            self.commit_guest(access.epoch, items).await?;
            return Ok(true);
        };

        let call = self.inner.remote.remove_item(token, id);
        match bounded(self.inner.timeout, call).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(e) => return Err(remote_failure(&self.inner.session, access.epoch, e).await),
        }
        Ok(self.commit(access.epoch, |mirror| {
            let removed = mirror.items.shift_remove(id).is_some();
            if removed {
                mirror.bump();
            }
            removed
        }))
    }

    /// Add the product if absent, remove it otherwise. Returns whether it is
    /// saved afterwards.
    ///
    /// # Errors
    ///
    /// Returns any backend failure.
    pub async fn toggle(&self, item: WishlistItem) -> Result<bool> {
        if self.contains(&item.id) {
            self.remove(&item.id).await.map(|_| false)
        } else {
            self.add(item).await.map(|_| true)
        }
    }

    /// Empty the wishlist.
    ///
    /// # Errors
    ///
    /// Returns any backend failure; the wishlist is unchanged on error.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        let access = Access::store(&self.inner.locks, &self.inner.session).await;
        match &access.token {
            None => self.inner.storage.remove(keys::WISHLIST).await?,
            Some(token) => {
                let call = self.inner.remote.clear_wishlist(token);
                if let Err(e) = bounded(self.inner.timeout, call).await {
                    return Err(remote_failure(&self.inner.session, access.epoch, e).await);
                }
            }
        }
        self.commit(access.epoch, |mirror| {
            mirror.replace(mirror.mode, access.epoch, IndexMap::new())
        });
        Ok(())
    }

    /// Reload from the backend the session currently selects.
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

    /// Drop everything after the session left authenticated mode.
    ///
    /// Like the cart, an unmerged guest wishlist moves to the merge
    /// remainder once any running merge is done.
    ///
    /// # Errors
    ///
    /// Returns an error if the leftover guest wishlist cannot be moved.
    #[instrument(skip(self))]
    pub async fn switch_to_guest(&self) -> Result<()> {
        let (session, epoch) = self.inner.session.snapshot();
        if session.is_authenticated() {
            return Ok(());
        }
        write(&self.inner.mirror).replace(SessionMode::Guest, epoch, IndexMap::new());

        let _gate = self.lock_store().await;
        let storage = self.inner.storage.as_ref();
        let leftover: Vec<WishlistItem> =
            storage::load_list_lenient(storage, keys::WISHLIST).await?;
        if !leftover.is_empty() {
            let mut pending: Vec<WishlistItem> =
                storage::load_list_lenient(storage, keys::WISHLIST_MERGE_REMAINDER).await?;
            pending.extend(leftover);
            persist_items(storage, keys::WISHLIST_MERGE_REMAINDER, &index_items(pending))
                .await?;
            debug!("Unmerged guest wishlist kept for the next login");
        }
        storage.remove(keys::WISHLIST).await?;
        info!(epoch, "Wishlist switched to guest mode");
        Ok(())
    }

    pub(crate) async fn lock_store(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.locks.exclusive().await
    }

    /// Reload the mirror for `epoch` while the caller holds the store gate.
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
                let call = self.inner.remote.get_wishlist(token);
                let items = match bounded(self.inner.timeout, call).await {
                    Ok(items) => items,
                    Err(e) => return Err(remote_failure(&self.inner.session, epoch, e).await),
                };
                (SessionMode::Authenticated, index_items(items))
            }
            None => {
                let items =
                    storage::load_list_lenient(self.inner.storage.as_ref(), keys::WISHLIST)
                        .await?;
                (SessionMode::Guest, index_items(items))
            }
        };

        let mut mirror = write(&self.inner.mirror);
        if self.inner.session.epoch() != epoch {
            return Ok(false);
        }
        mirror.replace(mode, epoch, items);
        Ok(true)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    #[must_use]
    pub fn all(&self) -> Vec<WishlistItem> {
        self.settled(|mirror| mirror.items.values().cloned().collect())
    }

    /// O(1) membership test.
    #[must_use]
    pub fn contains(&self, id: &ProductId) -> bool {
        self.settled(|mirror| mirror.items.contains_key(id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.settled(|mirror| mirror.items.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn settled<R>(&self, f: impl FnOnce(&Mirror<WishlistItem>) -> R) -> R {
        {
            let mirror = read(&self.inner.mirror);
            if !mirror.is_stale(&self.inner.session) {
                return f(&mirror);
            }
        }
        let mut mirror = write(&self.inner.mirror);
        mirror.settle(&self.inner.session, "wishlist");
        f(&mirror)
    }

    fn items(&self) -> IndexMap<ProductId, WishlistItem> {
        self.settled(|mirror| mirror.items.clone())
    }

    async fn commit_guest(
        &self,
        epoch: u64,
        items: IndexMap<ProductId, WishlistItem>,
    ) -> Result<()> {
        persist_items(self.inner.storage.as_ref(), keys::WISHLIST, &items).await?;
        self.commit(epoch, |mirror| {
            mirror.replace(SessionMode::Guest, epoch, items)
        });
        Ok(())
    }

    fn commit(&self, epoch: u64, f: impl FnOnce(&mut Mirror<WishlistItem>) -> bool) -> bool {
        let mut mirror = write(&self.inner.mirror);
        mirror.settle(&self.inner.session, "wishlist");
        if self.inner.session.epoch() == epoch && mirror.epoch == epoch {
            f(&mut mirror)
        } else {
            debug!(epoch, "Discarding result for superseded session");
            false
        }
    }
}

/// Index items by id, keeping the first occurrence.
pub(crate) fn index_items(items: Vec<WishlistItem>) -> IndexMap<ProductId, WishlistItem> {
    let mut indexed = IndexMap::with_capacity(items.len());
    for item in items {
        indexed.entry(item.id.clone()).or_insert(item);
    }
    indexed
}
