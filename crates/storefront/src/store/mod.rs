//! Dual-backed item stores.
//!
//! # Architecture
//!
//! Each store keeps an in-memory mirror of the backend selected by the
//! session mode:
//!
//! - **Guest**: the durable local [`Storage`](crate::storage::Storage). Writes
//!   are persisted first, then committed to the mirror.
//! - **Authenticated**: the remote service. Every mutation round-trips before
//!   the mirror changes; a failed call leaves the mirror untouched.
//!
//! The mirror records the session epoch its contents belong to. Results from
//! calls started under an older epoch are discarded instead of committed.
//! Reads notice a session that has dropped to guest and empty the mirror on
//! the spot, so no stale authenticated cart is ever shown.

mod cart;
mod locks;
mod wishlist;

pub use cart::{CartSnapshot, CartStore};
pub use wishlist::WishlistStore;

pub(crate) use cart::index_items as index_cart_items;
pub(crate) use wishlist::index_items as index_wishlist_items;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cartwright_core::{ProductId, SessionMode};
use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Serialize;
use tracing::info;

use self::locks::{ItemGuard, MutationLocks};
use crate::error::StoreError;
use crate::remote::RemoteError;
use crate::session::SessionState;
use crate::storage::{self, Storage, StorageError};

/// Insertion-ordered items plus the session they belong to.
pub(crate) struct Mirror<T> {
    pub(crate) items: IndexMap<ProductId, T>,
    pub(crate) mode: SessionMode,
    pub(crate) epoch: u64,
    pub(crate) revision: u64,
}

impl<T: PartialEq> Mirror<T> {
    pub(crate) fn new(mode: SessionMode, epoch: u64) -> Self {
        Self {
            items: IndexMap::new(),
            mode,
            epoch,
            revision: 0,
        }
    }

    /// Replace the contents wholesale. Returns whether the revision moved.
    pub(crate) fn replace(
        &mut self,
        mode: SessionMode,
        epoch: u64,
        items: IndexMap<ProductId, T>,
    ) -> bool {
        self.mode = mode;
        self.epoch = epoch;
        if self.items == items {
            return false;
        }
        self.items = items;
        self.revision += 1;
        true
    }

    pub(crate) const fn bump(&mut self) {
        self.revision += 1;
    }

    /// Whether the session has dropped to guest since these contents were
    /// loaded. Guest sessions never change epoch without passing through
    /// authenticated mode, so any epoch gap means the contents are stale.
    pub(crate) fn is_stale(&self, session: &SessionState) -> bool {
        let (current, epoch) = session.snapshot();
        !current.is_authenticated()
            && (self.mode == SessionMode::Authenticated || self.epoch != epoch)
    }

    /// Drop stale contents. Returns whether the revision moved.
    pub(crate) fn settle(&mut self, session: &SessionState, store: &str) -> bool {
        if !self.is_stale(session) {
            return false;
        }
        let epoch = session.epoch();
        info!(store, epoch, "Session ended, clearing mirror");
        let changed = self.replace(SessionMode::Guest, epoch, IndexMap::new());
        if !changed {
            // Keep the revision moving so offers tied to the old cart expire
            self.bump();
        }
        true
    }
}

/// Backend selected for one mutation, with the locks that serialize it.
///
/// The mode is read after the locks are taken, so a guest write can never
/// interleave with a login merge that holds the store gate.
pub(crate) struct Access<'a> {
    pub(crate) epoch: u64,
    /// `Some` in authenticated mode.
    pub(crate) token: Option<SecretString>,
    _gate: Option<tokio::sync::RwLockWriteGuard<'a, ()>>,
    _item: Option<ItemGuard<'a>>,
}

impl<'a> Access<'a> {
    /// Lock a single item. Guest writes rewrite the whole stored list, so
    /// they take the store gate instead.
    pub(crate) async fn item(
        locks: &'a MutationLocks,
        session: &SessionState,
        id: &ProductId,
    ) -> Self {
        loop {
            if session.is_authenticated() {
                let item = locks.item(id).await;
                let (current, epoch) = session.snapshot();
                if let Some(token) = current.token() {
                    return Self {
                        epoch,
                        token: Some(token.clone()),
                        _gate: None,
                        _item: Some(item),
                    };
                }
            } else {
                let gate = locks.exclusive().await;
                let (current, epoch) = session.snapshot();
                if !current.is_authenticated() {
                    return Self {
                        epoch,
                        token: None,
                        _gate: Some(gate),
                        _item: None,
                    };
                }
            }
        }
    }

    /// Lock the whole store.
    pub(crate) async fn store(locks: &'a MutationLocks, session: &SessionState) -> Self {
        let gate = locks.exclusive().await;
        let (current, epoch) = session.snapshot();
        Self {
            epoch,
            token: current.token().cloned(),
            _gate: Some(gate),
            _item: None,
        }
    }
}

/// Write guest items under `key`, removing the key when empty.
pub(crate) async fn persist_items<T: Serialize + Sync>(
    storage: &dyn Storage,
    key: &str,
    items: &IndexMap<ProductId, T>,
) -> Result<(), StorageError> {
    if items.is_empty() {
        return storage.remove(key).await;
    }
    let list: Vec<&T> = items.values().collect();
    storage::save_json(storage, key, &list).await
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Map a failed remote mutation, expiring the session on `Unauthorized`.
pub(crate) async fn remote_failure(
    session: &SessionState,
    epoch: u64,
    err: RemoteError,
) -> StoreError {
    if matches!(err, RemoteError::Unauthorized) {
        if let Err(e) = session.expire_at(epoch).await {
            tracing::warn!(error = %e, "Failed to drop persisted session");
        }
    }
    StoreError::from(err)
}
