//! Per-item mutation serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use cartwright_core::ProductId;
use tokio::sync::{OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Keyed async locks with a store-wide gate.
///
/// Mutations of one id are serialized; different ids run concurrently.
/// Whole-store operations (clear, refresh, guest writes) take the gate
/// exclusively and wait for every in-flight item mutation.
#[derive(Default)]
pub(crate) struct MutationLocks {
    gate: RwLock<()>,
    keyed: Mutex<HashMap<ProductId, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held for the duration of a single-item mutation.
pub(crate) struct ItemGuard<'a> {
    _item: OwnedMutexGuard<()>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl MutationLocks {
    pub(crate) async fn item(&self, id: &ProductId) -> ItemGuard<'_> {
        let gate = self.gate.read().await;
        let lock = {
            let mut keyed = self.keyed.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop locks nobody holds or waits on
            keyed.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(keyed.entry(id.clone()).or_default())
        };
        ItemGuard {
            _item: lock.lock_owned().await,
            _gate: gate,
        }
    }

    pub(crate) async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_same_id_is_serialized() {
        let locks = Arc::new(MutationLocks::default());
        let id = ProductId::from(1);

        let first = locks.item(&id).await;
        let waiter = {
            let locks = Arc::clone(&locks);
            let id = id.clone();
            tokio::spawn(async move {
                let _guard = locks.item(&id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(first);
        assert!(waiter.await.is_ok());
    }

    #[tokio::test]
    async fn test_different_ids_do_not_block() {
        let locks = MutationLocks::default();
        let _a = locks.item(&ProductId::from(1)).await;
        let _b = locks.item(&ProductId::from(2)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_waits_for_items() {
        let locks = Arc::new(MutationLocks::default());
        let item = locks.item(&ProductId::from(1)).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _gate = locks.exclusive().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(item);
        assert!(waiter.await.is_ok());
    }
}
