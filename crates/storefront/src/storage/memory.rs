//! In-memory storage, shared between handles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Storage, StorageError, StorageEvent, change_channel};

/// Volatile storage backed by a shared map.
///
/// Cloned handles see the same data and the same change channel, which makes
/// two engines built over clones of one `MemoryStorage` behave like two tabs
/// of the same browser profile.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<MemoryStorageInner>,
}

struct MemoryStorageInner {
    values: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<StorageEvent>,
}

impl MemoryStorage {
    /// Create an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryStorageInner {
                values: Mutex::new(HashMap::new()),
                changes: change_channel(),
            }),
        }
    }

    fn publish(&self, key: &str, new_value: Option<String>) {
        // No subscribers is fine
        let _ = self.inner.changes.send(StorageEvent {
            key: key.to_string(),
            new_value,
        });
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self
            .inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        self.publish(key, Some(value.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let removed = self
            .inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if removed.is_some() {
            self.publish(key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.changes.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_state_and_events() {
        let a = MemoryStorage::new();
        let b = a.clone();
        let mut events = b.subscribe();

        a.set("session", "token").await.unwrap();
        assert_eq!(b.get("session").await.unwrap().as_deref(), Some("token"));

        let event = events.recv().await.unwrap();
        assert_eq!(event.key, "session");
        assert_eq!(event.new_value.as_deref(), Some("token"));
    }

    #[tokio::test]
    async fn test_remove_absent_is_silent() {
        let storage = MemoryStorage::new();
        let mut events = storage.subscribe();
        storage.remove("nothing").await.unwrap();
        assert!(events.try_recv().is_err());
    }
}
