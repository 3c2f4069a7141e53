//! Durable client-local key/value storage.
//!
//! This is the guest-mode backend: it survives restarts, is scoped to one
//! client, and is never shared across devices. Every write is announced on a
//! storage-change channel so that other client instances sharing the same
//! storage (other tabs) can converge on the session mode.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of the storage-change channel.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Errors from the local storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing the backing medium failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be decoded.
    #[error("corrupt value under '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be encoded.
    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),

    /// The key is not usable as a storage key.
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),
}

/// A change to one storage key, as seen by other instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

/// Storage keys used by the engine.
pub mod keys {
    /// Guest cart items.
    pub const CART: &str = "cart";

    /// Guest cart items whose merge into the remote cart failed, retried on
    /// the next login. Never displayed as part of the guest cart.
    pub const CART_MERGE_REMAINDER: &str = "cart.merge_remainder";

    /// Guest wishlist items.
    pub const WISHLIST: &str = "wishlist";

    /// Guest wishlist items whose merge failed.
    pub const WISHLIST_MERGE_REMAINDER: &str = "wishlist.merge_remainder";

    /// Persisted session token and user id.
    pub const SESSION: &str = "session";
}

/// String key/value storage with change notifications.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the raw value under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write `value` under `key`.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Subscribe to changes made through any handle of this storage.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// Read and decode a JSON value.
///
/// # Errors
///
/// Returns [`StorageError::Corrupt`] if the stored value does not decode.
pub async fn load_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    let Some(raw) = storage.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StorageError::Corrupt {
            key: key.to_string(),
            source,
        })
}

/// Encode and write a JSON value.
///
/// # Errors
///
/// Returns an error if encoding or the write fails.
pub async fn save_json<T: Serialize + Sync>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    storage.set(key, &raw).await
}

/// Read a JSON list, treating a corrupt value as empty.
///
/// Guest data is best-effort: a value that no longer decodes (e.g. written by
/// an older client) is logged and dropped instead of locking the user out of
/// their cart.
///
/// # Errors
///
/// Returns an error only if the storage medium itself fails.
pub async fn load_list_lenient<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Vec<T>, StorageError> {
    match load_json::<Vec<T>>(storage, key).await {
        Ok(items) => Ok(items.unwrap_or_default()),
        Err(StorageError::Corrupt { key, source }) => {
            tracing::warn!(key = %key, error = %source, "Discarding corrupt local value");
            storage.remove(&key).await?;
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

fn change_channel() -> broadcast::Sender<StorageEvent> {
    broadcast::channel(CHANGE_CHANNEL_CAPACITY).0
}
