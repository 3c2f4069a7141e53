//! Session mode tracking.
//!
//! [`SessionState`] is the only writer of guest/authenticated mode. Every
//! transition bumps a monotonic epoch; async work captures the epoch when it
//! starts and discards its result if the epoch moved underneath it.
//!
//! ```text
//! Guest --login--> Authenticated --refresh--> Authenticated
//!   ^                   |
//!   +--logout/expire----+
//! ```

use std::sync::{Arc, PoisonError, RwLock};

use cartwright_core::{SessionMode, UserId};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::storage::{self, Storage, StorageError, StorageEvent, keys};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Token and user id of the current session.
///
/// Implements `Debug` manually to redact the token.
#[derive(Clone, Default)]
pub struct Session {
    token: Option<SecretString>,
    user_id: Option<UserId>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl Session {
    /// A session with no token.
    #[must_use]
    pub fn guest() -> Self {
        Self::default()
    }

    /// A session holding `token`.
    #[must_use]
    pub const fn authenticated(token: SecretString, user_id: Option<UserId>) -> Self {
        Self {
            token: Some(token),
            user_id,
        }
    }

    #[must_use]
    pub const fn token(&self) -> Option<&SecretString> {
        self.token.as_ref()
    }

    #[must_use]
    pub const fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    #[must_use]
    pub const fn mode(&self) -> SessionMode {
        if self.is_authenticated() {
            SessionMode::Authenticated
        } else {
            SessionMode::Guest
        }
    }

    fn same_token(&self, other: &Self) -> bool {
        match (&self.token, &other.token) {
            (Some(a), Some(b)) => a.expose_secret() == b.expose_secret(),
            (None, None) => true,
            _ => false,
        }
    }
}

/// A session transition, tagged with the epoch it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Guest to authenticated.
    LoggedIn { epoch: u64 },
    /// Authenticated with a new token.
    Refreshed { epoch: u64 },
    /// Authenticated to guest at the user's request.
    LoggedOut { epoch: u64 },
    /// Authenticated to guest because a remote call was refused.
    Expired { epoch: u64 },
}

impl SessionEvent {
    #[must_use]
    pub const fn epoch(self) -> u64 {
        match self {
            Self::LoggedIn { epoch }
            | Self::Refreshed { epoch }
            | Self::LoggedOut { epoch }
            | Self::Expired { epoch } => epoch,
        }
    }

    /// Mode in effect after this event.
    #[must_use]
    pub const fn mode(self) -> SessionMode {
        match self {
            Self::LoggedIn { .. } | Self::Refreshed { .. } => SessionMode::Authenticated,
            Self::LoggedOut { .. } | Self::Expired { .. } => SessionMode::Guest,
        }
    }
}

/// Persisted form of an authenticated session.
#[derive(Serialize, Deserialize)]
struct PersistedSession {
    token: String,
    #[serde(default)]
    user_id: Option<UserId>,
}

impl PersistedSession {
    fn into_session(self) -> Session {
        Session::authenticated(SecretString::from(self.token), self.user_id)
    }
}

#[derive(Clone, Copy)]
enum Exit {
    Logout,
    Expiry,
}

/// Process-wide session mode. Cheaply cloneable.
#[derive(Clone)]
pub struct SessionState {
    inner: Arc<SessionStateInner>,
}

struct SessionStateInner {
    current: RwLock<Snapshot>,
    events: broadcast::Sender<SessionEvent>,
    storage: Arc<dyn Storage>,
}

struct Snapshot {
    session: Session,
    epoch: u64,
}

impl SessionState {
    /// Create a guest session over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_session(storage, Session::guest())
    }

    fn with_session(storage: Arc<dyn Storage>, session: Session) -> Self {
        Self {
            inner: Arc::new(SessionStateInner {
                current: RwLock::new(Snapshot { session, epoch: 0 }),
                events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                storage,
            }),
        }
    }

    /// Restore the persisted session, if any.
    ///
    /// A persisted value that no longer decodes is discarded and the session
    /// starts as guest.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage medium fails.
    pub async fn restore(storage: Arc<dyn Storage>) -> Result<Self, StorageError> {
        let persisted =
            match storage::load_json::<PersistedSession>(storage.as_ref(), keys::SESSION).await {
                Ok(persisted) => persisted,
                Err(StorageError::Corrupt { key, source }) => {
                    warn!(key = %key, error = %source, "Discarding corrupt persisted session");
                    storage.remove(&key).await?;
                    None
                }
                Err(e) => return Err(e),
            };

        let session = persisted.map_or_else(Session::guest, PersistedSession::into_session);
        if session.is_authenticated() {
            info!("Restored authenticated session");
        }
        Ok(Self::with_session(storage, session))
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.read().session.is_authenticated()
    }

    /// The current session.
    #[must_use]
    pub fn current(&self) -> Session {
        self.read().session.clone()
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.read().epoch
    }

    #[must_use]
    pub fn mode(&self) -> SessionMode {
        self.read().session.mode()
    }

    /// Session and epoch read under one lock.
    #[must_use]
    pub fn snapshot(&self) -> (Session, u64) {
        let snapshot = self.read();
        (snapshot.session.clone(), snapshot.epoch)
    }

    /// Receive every transition from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Record a login (or token refresh) and persist it.
    ///
    /// Returns the transition, or `None` if the token did not change. The
    /// in-memory mode flips even if persisting fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be persisted.
    #[instrument(skip(self, token))]
    pub async fn login(
        &self,
        token: SecretString,
        user_id: Option<UserId>,
    ) -> Result<Option<SessionEvent>, StorageError> {
        let persisted = PersistedSession {
            token: token.expose_secret().to_string(),
            user_id: user_id.clone(),
        };
        let event = self.transition(Session::authenticated(token, user_id), Exit::Logout, None);
        storage::save_json(self.inner.storage.as_ref(), keys::SESSION, &persisted).await?;
        Ok(event)
    }

    /// Record a logout and drop the persisted session.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted session cannot be removed.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<Option<SessionEvent>, StorageError> {
        let event = self.transition(Session::guest(), Exit::Logout, None);
        self.inner.storage.remove(keys::SESSION).await?;
        Ok(event)
    }

    /// Flip to guest because the session is no longer accepted remotely.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted session cannot be removed.
    pub async fn expire(&self) -> Result<Option<SessionEvent>, StorageError> {
        self.expire_inner(None).await
    }

    /// Like [`expire`](Self::expire), but only if the session is still the
    /// one that was current at `epoch`.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted session cannot be removed.
    pub async fn expire_at(&self, epoch: u64) -> Result<Option<SessionEvent>, StorageError> {
        self.expire_inner(Some(epoch)).await
    }

    #[instrument(skip(self))]
    async fn expire_inner(
        &self,
        expected_epoch: Option<u64>,
    ) -> Result<Option<SessionEvent>, StorageError> {
        let event = self.transition(Session::guest(), Exit::Expiry, expected_epoch);
        if event.is_some() {
            self.inner.storage.remove(keys::SESSION).await?;
        }
        Ok(event)
    }

    /// Converge on a session change made by another instance sharing the
    /// same storage.
    ///
    /// Nothing is persisted: the change is already in storage.
    pub fn observe_storage_change(&self, event: &StorageEvent) -> Option<SessionEvent> {
        if event.key != keys::SESSION {
            return None;
        }
        let next = match &event.new_value {
            None => Session::guest(),
            Some(raw) => match serde_json::from_str::<PersistedSession>(raw) {
                Ok(persisted) => persisted.into_session(),
                Err(e) => {
                    warn!(error = %e, "Ignoring undecodable session change");
                    return None;
                }
            },
        };
        self.transition(next, Exit::Logout, None)
    }

    /// Apply a transition under the lock, then publish it.
    ///
    /// Observers can never see the old mode once the event is out.
    fn transition(
        &self,
        next: Session,
        exit: Exit,
        expected_epoch: Option<u64>,
    ) -> Option<SessionEvent> {
        let event = {
            let mut current = self
                .inner
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);

            if expected_epoch.is_some_and(|e| e != current.epoch) {
                debug!(epoch = current.epoch, "Ignoring transition for superseded session");
                return None;
            }

            let epoch = current.epoch + 1;
            let event = match (current.session.is_authenticated(), next.is_authenticated()) {
                (false, false) => None,
                (false, true) => Some(SessionEvent::LoggedIn { epoch }),
                (true, true) if current.session.same_token(&next) => None,
                (true, true) => Some(SessionEvent::Refreshed { epoch }),
                (true, false) => Some(match exit {
                    Exit::Logout => SessionEvent::LoggedOut { epoch },
                    Exit::Expiry => SessionEvent::Expired { epoch },
                }),
            };

            if event.is_some() {
                current.session = next;
                current.epoch = epoch;
            } else if next.user_id.is_some() {
                // Same token, possibly a user id we did not know yet
                current.session.user_id = next.user_id;
            }
            event
        };

        if let Some(event) = event {
            info!(?event, "Session transition");
            let _ = self.inner.events.send(event);
        }
        event
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn state() -> (SessionState, MemoryStorage) {
        let storage = MemoryStorage::new();
        (SessionState::new(Arc::new(storage.clone())), storage)
    }

    fn token(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[tokio::test]
    async fn test_login_logout_cycle() {
        let (session, _) = state();
        assert!(!session.is_authenticated());
        assert_eq!(session.epoch(), 0);

        let event = session.login(token("t1"), None).await.unwrap();
        assert_eq!(event, Some(SessionEvent::LoggedIn { epoch: 1 }));
        assert!(session.is_authenticated());

        let event = session.logout().await.unwrap();
        assert_eq!(event, Some(SessionEvent::LoggedOut { epoch: 2 }));
        assert!(!session.is_authenticated());
        assert_eq!(session.mode(), SessionMode::Guest);
    }

    #[tokio::test]
    async fn test_refresh_and_same_token() {
        let (session, _) = state();
        session.login(token("t1"), None).await.unwrap();

        let same = session.login(token("t1"), None).await.unwrap();
        assert_eq!(same, None);
        assert_eq!(session.epoch(), 1);

        let refreshed = session.login(token("t2"), None).await.unwrap();
        assert_eq!(refreshed, Some(SessionEvent::Refreshed { epoch: 2 }));
    }

    #[tokio::test]
    async fn test_mode_flips_before_event_is_observed() {
        let (session, _) = state();
        session.login(token("t1"), None).await.unwrap();
        let mut rx = session.subscribe();

        session.expire().await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event, SessionEvent::Expired { epoch: 2 });
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_expire_at_ignores_superseded_epoch() {
        let (session, _) = state();
        session.login(token("t1"), None).await.unwrap();
        session.login(token("t2"), None).await.unwrap();

        assert_eq!(session.expire_at(1).await.unwrap(), None);
        assert!(session.is_authenticated());

        assert!(session.expire_at(2).await.unwrap().is_some());
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_restore_persisted_session() {
        let (session, storage) = state();
        session
            .login(token("t1"), Some(UserId::parse("u-1").unwrap()))
            .await
            .unwrap();

        let restored = SessionState::restore(Arc::new(storage)).await.unwrap();
        assert!(restored.is_authenticated());
        assert_eq!(
            restored.current().user_id().map(UserId::as_str),
            Some("u-1")
        );
    }

    #[tokio::test]
    async fn test_restore_discards_corrupt_value() {
        let storage = MemoryStorage::new();
        storage.set(keys::SESSION, "garbage").await.unwrap();

        let restored = SessionState::restore(Arc::new(storage.clone())).await.unwrap();
        assert!(!restored.is_authenticated());
        assert!(storage.get(keys::SESSION).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_instances_converge_through_storage_changes() {
        let storage = MemoryStorage::new();
        let tab_a = SessionState::new(Arc::new(storage.clone()));
        let tab_b = SessionState::new(Arc::new(storage.clone()));
        let mut changes = storage.subscribe();

        tab_a.login(token("t1"), None).await.unwrap();
        let change = changes.recv().await.unwrap();
        assert_eq!(
            tab_b.observe_storage_change(&change),
            Some(SessionEvent::LoggedIn { epoch: 1 })
        );
        assert!(tab_b.is_authenticated());

        tab_a.logout().await.unwrap();
        let change = changes.recv().await.unwrap();
        assert_eq!(
            tab_b.observe_storage_change(&change),
            Some(SessionEvent::LoggedOut { epoch: 2 })
        );
        assert!(!tab_b.is_authenticated());
    }

    #[test]
    fn test_unrelated_storage_keys_are_ignored() {
        let (session, _) = state();
        let event = StorageEvent {
            key: keys::CART.to_string(),
            new_value: None,
        };
        assert_eq!(session.observe_storage_change(&event), None);
    }

    #[test]
    fn test_debug_redacts_token() {
        let session = Session::authenticated(token("super-secret-token"), None);
        let debug = format!("{session:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("super-secret-token"));
    }
}
