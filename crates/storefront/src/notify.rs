//! User-visible notification bus.
//!
//! Failures and rejections are published here exactly once per operation and
//! consumed by whatever UI is attached.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 128;

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// A message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub level: NotificationLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Cloneable handle to the notification channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Receive every notification published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Publish a notification. Dropped silently when nobody is listening.
    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) -> Notification {
        let notification = Notification {
            id: Uuid::new_v4(),
            level,
            message: message.into(),
            created_at: Utc::now(),
        };
        let _ = self.sender.send(notification.clone());
        notification
    }

    pub fn info(&self, message: impl Into<String>) -> Notification {
        self.notify(NotificationLevel::Info, message)
    }

    pub fn warning(&self, message: impl Into<String>) -> Notification {
        self.notify(NotificationLevel::Warning, message)
    }

    pub fn error(&self, message: impl Into<String>) -> Notification {
        self.notify(NotificationLevel::Error, message)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_notifications() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();

        notifier.warning("Offer rejected");
        let received = rx.recv().await.unwrap();
        assert_eq!(received.level, NotificationLevel::Warning);
        assert_eq!(received.message, "Offer rejected");
    }

    #[test]
    fn test_notify_without_subscribers() {
        let notifier = Notifier::new();
        let sent = notifier.error("nobody listening");
        assert_eq!(sent.level, NotificationLevel::Error);
    }
}
