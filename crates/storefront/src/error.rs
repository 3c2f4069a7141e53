//! Engine error taxonomy with Sentry integration.
//!
//! Every fallible engine operation returns [`StoreError`]. Adapter-level
//! errors ([`RemoteError`], [`StorageError`], [`ItemError`]) are folded into
//! it at the store boundary, so UI code only ever matches on one enum.

use cartwright_core::ItemError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::remote::RemoteError;
use crate::storage::StorageError;

/// Engine-level error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A remote call failed to complete.
    #[error("Network failure: {message}")]
    NetworkFailure { message: String, retryable: bool },

    /// The session is missing or no longer valid.
    #[error("Authentication required")]
    AuthRequired,

    /// The remote service refused the request as a business outcome.
    #[error("Rejected: {0}")]
    ValidationRejected(String),

    /// The target does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Input could not be coerced into a valid value.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The engine is misconfigured.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure { retryable: true, .. })
    }

    /// Whether this error should be captured to Sentry.
    #[must_use]
    pub const fn is_server_class(&self) -> bool {
        matches!(self, Self::NetworkFailure { .. } | Self::Storage(_))
    }

    /// Message suitable for showing to the user.
    ///
    /// Internal details are not exposed.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::NetworkFailure {
                retryable: true, ..
            } => "We couldn't reach the store. Please try again.".to_string(),
            Self::NetworkFailure { .. } => "The store could not complete the request.".to_string(),
            Self::AuthRequired => "Your session has expired. Please sign in again.".to_string(),
            Self::ValidationRejected(reason) => reason.clone(),
            Self::NotFound(_) => "That item is no longer available.".to_string(),
            Self::Storage(_) => "Your cart could not be saved on this device.".to_string(),
            Self::InvalidInput(msg) => msg.clone(),
            Self::Config(_) => "The store is not configured correctly.".to_string(),
        }
    }
}

impl From<RemoteError> for StoreError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unauthorized => Self::AuthRequired,
            RemoteError::NotFound(what) => Self::NotFound(what),
            RemoteError::Rejected(reason) => Self::ValidationRejected(reason),
            other => Self::NetworkFailure {
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }
}

impl From<ItemError> for StoreError {
    fn from(err: ItemError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

/// Result type alias for `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Capture server-class errors to Sentry and log them.
///
/// Business outcomes (rejections, auth expiry, bad input) are logged at
/// `warn` and not captured.
pub fn report(err: &StoreError, operation: &str) {
    if err.is_server_class() {
        let event_id = sentry::capture_error(err);
        tracing::error!(
            error = %err,
            operation,
            sentry_event_id = %event_id,
            "Operation failed"
        );
    } else {
        tracing::warn!(error = %err, operation, "Operation refused");
    }
}

/// Set the Sentry user context from a user ID.
///
/// Call this after login to associate errors with users.
pub fn set_sentry_user(user_id: &impl ToString) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            ..Default::default()
        }));
    });
}

/// Clear the Sentry user context.
///
/// Call this on logout or expiry to stop associating errors with the user.
pub fn clear_sentry_user() {
    sentry::configure_scope(|scope| {
        scope.set_user(None);
    });
}

/// Add a breadcrumb for user actions.
///
/// Breadcrumbs appear in Sentry error reports to show the trail of user actions
/// leading up to an error.
///
/// # Example
///
/// ```rust,ignore
/// add_breadcrumb("cart", "Added item", Some(&[("product_id", "123")]));
/// ```
pub fn add_breadcrumb(category: &str, message: &str, data: Option<&[(&str, &str)]>) {
    let mut breadcrumb = sentry::Breadcrumb {
        category: Some(category.to_string()),
        message: Some(message.to_string()),
        level: sentry::Level::Info,
        ..Default::default()
    };

    if let Some(pairs) = data {
        for (key, value) in pairs {
            breadcrumb.data.insert(
                (*key).to_string(),
                serde_json::Value::String((*value).to_string()),
            );
        }
    }

    sentry::add_breadcrumb(breadcrumb);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound("sku-9".to_string());
        assert_eq!(err.to_string(), "Not found: sku-9");

        let err = StoreError::ValidationRejected("offer expired".to_string());
        assert_eq!(err.to_string(), "Rejected: offer expired");
    }

    #[test]
    fn test_remote_error_mapping() {
        assert!(matches!(
            StoreError::from(RemoteError::Unauthorized),
            StoreError::AuthRequired
        ));
        assert!(matches!(
            StoreError::from(RemoteError::NotFound("/cart/items/1".to_string())),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            StoreError::from(RemoteError::Rejected("nope".to_string())),
            StoreError::ValidationRejected(ref r) if r == "nope"
        ));

        let err = StoreError::from(RemoteError::Timeout(Duration::from_secs(2)));
        assert!(err.is_retryable());
        assert!(err.is_server_class());

        let err = StoreError::from(RemoteError::Status {
            status: 400,
            body: String::new(),
        });
        assert!(matches!(
            err,
            StoreError::NetworkFailure {
                retryable: false,
                ..
            }
        ));
    }

    #[test]
    fn test_item_error_is_invalid_input() {
        let err = StoreError::from(ItemError::NonPositiveQuantity(0));
        assert!(matches!(err, StoreError::InvalidInput(_)));
        assert!(!err.is_server_class());
    }

    #[test]
    fn test_user_message_hides_details() {
        let err = StoreError::NetworkFailure {
            message: "HTTP 502: upstream connect error".to_string(),
            retryable: true,
        };
        assert!(!err.user_message().contains("502"));

        let err = StoreError::ValidationRejected("Offer has ended".to_string());
        assert_eq!(err.user_message(), "Offer has ended");
    }
}
