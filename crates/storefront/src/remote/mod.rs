//! Remote cart, wishlist and offer services.
//!
//! # Architecture
//!
//! - The engine depends only on the traits in this module
//! - The remote store is the source of truth once authenticated: there is no
//!   local sync of remote state, only an in-memory mirror
//! - [`HttpBackend`] implements every trait over `reqwest`, caching the offer
//!   catalog in memory via `moka`
//!
//! # Example
//!
//! ```rust,ignore
//! use cartwright_storefront::remote::{HttpBackend, RemoteCartService};
//!
//! let backend = HttpBackend::new(&config.remote)?;
//! let items = backend.get_cart(&token).await?;
//! backend.add_item(&token, &product_id, 2).await?;
//! ```

mod cache;
mod http;

pub use http::HttpBackend;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use cartwright_core::{
    CartItem, Offer, ProductId, ValidationOutcome, ValidationRequest, WishlistItem,
};
use secrecy::SecretString;
use thiserror::Error;

/// Errors that can occur when talking to a remote service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The call did not complete within the allowed time.
    #[error("request timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    /// Rate limited by the service.
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// The session token is missing, expired or revoked.
    #[error("Unauthorized")]
    Unauthorized,

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The service refused the request as a business outcome.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Non-success status not covered above.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The service could not be reached.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// A request URL could not be built from the configured base URL.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl RemoteError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) | Self::RateLimited(_) | Self::Unavailable(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Parse(_)
            | Self::Unauthorized
            | Self::NotFound(_)
            | Self::Rejected(_)
            | Self::InvalidEndpoint(_) => false,
        }
    }
}

/// Remote, authoritative cart of an authenticated user.
#[async_trait]
pub trait RemoteCartService: Send + Sync {
    /// Full cart, in the order the service keeps it.
    async fn get_cart(&self, token: &SecretString) -> Result<Vec<CartItem>, RemoteError>;

    /// Add `quantity` units, summing with any existing line atomically.
    async fn add_item(
        &self,
        token: &SecretString,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<(), RemoteError>;

    /// Overwrite the quantity of an existing line.
    async fn update_item(
        &self,
        token: &SecretString,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<(), RemoteError>;

    /// Delete a line.
    async fn remove_item(
        &self,
        token: &SecretString,
        product_id: &ProductId,
    ) -> Result<(), RemoteError>;

    /// Delete every line.
    async fn clear_cart(&self, token: &SecretString) -> Result<(), RemoteError>;
}

/// Remote wishlist of an authenticated user.
#[async_trait]
pub trait RemoteWishlistService: Send + Sync {
    async fn get_wishlist(&self, token: &SecretString) -> Result<Vec<WishlistItem>, RemoteError>;

    /// Idempotent insert.
    async fn add_item(&self, token: &SecretString, product_id: &ProductId)
    -> Result<(), RemoteError>;

    async fn remove_item(
        &self,
        token: &SecretString,
        product_id: &ProductId,
    ) -> Result<(), RemoteError>;

    async fn clear_wishlist(&self, token: &SecretString) -> Result<(), RemoteError>;
}

/// Offer catalog and discount validation authority.
#[async_trait]
pub trait RemoteOfferService: Send + Sync {
    /// Every candidate offer.
    async fn list_offers(&self) -> Result<Vec<Offer>, RemoteError>;

    /// Price an offer against a cart snapshot.
    async fn validate_offer(
        &self,
        request: &ValidationRequest,
    ) -> Result<ValidationOutcome, RemoteError>;
}

/// Run a remote call with an upper bound on its duration.
///
/// # Errors
///
/// Returns [`RemoteError::Timeout`] if `call` does not settle within `limit`,
/// otherwise whatever `call` returns.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(RemoteError::Timeout(limit)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::NotFound("sku-123".to_string());
        assert_eq!(err.to_string(), "Not found: sku-123");

        let err = RemoteError::RateLimited(60);
        assert_eq!(err.to_string(), "Rate limited, retry after 60 seconds");

        let err = RemoteError::Timeout(Duration::from_secs(2));
        assert_eq!(err.to_string(), "request timed out after 2s");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RemoteError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(RemoteError::RateLimited(1).is_retryable());
        assert!(
            RemoteError::Status {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !RemoteError::Status {
                status: 400,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(!RemoteError::Unauthorized.is_retryable());
        assert!(!RemoteError::Rejected("expired".to_string()).is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: Result<(), RemoteError> = bounded(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RemoteError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_bounded_passes_through() {
        let result = bounded(Duration::from_secs(1), async { Ok::<_, RemoteError>(7) }).await;
        assert!(matches!(result, Ok(7)));
    }
}
