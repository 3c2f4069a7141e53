//! HTTP implementation of the remote services.
//!
//! JSON over HTTPS with a bearer session token. Paths are relative to the
//! configured API base URL:
//!
//! | Call              | Request                              |
//! |-------------------|--------------------------------------|
//! | `get_cart`        | `GET /cart`                          |
//! | `add_item`        | `POST /cart/items`                   |
//! | `update_item`     | `PATCH /cart/items/{id}`             |
//! | `remove_item`     | `DELETE /cart/items/{id}`            |
//! | `clear_cart`      | `DELETE /cart`                       |
//! | wishlist calls    | same shapes under `/wishlist`        |
//! | `list_offers`     | `GET /offers` (cached)               |
//! | `validate_offer`  | `POST /offers/validate`              |

use std::sync::Arc;

use async_trait::async_trait;
use cartwright_core::{
    CartItem, Offer, ProductId, ValidationOutcome, ValidationRequest, WishlistItem,
};
use moka::future::Cache;
use reqwest::{Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use super::cache::{CacheKey, CacheValue};
use super::{RemoteCartService, RemoteError, RemoteOfferService, RemoteWishlistService};
use crate::config::RemoteConfig;

/// Maximum number of body characters kept in logs and errors.
const BODY_SNIPPET_LEN: usize = 200;

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Deserialize)]
struct CartResponse {
    items: Vec<CartItem>,
}

#[derive(Deserialize)]
struct WishlistResponse {
    items: Vec<WishlistItem>,
}

#[derive(Deserialize)]
struct OffersResponse {
    offers: Vec<Offer>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddItemRequest<'a> {
    product_id: &'a ProductId,
    #[serde(skip_serializing_if = "Option::is_none")]
    quantity: Option<u32>,
}

#[derive(Serialize)]
struct UpdateItemRequest {
    quantity: u32,
}

// =============================================================================
// HttpBackend
// =============================================================================

/// Client for the remote cart, wishlist and offer services.
///
/// Cheaply cloneable. The offer catalog is cached for the configured TTL;
/// cart and wishlist calls are never cached (mutable state).
#[derive(Clone)]
pub struct HttpBackend {
    inner: Arc<HttpBackendInner>,
}

struct HttpBackendInner {
    client: reqwest::Client,
    base_url: Url,
    cache: Cache<CacheKey, CacheValue>,
}

impl HttpBackend {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let cache = Cache::builder()
            .max_capacity(16)
            .time_to_live(config.offer_cache_ttl)
            .build();

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("cartwright/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            inner: Arc::new(HttpBackendInner {
                client,
                base_url: config.base_url.clone(),
                cache,
            }),
        })
    }

    /// Build an endpoint URL from path segments, escaping each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.inner.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                RemoteError::InvalidEndpoint(self.inner.base_url.to_string())
            })?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    fn request(
        &self,
        method: Method,
        segments: &[&str],
        token: Option<&SecretString>,
    ) -> Result<RequestBuilder, RemoteError> {
        let url = self.endpoint(segments)?;
        let builder = self
            .inner
            .client
            .request(method, url)
            .header("Accept", "application/json");
        Ok(match token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        })
    }

    /// Send a request and map the status code onto [`RemoteError`].
    ///
    /// Returns the response body on success.
    async fn send(&self, request: RequestBuilder) -> Result<String, RemoteError> {
        let response = request.send().await?;
        let status = response.status();

        // Check for rate limiting
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(RemoteError::RateLimited(retry_after));
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RemoteError::Unauthorized);
        }

        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(response.url().path().to_string()));
        }

        // Get response body as text first for better error diagnostics
        let body = response.text().await?;
        let snippet = body.chars().take(BODY_SNIPPET_LEN).collect::<String>();

        if status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(RemoteError::Rejected(snippet));
        }

        if !status.is_success() {
            tracing::error!(
                status = %status,
                body = %snippet,
                "Remote service returned non-success status"
            );
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: snippet,
            });
        }

        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, RemoteError> {
        let body = self.send(request).await?;
        serde_json::from_str(&body).map_err(|e| {
            tracing::error!(
                error = %e,
                body = %body.chars().take(BODY_SNIPPET_LEN).collect::<String>(),
                "Failed to parse remote response"
            );
            RemoteError::Parse(e)
        })
    }

    /// Invalidate the cached offer catalog.
    pub async fn invalidate_offers(&self) {
        self.inner.cache.invalidate(&CacheKey::OfferCatalog).await;
    }
}

// =============================================================================
// Cart
// =============================================================================

#[async_trait]
impl RemoteCartService for HttpBackend {
    #[instrument(skip(self, token))]
    async fn get_cart(&self, token: &SecretString) -> Result<Vec<CartItem>, RemoteError> {
        let request = self.request(Method::GET, &["cart"], Some(token))?;
        let response: CartResponse = self.send_json(request).await?;
        Ok(response.items)
    }

    #[instrument(skip(self, token), fields(product_id = %product_id))]
    async fn add_item(
        &self,
        token: &SecretString,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<(), RemoteError> {
        let request = self
            .request(Method::POST, &["cart", "items"], Some(token))?
            .json(&AddItemRequest {
                product_id,
                quantity: Some(quantity),
            });
        self.send(request).await.map(drop)
    }

    #[instrument(skip(self, token), fields(product_id = %product_id))]
    async fn update_item(
        &self,
        token: &SecretString,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<(), RemoteError> {
        let request = self
            .request(
                Method::PATCH,
                &["cart", "items", product_id.as_str()],
                Some(token),
            )?
            .json(&UpdateItemRequest { quantity });
        self.send(request).await.map(drop)
    }

    #[instrument(skip(self, token), fields(product_id = %product_id))]
    async fn remove_item(
        &self,
        token: &SecretString,
        product_id: &ProductId,
    ) -> Result<(), RemoteError> {
        let request = self.request(
            Method::DELETE,
            &["cart", "items", product_id.as_str()],
            Some(token),
        )?;
        self.send(request).await.map(drop)
    }

    #[instrument(skip(self, token))]
    async fn clear_cart(&self, token: &SecretString) -> Result<(), RemoteError> {
        let request = self.request(Method::DELETE, &["cart"], Some(token))?;
        self.send(request).await.map(drop)
    }
}

// =============================================================================
// Wishlist
// =============================================================================

#[async_trait]
impl RemoteWishlistService for HttpBackend {
    #[instrument(skip(self, token))]
    async fn get_wishlist(&self, token: &SecretString) -> Result<Vec<WishlistItem>, RemoteError> {
        let request = self.request(Method::GET, &["wishlist"], Some(token))?;
        let response: WishlistResponse = self.send_json(request).await?;
        Ok(response.items)
    }

    #[instrument(skip(self, token), fields(product_id = %product_id))]
    async fn add_item(
        &self,
        token: &SecretString,
        product_id: &ProductId,
    ) -> Result<(), RemoteError> {
        let request = self
            .request(Method::POST, &["wishlist", "items"], Some(token))?
            .json(&AddItemRequest {
                product_id,
                quantity: None,
            });
        self.send(request).await.map(drop)
    }

    #[instrument(skip(self, token), fields(product_id = %product_id))]
    async fn remove_item(
        &self,
        token: &SecretString,
        product_id: &ProductId,
    ) -> Result<(), RemoteError> {
        let request = self.request(
            Method::DELETE,
            &["wishlist", "items", product_id.as_str()],
            Some(token),
        )?;
        self.send(request).await.map(drop)
    }

    #[instrument(skip(self, token))]
    async fn clear_wishlist(&self, token: &SecretString) -> Result<(), RemoteError> {
        let request = self.request(Method::DELETE, &["wishlist"], Some(token))?;
        self.send(request).await.map(drop)
    }
}

// =============================================================================
// Offers
// =============================================================================

#[async_trait]
impl RemoteOfferService for HttpBackend {
    #[instrument(skip(self))]
    async fn list_offers(&self) -> Result<Vec<Offer>, RemoteError> {
        // Check cache
        if let Some(CacheValue::Offers(offers)) =
            self.inner.cache.get(&CacheKey::OfferCatalog).await
        {
            debug!("Cache hit for offer catalog");
            return Ok(offers);
        }

        let request = self.request(Method::GET, &["offers"], None)?;
        let response: OffersResponse = self.send_json(request).await?;

        self.inner
            .cache
            .insert(
                CacheKey::OfferCatalog,
                CacheValue::Offers(response.offers.clone()),
            )
            .await;

        Ok(response.offers)
    }

    #[instrument(skip(self, request), fields(offer_id = %request.offer_id))]
    async fn validate_offer(
        &self,
        request: &ValidationRequest,
    ) -> Result<ValidationOutcome, RemoteError> {
        let http_request = self
            .request(Method::POST, &["offers", "validate"], None)?
            .json(request);
        match self.send_json(http_request).await {
            // A 422 carries the reason in its body
            Err(RemoteError::Rejected(reason)) => Ok(ValidationOutcome::rejected(reason)),
            other => other,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn backend(base: &str) -> HttpBackend {
        HttpBackend::new(&RemoteConfig {
            base_url: Url::parse(base).unwrap(),
            timeout: Duration::from_secs(5),
            offer_cache_ttl: Duration::from_secs(60),
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_joins_segments() {
        let backend = backend("https://api.example.com/v1/");
        let url = backend.endpoint(&["cart", "items", "42"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/cart/items/42");
    }

    #[test]
    fn test_endpoint_without_trailing_slash() {
        let backend = backend("https://api.example.com/v1");
        let url = backend.endpoint(&["offers"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/offers");
    }

    #[test]
    fn test_endpoint_escapes_ids() {
        let backend = backend("https://api.example.com/");
        let url = backend.endpoint(&["cart", "items", "a/b c"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/cart/items/a%2Fb%20c");
    }

    #[test]
    fn test_add_item_payload_shape() {
        let id = ProductId::from(9);
        let json = serde_json::to_value(AddItemRequest {
            product_id: &id,
            quantity: Some(2),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"productId": "9", "quantity": 2}));
    }

    #[test]
    fn test_cart_response_accepts_loose_items() {
        let body = r#"{"items": [{"productId": 3, "name": "Lamp", "price": 12.5, "qty": 2}]}"#;
        let response: CartResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.items.len(), 1);
        assert_eq!(response.items[0].quantity, 2);
    }
}
