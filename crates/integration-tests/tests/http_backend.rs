//! The HTTP adapter against services that cannot be reached.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use cartwright_storefront::config::RemoteConfig;
use cartwright_storefront::error::StoreError;
use cartwright_storefront::remote::{HttpBackend, RemoteOfferService};
use url::Url;

fn unreachable_backend() -> HttpBackend {
    HttpBackend::new(&RemoteConfig {
        // Nothing listens on port 1
        base_url: Url::parse("http://127.0.0.1:1/api/").unwrap(),
        timeout: Duration::from_secs(2),
        offer_cache_ttl: Duration::from_secs(60),
    })
    .unwrap()
}

#[tokio::test]
async fn test_unreachable_service_is_retryable() {
    let backend = unreachable_backend();
    let err = backend.list_offers().await.unwrap_err();
    assert!(err.is_retryable());

    let mapped = StoreError::from(err);
    assert!(matches!(
        mapped,
        StoreError::NetworkFailure {
            retryable: true,
            ..
        }
    ));
    assert!(mapped.is_server_class());
}
