//! Cart invariants exercised through the storefront facade.

#![allow(clippy::unwrap_used)]

use std::collections::HashSet;

use cartwright_core::ProductId;
use cartwright_integration_tests::TestContext;
use cartwright_storefront::error::StoreError;
use cartwright_storefront::testing::cart_item;

fn id(n: i64) -> ProductId {
    ProductId::from(n)
}

#[tokio::test]
async fn test_repeated_add_sums_quantities() {
    let ctx = TestContext::new().await;
    ctx.storefront.add_to_cart(cart_item(1, "4"), 2).await.unwrap();
    ctx.storefront.add_to_cart(cart_item(1, "4"), 3).await.unwrap();

    assert_eq!(ctx.storefront.cart().get(&id(1)).unwrap().quantity, 5);
}

#[tokio::test]
async fn test_item_count_is_sum_of_unique_lines() {
    let ctx = TestContext::new().await;
    for (n, qty) in [(1, 2), (2, 1), (1, 1), (3, 4), (2, 2)] {
        ctx.storefront
            .add_to_cart(cart_item(n, "1.25"), qty)
            .await
            .unwrap();
    }

    let items = ctx.storefront.cart().all();
    let ids: HashSet<_> = items.iter().map(|item| item.id.clone()).collect();
    assert_eq!(ids.len(), items.len());
    assert_eq!(
        ctx.storefront.cart().total_item_count(),
        items.iter().map(|item| u64::from(item.quantity)).sum::<u64>()
    );
    assert_eq!(ctx.storefront.cart().total_item_count(), 10);
}

#[tokio::test]
async fn test_set_quantity_zero_matches_remove() {
    let by_zero = TestContext::new().await;
    let by_remove = TestContext::new().await;
    for ctx in [&by_zero, &by_remove] {
        ctx.storefront.add_to_cart(cart_item(1, "10"), 2).await.unwrap();
        ctx.storefront.add_to_cart(cart_item(2, "3"), 1).await.unwrap();
    }

    by_zero
        .storefront
        .set_cart_quantity(&id(1), 0)
        .await
        .unwrap();
    by_remove.storefront.remove_from_cart(&id(1)).await.unwrap();

    assert_eq!(by_zero.storefront.cart().all(), by_remove.storefront.cart().all());
    assert!(!by_zero.storefront.cart().contains(&id(1)));
}

#[tokio::test]
async fn test_guest_cart_survives_restart() {
    let ctx = TestContext::new().await;
    ctx.storefront.add_to_cart(cart_item(7, "2"), 3).await.unwrap();
    ctx.storefront.shutdown();

    let restarted = ctx.second_instance().await;
    assert_eq!(restarted.cart().get(&id(7)).unwrap().quantity, 3);
}

#[tokio::test]
async fn test_authenticated_failure_keeps_cart_and_notifies() {
    let ctx = TestContext::new().await;
    ctx.cart_remote.seed(cart_item(1, "10"));
    ctx.login().await;
    let before = ctx.storefront.cart_snapshot();
    let mut notifications = ctx.storefront.notifications();

    ctx.cart_remote.fail_on(&id(1));
    let result = ctx.storefront.set_cart_quantity(&id(1), 4).await;

    assert!(matches!(
        result,
        Err(StoreError::NetworkFailure {
            retryable: true,
            ..
        })
    ));
    assert_eq!(ctx.storefront.cart_snapshot(), before);
    assert!(notifications.try_recv().is_ok());
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_zero_amount_is_rejected() {
    let ctx = TestContext::new().await;
    let result = ctx.storefront.add_to_cart(cart_item(1, "1"), 0).await;
    assert!(matches!(result, Err(StoreError::InvalidInput(_))));
    assert!(ctx.storefront.cart().is_empty());
}
