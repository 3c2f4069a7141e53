//! Wishlist commands.

use super::{CliError, Product, Session, output, product_id};

pub fn show(session: &Session) {
    if let Err(e) = output::wishlist(session, &session.storefront().wishlist().all()) {
        tracing::error!("Failed to print wishlist: {e}");
    }
}

/// Save a product.
///
/// # Errors
///
/// Returns an error for invalid product details or a failed backend call.
pub async fn add(session: &Session, product: Product) -> Result<(), CliError> {
    if !session
        .storefront()
        .add_to_wishlist(product.wishlist_item()?)
        .await?
    {
        tracing::info!("Already saved");
    }
    output::wishlist(session, &session.storefront().wishlist().all())
}

/// Unsave a product.
///
/// # Errors
///
/// Returns an error for a blank id or a failed backend call.
pub async fn remove(session: &Session, id: &str) -> Result<(), CliError> {
    if !session
        .storefront()
        .remove_from_wishlist(&product_id(id)?)
        .await?
    {
        tracing::info!("Not saved");
    }
    output::wishlist(session, &session.storefront().wishlist().all())
}

/// Move a saved product into the cart.
///
/// # Errors
///
/// Returns an error if the product is not saved or a backend call fails.
pub async fn move_to_cart(session: &Session, id: &str, quantity: u32) -> Result<(), CliError> {
    session
        .storefront()
        .move_to_cart(&product_id(id)?, quantity)
        .await?;
    output::cart(session, &session.storefront().cart().all())
}
