//! Cart commands.

use super::{CliError, Product, Session, output, product_id};

pub fn show(session: &Session) {
    report(output::cart(session, &session.storefront().cart().all()));
}

/// Add units of a product.
///
/// # Errors
///
/// Returns an error for invalid product details or a failed backend call.
pub async fn add(session: &Session, product: Product, quantity: u32) -> Result<(), CliError> {
    let line = session
        .storefront()
        .add_to_cart(product.cart_item()?, quantity)
        .await?;
    tracing::info!(product_id = %line.id, quantity = line.quantity, "Cart updated");
    output::cart(session, &session.storefront().cart().all())
}

/// Remove a line.
///
/// # Errors
///
/// Returns an error for a blank id or a failed backend call.
pub async fn remove(session: &Session, id: &str) -> Result<(), CliError> {
    session.storefront().remove_from_cart(&product_id(id)?).await?;
    output::cart(session, &session.storefront().cart().all())
}

/// Set a line's quantity.
///
/// # Errors
///
/// Returns an error for a blank id or a failed backend call.
pub async fn set_quantity(session: &Session, id: &str, quantity: i64) -> Result<(), CliError> {
    let id = product_id(id)?;
    if session
        .storefront()
        .set_cart_quantity(&id, quantity)
        .await?
        .is_none()
        && quantity > 0
    {
        tracing::warn!(product_id = %id, "Not in cart");
    }
    output::cart(session, &session.storefront().cart().all())
}

/// Empty the cart.
///
/// # Errors
///
/// Returns an error for a failed backend call.
pub async fn clear(session: &Session) -> Result<(), CliError> {
    session.storefront().clear_cart().await?;
    tracing::info!("Cart cleared");
    Ok(())
}

fn report(result: Result<(), CliError>) {
    if let Err(e) = result {
        tracing::error!("Failed to print cart: {e}");
    }
}
