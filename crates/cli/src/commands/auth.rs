//! Login and logout.

use cartwright_core::UserId;
use cartwright_storefront::reconcile::ReconcileOutcome;
use secrecy::SecretString;
use tracing::info;

use super::{CliError, Session, output};

/// Sign in and merge the guest cart and wishlist into the account.
///
/// # Errors
///
/// Returns an error if the user id is blank or the session cannot be saved.
pub async fn login(
    session: &Session,
    token: String,
    user_id: Option<&str>,
) -> Result<(), CliError> {
    let user_id = user_id.map(UserId::parse).transpose()?;
    let outcome = session
        .storefront()
        .login(SecretString::from(token), user_id)
        .await?;

    match outcome {
        Some(ReconcileOutcome::Completed(report)) => info!(
            cart_merged = report.cart_merged,
            wishlist_merged = report.wishlist_merged,
            failed = report.failures.len(),
            "Signed in"
        ),
        Some(other) => info!(outcome = ?other, "Signed in"),
        None => info!("Signed in"),
    }
    output::cart(session, &session.storefront().cart().all())
}

/// Sign out.
///
/// # Errors
///
/// Returns an error if the saved session cannot be removed.
pub async fn logout(session: &Session) -> Result<(), CliError> {
    session.storefront().logout().await?;
    info!("Signed out");
    Ok(())
}
