//! Offer and summary commands.

use cartwright_core::OfferId;
use cartwright_storefront::offers::ApplyOutcome;
use tracing::{info, warn};

use super::{CliError, Session, output};

pub fn list(session: &Session) {
    if let Err(e) = output::offers(session, &session.storefront().offers()) {
        tracing::error!("Failed to print offers: {e}");
    }
}

/// Apply each offer in turn, then print the priced summary.
///
/// An offer that is rejected or ineligible does not stop the others.
///
/// # Errors
///
/// Returns an error for a blank or unknown offer id, or a failed validation.
pub async fn summary(session: &Session, offer_ids: &[String]) -> Result<(), CliError> {
    for raw in offer_ids {
        let id = OfferId::parse(raw)?;
        match session.storefront().apply_offer(&id).await? {
            ApplyOutcome::Applied(applied) => {
                info!(offer_id = %id, discount = %applied.discount_amount, "Offer applied");
            }
            ApplyOutcome::Rejected { reason } => warn!(offer_id = %id, "Offer rejected: {reason}"),
            ApplyOutcome::Ineligible => warn!(offer_id = %id, "Offer does not apply to this cart"),
            ApplyOutcome::AlreadyApplied | ApplyOutcome::AlreadyValidating => {}
        }
    }
    output::summary(session, &session.storefront().price_summary())
}
