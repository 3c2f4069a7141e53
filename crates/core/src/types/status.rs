//! Status enums for the session and offer state machines.

use serde::{Deserialize, Serialize};

/// Which backend is authoritative for cart and wishlist state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// No valid session token; state is local only.
    #[default]
    Guest,
    /// Valid session token; state is remote-authoritative.
    Authenticated,
}

impl SessionMode {
    /// Whether this is [`SessionMode::Authenticated`].
    #[must_use]
    pub const fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

/// Lifecycle of a candidate offer against the current cart.
///
/// ```text
/// Ineligible -> Eligible -> Validating -> Applied
///                                      -> Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OfferState {
    /// Scope does not match the cart, or the offer is outside its window.
    #[default]
    Ineligible,
    /// Could be applied to the current cart.
    Eligible,
    /// A validation call is in flight.
    Validating,
    /// Confirmed by the validation authority for the current cart.
    Applied,
    /// Refused by the validation authority for the current cart.
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_mode_default_is_guest() {
        assert_eq!(SessionMode::default(), SessionMode::Guest);
        assert!(!SessionMode::Guest.is_authenticated());
        assert!(SessionMode::Authenticated.is_authenticated());
    }

    #[test]
    fn test_offer_state_serde() {
        let json = serde_json::to_string(&OfferState::Validating).unwrap_or_default();
        assert_eq!(json, "\"validating\"");
    }
}
