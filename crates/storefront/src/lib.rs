//! Cartwright Storefront - cart/wishlist reconciliation and pricing engine.
//!
//! This crate keeps a single, consistent cart and wishlist view for a client
//! regardless of whether the user is a guest (state lives in local storage)
//! or authenticated (state is authoritative on a remote service), merges the
//! guest cart into the remote one at login, resolves promotional offers
//! against the cart, and derives the priced order summary.
//!
//! # Architecture
//!
//! - [`session::SessionState`] is the only writer of guest/authenticated mode
//! - [`store::CartStore`] / [`store::WishlistStore`] mirror the backend that
//!   the current mode selects, committing only confirmed state
//! - [`reconcile::Reconciler`] merges guest state into the remote store once
//!   per login
//! - [`offers::OfferEngine`] filters, validates and tracks applied offers
//! - [`pricing::PriceSummary`] is a pure function of items and applied offers
//! - [`state::Storefront`] wires everything together for UI code
//!
//! Remote services are reached through the traits in [`remote`]; the bundled
//! [`remote::HttpBackend`] implements all of them over `reqwest`.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod error;
pub mod notify;
pub mod offers;
pub mod pricing;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod state;
pub mod storage;
pub mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use state::Storefront;
