//! Cartwright Core - Shared types library.
//!
//! This crate provides the domain types used by every Cartwright component:
//! - `storefront` - Cart/wishlist reconciliation and pricing engine
//! - `cli` - Command-line client driving the engine
//!
//! # Architecture
//!
//! The core crate contains only types and pure rules - no I/O, no storage,
//! no HTTP clients. Wire payloads are coerced into these canonical types at
//! the system boundary (see [`RawId`] and the `try_from` deserializers), so
//! the rest of the system never deals with loosely-typed shapes.
//!
//! # Modules
//!
//! - [`types`] - Identities, money, cart/wishlist items, offers and statuses

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
