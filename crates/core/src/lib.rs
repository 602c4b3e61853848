//! Naked Pineapple Core - Shared types library.
//!
//! This crate provides common types used across the cart components:
//! - `cart` - Cart synchronization engine (optimistic edits, fencing, merge)
//! - `cli` - Command-line front end for the engine
//! - `integration-tests` - Mock remote authority and end-to-end tests
//!
//! # Architecture
//!
//! The core crate contains only types - no I/O, no HTTP clients, no storage.
//! This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for opaque IDs, prices, and stock status

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
