//! Naked Pineapple cart synchronization engine.
//!
//! Keeps a shopping cart consistent across optimistic local edits,
//! asynchronous confirmation from the remote cart authority, a device-local
//! guest cart, and the merge of that guest cart into an account at login.
//!
//! # Architecture
//!
//! - [`model`] - `CartAggregate`, `CartLine` and the per-line `LineKey`
//! - [`reducer`] - pure transitions (optimistic apply, reconcile, rollback)
//! - [`fencing`] - per-line request tokens so only the latest result applies
//! - [`throttle`] - debounce of rapid quantity edits
//! - [`remote`] - the `RemoteCart` trait and its HTTP client
//! - [`guest_store`] - durable storage for the anonymous cart
//! - [`session`] - login handoff and session states
//! - [`revalidate`] - background refresh policy and removal notifications
//! - [`engine`] - `CartSync`, the coordinator that owns the cart

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod engine;
pub mod error;
pub mod fencing;
pub mod guest_store;
pub mod model;
pub mod observers;
pub mod reducer;
pub mod remote;
pub mod revalidate;
pub mod session;
pub mod throttle;

pub use config::{CartConfig, ConfigError, RemoteConfig, SyncConfig};
pub use engine::{CartNotice, CartSync};
pub use error::{CartError, Result};
pub use guest_store::{FileGuestStore, GuestCartStore, MemoryGuestStore, StoreError};
pub use model::{CartAggregate, CartLine, LineKey, OperationKind, ProductSnapshot, RemovalBatch};
pub use reducer::AddLine;
pub use remote::{CartResponse, ClearOptions, HttpRemoteCart, RemoteCart};
pub use revalidate::{RevalidationDecision, RevalidationTrigger};
pub use session::{SessionEvent, SessionIdentity, SessionState};
