//! Integration test support for the Naked Pineapple cart engine.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p naked-pineapple-integration-tests
//! ```
//!
//! No external services are needed: everything runs in-process.
//!
//! # Test Doubles
//!
//! - [`MockAuthority`] - an axum server on an ephemeral port speaking the
//!   remote cart wire protocol, used with the real `HttpRemoteCart`
//! - [`ScriptedRemote`] - an in-process `RemoteCart` whose calls block until
//!   the test answers them, so tests control response order exactly

#![cfg_attr(not(test), forbid(unsafe_code))]

mod authority;
mod scripted;

pub use authority::{CatalogItem, MockAuthority};
pub use scripted::{Call, ScriptedRemote};

use chrono::{TimeZone, Utc};
use naked_pineapple_cart::{AddLine, CartAggregate, CartLine, CartResponse, LineKey, ProductSnapshot};
use naked_pineapple_core::{CurrencyCode, LineId, Price, ProductId};
use rust_decimal::Decimal;

/// A whole-unit USD price.
#[must_use]
pub fn usd(whole: i64) -> Price {
    Price::new(Decimal::new(whole, 0), CurrencyCode::USD)
}

/// A confirmed line for variant 0 of `product`.
#[must_use]
pub fn line(product: &str, quantity: u32, unit: i64) -> CartLine {
    CartLine {
        line_id: LineId::new(format!("srv-{product}")),
        product_id: ProductId::new(product),
        variant_index: 0,
        quantity,
        unit_price: usd(unit),
        product_snapshot: ProductSnapshot::named(product),
        added_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap_or_default(),
        is_provisional: false,
    }
}

/// An add intent for variant 0 of `product`.
#[must_use]
pub fn add_intent(product: &str, quantity: u32, unit: i64) -> AddLine {
    AddLine::new(
        LineKey::product(product),
        quantity,
        usd(unit),
        ProductSnapshot::named(product),
    )
}

/// A full-collection response with totals computed from `lines`.
#[must_use]
pub fn collection(lines: Vec<CartLine>) -> CartResponse {
    let cart = CartAggregate::from_lines(lines, CurrencyCode::USD);
    CartResponse::collection(cart.lines().to_vec(), cart.total(), cart.count())
}

/// A single-line response whose totals come from the whole server cart.
#[must_use]
pub fn single(affected: Option<CartLine>, server_cart: Vec<CartLine>) -> CartResponse {
    let cart = CartAggregate::from_lines(server_cart, CurrencyCode::USD);
    CartResponse::single(affected, cart.total(), cart.count())
}
