//! Cart editing commands.
//!
//! # Usage
//!
//! ```bash
//! np-cart add sunhat --price 24.00 --quantity 2
//! np-cart set sunhat 3
//! np-cart remove sunhat
//! np-cart clear --restock
//! ```

use naked_pineapple_cart::{AddLine, CartConfig, ClearOptions, LineKey, ProductSnapshot};
use naked_pineapple_core::{CurrencyCode, Price};
use rust_decimal::Decimal;
use tracing::info;

use super::{CommandError, Engine, open, print_cart, print_notices};

/// A product to add, as given on the command line.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub product: String,
    pub variant: u32,
    pub quantity: u32,
    pub price: Decimal,
    pub name: Option<String>,
}

impl NewItem {
    fn into_intent(self, currency: CurrencyCode) -> AddLine {
        let name = self.name.unwrap_or_else(|| self.product.clone());
        AddLine::new(
            LineKey::new(self.product, self.variant),
            self.quantity,
            Price::new(self.price, currency),
            ProductSnapshot::named(name),
        )
    }
}

/// Print the cart.
///
/// # Errors
///
/// Returns `CommandError` if the engine cannot be opened.
pub async fn show(config: &CartConfig, customer: Option<&str>) -> Result<(), CommandError> {
    let sync = open(config, customer).await?;
    print_cart(sync.cart());
    Ok(())
}

/// Add units of a product.
///
/// # Errors
///
/// Returns `CommandError` if the engine cannot be opened or the guest cart
/// cannot be saved.
pub async fn add(config: &CartConfig, customer: Option<&str>, item: NewItem) -> Result<(), CommandError> {
    let mut sync = open(config, customer).await?;
    info!(product = %item.product, quantity = item.quantity, "Adding to cart");
    let currency = sync.cart().currency_code();
    sync.add(item.into_intent(currency))?;
    finish(sync).await
}

/// Set the quantity of a line.
///
/// # Errors
///
/// Returns `CommandError` if the engine cannot be opened or the guest cart
/// cannot be saved.
pub async fn set(
    config: &CartConfig,
    customer: Option<&str>,
    product: &str,
    variant: u32,
    quantity: u32,
) -> Result<(), CommandError> {
    let mut sync = open(config, customer).await?;
    sync.set_quantity(&LineKey::new(product, variant), quantity)?;
    finish(sync).await
}

/// Remove a line.
///
/// # Errors
///
/// Returns `CommandError` if the engine cannot be opened or the guest cart
/// cannot be saved.
pub async fn remove(
    config: &CartConfig,
    customer: Option<&str>,
    product: &str,
    variant: u32,
) -> Result<(), CommandError> {
    let mut sync = open(config, customer).await?;
    sync.remove(&LineKey::new(product, variant))?;
    finish(sync).await
}

/// Empty the cart.
///
/// # Errors
///
/// Returns `CommandError` if the engine cannot be opened or the guest cart
/// cannot be cleared.
pub async fn clear(config: &CartConfig, customer: Option<&str>, restock: bool) -> Result<(), CommandError> {
    let mut sync = open(config, customer).await?;
    sync.clear(ClearOptions { restock })?;
    finish(sync).await
}

/// Wait for the remote calls to land, then print the result.
async fn finish(mut sync: Engine) -> Result<(), CommandError> {
    let notices = sync.settle().await;
    print_notices(&notices);
    print_cart(sync.cart());
    Ok(())
}
