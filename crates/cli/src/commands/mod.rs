//! Subcommand implementations.
//!
//! Every command opens a fresh engine over the configured authority and the
//! guest cart file, optionally signs in, performs its intents, and waits for
//! the engine to settle before printing.

pub mod cart;
pub mod session;
pub mod watch;

use naked_pineapple_cart::{
    CartAggregate, CartConfig, CartError, CartNotice, CartSync, FileGuestStore, HttpRemoteCart,
    SessionEvent, SessionIdentity,
};
use thiserror::Error;

/// The engine as the CLI runs it.
pub type Engine = CartSync<HttpRemoteCart, FileGuestStore>;

/// Errors that can occur while running a cart command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The engine or authority failed.
    #[error(transparent)]
    Cart(#[from] CartError),

    /// A customer was given but no credential is configured.
    #[error("--customer requires CART_API_TOKEN to be set")]
    MissingCredential,
}

/// Build an engine and, for a customer, sign in and load the account cart.
///
/// # Errors
///
/// Returns `CommandError` if the client cannot be built, the guest cart
/// cannot be read, or a customer is given without a credential.
pub async fn open(config: &CartConfig, customer: Option<&str>) -> Result<Engine, CommandError> {
    let remote = HttpRemoteCart::new(&config.remote)?;
    let store = FileGuestStore::new(&config.guest_store_path);
    let mut sync = CartSync::new(remote, store, config.sync.clone())?;

    if let Some(customer) = customer {
        if !config.remote.is_authenticated() {
            return Err(CommandError::MissingCredential);
        }
        sync.on_session_event(SessionEvent::Authenticated(SessionIdentity::new(customer)))?;
        print_notices(&sync.settle().await);
    }

    Ok(sync)
}

/// Print the cart as a table.
#[allow(clippy::print_stdout)]
pub fn print_cart(cart: &CartAggregate) {
    if cart.is_empty() {
        println!("Cart is empty");
        return;
    }
    for line in cart.lines() {
        let marker = if line.is_provisional { " (pending)" } else { "" };
        println!(
            "  {:<24} {:<12} x{:<4} {:>10} {:>10}{marker}",
            line.product_snapshot.name,
            line.key().to_string(),
            line.quantity,
            line.unit_price.display(),
            line.line_total().display(),
        );
    }
    println!("  {} item(s), total {}", cart.count(), cart.total().display());
}

/// Print user-facing notices.
#[allow(clippy::print_stdout)]
pub fn print_notices(notices: &[CartNotice]) {
    for notice in notices {
        println!("! {}", notice.message());
    }
}
