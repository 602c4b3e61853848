//! Sign-in and sign-out commands.

use naked_pineapple_cart::{CartAggregate, CartConfig, SessionEvent};
use tracing::info;

use super::{CommandError, open, print_cart};

/// Sign in as `customer`. Any guest cart on disk is merged into the account.
///
/// # Errors
///
/// Returns `CommandError` if no credential is configured or the engine
/// cannot be opened.
pub async fn login(config: &CartConfig, customer: &str) -> Result<(), CommandError> {
    let sync = open(config, Some(customer)).await?;
    info!(customer_id = customer, "Signed in");
    print_cart(sync.cart());
    Ok(())
}

/// Sign out and show the guest cart left on the device.
///
/// No sign-in happens first, so the guest cart is neither merged into the
/// account nor removed from disk.
///
/// # Errors
///
/// Returns `CommandError` if the guest cart cannot be read.
pub async fn logout(config: &CartConfig) -> Result<CartAggregate, CommandError> {
    let mut sync = open(config, None).await?;
    sync.on_session_event(SessionEvent::Anonymous)?;
    info!("Signed out");
    print_cart(sync.cart());
    Ok(sync.cart().clone())
}
