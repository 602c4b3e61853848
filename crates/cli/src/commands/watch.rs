//! Periodic revalidation of the account cart.

use std::time::Duration;

use naked_pineapple_cart::{CartConfig, RevalidationTrigger};
use tracing::info;

use super::{CommandError, open, print_cart, print_notices};

/// Revalidate every `interval_secs` seconds, printing the cart whenever a
/// notice arrives, until Ctrl-C.
///
/// # Errors
///
/// Returns `CommandError` if the engine cannot be opened.
pub async fn run(config: &CartConfig, customer: &str, interval_secs: u64) -> Result<(), CommandError> {
    let mut sync = open(config, Some(customer)).await?;
    print_cart(sync.cart());

    sync.revalidate(RevalidationTrigger::Manual);
    sync.start_revalidation_interval(Duration::from_secs(interval_secs.max(1)));
    info!(interval_secs, "Watching cart; press Ctrl-C to stop");

    loop {
        tokio::select! {
            notices = sync.next_event() => {
                if !notices.is_empty() {
                    print_notices(&notices);
                    print_cart(sync.cart());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping watch");
                break;
            }
        }
    }

    sync.stop_revalidation_interval();
    Ok(())
}
