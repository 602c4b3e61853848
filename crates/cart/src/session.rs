//! Session states and the guest-to-account cart handoff.
//!
//! The identity provider reports [`SessionEvent`]s; the coordinator turns
//! them into [`SessionState`] changes. On login the guest cart is
//! transplanted into the account exactly once by [`transplant_guest_cart`]:
//! a bulk `merge` first, then a per-line fallback if the authority refuses
//! the bulk call.

use std::time::Duration;

use naked_pineapple_core::CustomerId;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::CartError;
use crate::guest_store::GuestCartStore;
use crate::model::CartLine;
use crate::remote::{CartResponse, RemoteCart, with_deadline};

/// The authenticated principal, as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub customer_id: CustomerId,
}

impl SessionIdentity {
    #[must_use]
    pub fn new(customer_id: impl Into<CustomerId>) -> Self {
        Self {
            customer_id: customer_id.into(),
        }
    }
}

/// Transition events from the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The user signed in.
    Authenticated(SessionIdentity),
    /// The user signed out.
    Anonymous,
    /// The credential expired or was revoked.
    CredentialExpired,
}

/// Whose cart the engine is showing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Guest cart, persisted locally only.
    #[default]
    Anonymous,
    /// Account cart, owned by the remote authority.
    Authenticated(SessionIdentity),
}

impl SessionState {
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    #[must_use]
    pub const fn identity(&self) -> Option<&SessionIdentity> {
        match self {
            Self::Authenticated(identity) => Some(identity),
            Self::Anonymous => None,
        }
    }
}

/// How the guest cart reached the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The guest cart was empty; the account cart was fetched as is.
    NothingToMerge,
    /// The authority merged every guest line in one call.
    Merged { lines: usize },
    /// The bulk merge failed and lines were added one by one. `kept` lines
    /// could not be added and remain in guest storage.
    LineByLine { added: usize, kept: usize },
}

/// Result of a successful login handoff: the account cart to hydrate from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub response: CartResponse,
    pub outcome: MergeOutcome,
}

/// Move the guest cart into the newly authenticated account.
///
/// Guest storage is cleared once its lines are on the authority. Lines the
/// per-line fallback could not add are written back for the next login.
///
/// # Errors
///
/// - `CartError::Unauthenticated` if the credential is rejected at any step
/// - `CartError::MergeFailure` if the fallback could not read back the
///   account cart
/// - `CartError::Persistence` if guest storage cannot be read or written
#[instrument(skip_all)]
pub async fn transplant_guest_cart<R, S>(
    remote: &R,
    store: &S,
    deadline: Duration,
) -> Result<Handoff, CartError>
where
    R: RemoteCart,
    S: GuestCartStore + ?Sized,
{
    let guest = store.load()?;

    if guest.is_empty() {
        let response = with_deadline(deadline, remote.fetch()).await?;
        return Ok(Handoff {
            response,
            outcome: MergeOutcome::NothingToMerge,
        });
    }

    match with_deadline(deadline, remote.merge(&guest)).await {
        Ok(response) => {
            store.clear()?;
            info!(lines = guest.len(), "Merged guest cart into account");
            return Ok(Handoff {
                response,
                outcome: MergeOutcome::Merged { lines: guest.len() },
            });
        }
        Err(CartError::Unauthenticated) => return Err(CartError::Unauthenticated),
        Err(e) => {
            warn!(error = %e, lines = guest.len(), "Bulk merge failed, adding guest lines one by one");
        }
    }

    let (added, kept) = add_line_by_line(remote, store, &guest, deadline).await?;

    if kept.is_empty() {
        store.clear()?;
    } else {
        store.save(&kept)?;
    }

    match with_deadline(deadline, remote.fetch()).await {
        Ok(response) => Ok(Handoff {
            response,
            outcome: MergeOutcome::LineByLine {
                added,
                kept: kept.len(),
            },
        }),
        Err(CartError::Unauthenticated) => Err(CartError::Unauthenticated),
        Err(e) => Err(CartError::MergeFailure(format!(
            "added {added} of {} guest lines but could not read the account cart: {e}",
            guest.len()
        ))),
    }
}

/// Add each guest line individually. Returns how many were added and the
/// lines that must stay in guest storage.
async fn add_line_by_line<R, S>(
    remote: &R,
    store: &S,
    guest: &[CartLine],
    deadline: Duration,
) -> Result<(usize, Vec<CartLine>), CartError>
where
    R: RemoteCart,
    S: GuestCartStore + ?Sized,
{
    let mut added = 0;
    let mut kept = Vec::new();

    for (i, line) in guest.iter().enumerate() {
        let call = remote.add(&line.product_id, line.variant_index, line.quantity);
        match with_deadline(deadline, call).await {
            Ok(_) => added += 1,
            Err(CartError::Unauthenticated) => {
                kept.extend(guest.iter().skip(i).cloned());
                store.save(&kept)?;
                return Err(CartError::Unauthenticated);
            }
            Err(e) => {
                warn!(line = %line.key(), error = %e, "Guest line kept for next login");
                kept.push(line.clone());
            }
        }
    }

    Ok((added, kept))
}
