//! Remote cart authority client.
//!
//! # Architecture
//!
//! - [`RemoteCart`] is the seam between the engine and the authority; the
//!   engine only ever talks to this trait
//! - [`HttpRemoteCart`] implements it over JSON/HTTP with `reqwest`
//! - Every call returns a [`CartResponse`], which carries either the single
//!   affected line or the full line collection, plus totals
//!
//! # Reconciliation contract
//!
//! Callers must accept both response shapes and prefer the full collection
//! when it is present. A response without a collection and without a line
//! means the addressed line no longer exists.

mod http;

use std::future::Future;
use std::time::Duration;

use naked_pineapple_core::{Price, ProductId};
use serde::{Deserialize, Serialize};

pub use http::HttpRemoteCart;

use crate::error::CartError;
use crate::model::{CartLine, LineKey, RemovalBatch};

/// Authoritative answer to a cart request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CartResponse {
    /// Full line collection, when the authority returned it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<Vec<CartLine>>,
    /// The single affected line, when the authority returned only that.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<CartLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Lines the authority removed on its own since the last read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<RemovalBatch>,
}

impl CartResponse {
    /// Response carrying the full collection.
    #[must_use]
    pub fn collection(lines: Vec<CartLine>, total: Price, count: u64) -> Self {
        Self {
            lines: Some(lines),
            total: Some(total),
            count: Some(count),
            ..Self::default()
        }
    }

    /// Response carrying one affected line (or none, meaning it was removed).
    #[must_use]
    pub fn single(line: Option<CartLine>, total: Price, count: u64) -> Self {
        Self {
            line,
            total: Some(total),
            count: Some(count),
            ..Self::default()
        }
    }

    /// The authoritative state of one line according to this response.
    ///
    /// `None` means the line does not exist on the authority.
    #[must_use]
    pub fn authoritative_line(&self, key: &LineKey) -> Option<&CartLine> {
        match &self.lines {
            Some(lines) => lines.iter().find(|l| l.matches(key)),
            None => self.line.as_ref().filter(|l| l.matches(key)),
        }
    }
}

/// Options for emptying a cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClearOptions {
    /// Return reserved stock to inventory.
    #[serde(default)]
    pub restock: bool,
}

/// Body of `POST /cart`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddLineRequest {
    pub product_id: ProductId,
    #[serde(default)]
    pub variant_index: u32,
    pub quantity: u32,
}

/// Body of `PUT /cart/{productId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetQuantityRequest {
    #[serde(default)]
    pub variant_index: u32,
    pub quantity: u32,
}

/// Body of `POST /cart/merge`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub lines: Vec<CartLine>,
}

/// Error body returned by the authority on rejected requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error_kind: RemoteErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Machine-readable rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    InsufficientStock,
    NotFound,
    Unauthenticated,
    Invalid,
}

/// Operations against the remote cart authority.
///
/// # Implementation Notes
///
/// - Implementations must be cheap to clone and thread-safe; the engine
///   clones the client into each spawned request
/// - `remove` reports `CartError::NotFound` when the line is already absent;
///   the engine treats that as success
/// - Timeouts are applied by the engine around every call
pub trait RemoteCart: Clone + Send + Sync + 'static {
    /// Read the whole cart.
    fn fetch(&self) -> impl Future<Output = Result<CartResponse, CartError>> + Send;

    /// Add `quantity` units of a product variant.
    fn add(
        &self,
        product_id: &ProductId,
        variant_index: u32,
        quantity: u32,
    ) -> impl Future<Output = Result<CartResponse, CartError>> + Send;

    /// Set the quantity of a line; 0 removes it.
    fn set_quantity(
        &self,
        key: &LineKey,
        quantity: u32,
    ) -> impl Future<Output = Result<CartResponse, CartError>> + Send;

    /// Remove a line.
    fn remove(&self, key: &LineKey) -> impl Future<Output = Result<CartResponse, CartError>> + Send;

    /// Empty the cart.
    fn clear(
        &self,
        options: ClearOptions,
    ) -> impl Future<Output = Result<CartResponse, CartError>> + Send;

    /// Merge guest lines into the authenticated cart.
    fn merge(
        &self,
        guest_lines: &[CartLine],
    ) -> impl Future<Output = Result<CartResponse, CartError>> + Send;
}

/// Run a remote call under a deadline; expiry becomes [`CartError::Timeout`].
///
/// # Errors
///
/// Returns the call's own error, or `CartError::Timeout` if `deadline`
/// elapses first.
pub async fn with_deadline<T>(
    deadline: Duration,
    call: impl Future<Output = Result<T, CartError>>,
) -> Result<T, CartError> {
    tokio::time::timeout(deadline, call).await.unwrap_or_else(|_| {
        Err(CartError::Timeout(
            u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{line, price};

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_is_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, CartError>(())
        };
        let result = with_deadline(Duration::from_millis(250), slow).await;
        assert_eq!(result, Err(CartError::Timeout(250)));
    }

    #[test]
    fn test_prefers_collection_over_single_line() {
        let mut response = CartResponse::collection(vec![line("p1", 4, 10)], price(40), 4);
        response.line = Some(line("p1", 1, 10));
        let authoritative = response.authoritative_line(&LineKey::product("p1"));
        assert_eq!(authoritative.map(|l| l.quantity), Some(4));
    }

    #[test]
    fn test_single_without_line_means_removed() {
        let response = CartResponse::single(None, price(0), 0);
        assert!(response.authoritative_line(&LineKey::product("p1")).is_none());
    }

    #[test]
    fn test_single_line_for_other_key_is_ignored() {
        let response = CartResponse::single(Some(line("p2", 1, 5)), price(5), 1);
        assert!(response.authoritative_line(&LineKey::product("p1")).is_none());
    }

    #[test]
    fn test_error_body_wire_shape() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"errorKind":"InsufficientStock","message":"only 2 left"}"#)
                .unwrap_or(ErrorBody {
                    error_kind: RemoteErrorKind::Invalid,
                    message: None,
                });
        assert_eq!(body.error_kind, RemoteErrorKind::InsufficientStock);
        assert_eq!(body.message.as_deref(), Some("only 2 left"));
    }
}
