//! Error taxonomy for the cart engine, plus Sentry helpers.
//!
//! Remote failures map onto [`CartError`]. The coordinator decides what each
//! kind means for the cart: validation and network failures roll back the
//! failed edit, authentication failures reset the session, and a missing line
//! on remove counts as success. Stale responses never become errors; fencing
//! drops them before they reach this type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::guest_store::StoreError;

/// Errors surfaced by the remote cart authority and the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CartError {
    /// The authority rejected the edit because there is not enough stock.
    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    /// The authority rejected the request payload for another reason.
    #[error("Validation rejected: {0}")]
    ValidationRejected(String),

    /// The line or cart does not exist on the authority.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The bearer credential is missing, expired or revoked.
    #[error("Unauthenticated")]
    Unauthenticated,

    /// The request never produced a response.
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// The request exceeded its deadline.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// The authority failed while handling the request.
    #[error("Server fault: {status} - {message}")]
    ServerFault { status: u16, message: String },

    /// Merging the guest cart failed and the per-line fallback could not
    /// complete.
    #[error("Guest cart merge failed: {0}")]
    MergeFailure(String),

    /// The guest cart could not be read or written.
    #[error("Guest cart storage error: {0}")]
    Persistence(String),

    /// Engine configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CartError {
    /// Whether the failed edit should be rolled back and reported.
    #[must_use]
    pub const fn triggers_rollback(&self) -> bool {
        matches!(
            self,
            Self::InsufficientStock(_)
                | Self::ValidationRejected(_)
                | Self::NetworkFailure(_)
                | Self::Timeout(_)
                | Self::ServerFault { .. }
        )
    }

    /// Whether the user can safely retry the same intent.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkFailure(_) | Self::Timeout(_) | Self::ServerFault { .. }
        )
    }

    /// Short message suitable for a transient UI notice.
    ///
    /// Internal details (status codes, transport errors) are not exposed.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::InsufficientStock(_) => "Not enough stock for that quantity".to_string(),
            Self::ValidationRejected(msg) => msg.clone(),
            Self::NotFound(_) => "That item is no longer in your cart".to_string(),
            Self::Unauthenticated => "Your session expired, please sign in again".to_string(),
            Self::NetworkFailure(_) | Self::Timeout(_) => {
                "Could not reach the store, please try again".to_string()
            }
            Self::ServerFault { .. } => "The store had a problem, please try again".to_string(),
            Self::MergeFailure(_) => {
                "Some items from your guest cart could not be added yet".to_string()
            }
            Self::Persistence(_) | Self::Config(_) => "Internal error".to_string(),
        }
    }
}

impl From<StoreError> for CartError {
    fn from(err: StoreError) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<ConfigError> for CartError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type alias for `CartError`.
pub type Result<T> = std::result::Result<T, CartError>;

/// Set the Sentry user context from a customer ID.
///
/// Call this after the session becomes authenticated to associate errors
/// with the customer.
pub fn set_sentry_customer(customer_id: &impl ToString) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(customer_id.to_string()),
            ..Default::default()
        }));
    });
}

/// Clear the Sentry user context.
///
/// Call this on logout or credential expiry.
pub fn clear_sentry_customer() {
    sentry::configure_scope(|scope| {
        scope.set_user(None);
    });
}

/// Add a breadcrumb for cart activity.
///
/// Breadcrumbs appear in Sentry error reports to show the trail of cart
/// actions leading up to an error.
///
/// # Example
///
/// ```rust,ignore
/// add_breadcrumb("cart", "Rolled back optimistic edit", Some(&[("line", "p1#0")]));
/// ```
pub fn add_breadcrumb(category: &str, message: &str, data: Option<&[(&str, &str)]>) {
    let mut breadcrumb = sentry::Breadcrumb {
        category: Some(category.to_string()),
        message: Some(message.to_string()),
        level: sentry::Level::Info,
        ..Default::default()
    };

    if let Some(pairs) = data {
        for (key, value) in pairs {
            breadcrumb.data.insert(
                (*key).to_string(),
                serde_json::Value::String((*value).to_string()),
            );
        }
    }

    sentry::add_breadcrumb(breadcrumb);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cart_error_display() {
        let err = CartError::NotFound("p1#0".to_string());
        assert_eq!(err.to_string(), "Not found: p1#0");

        let err = CartError::ServerFault {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "Server fault: 503 - unavailable");
    }

    #[test]
    fn test_rollback_classification() {
        assert!(CartError::InsufficientStock("p1".into()).triggers_rollback());
        assert!(CartError::Timeout(100).triggers_rollback());
        assert!(CartError::NetworkFailure("reset".into()).triggers_rollback());
        assert!(!CartError::Unauthenticated.triggers_rollback());
        assert!(!CartError::NotFound("p1".into()).triggers_rollback());
    }

    #[test]
    fn test_retryable() {
        assert!(CartError::Timeout(100).is_retryable());
        assert!(!CartError::InsufficientStock("p1".into()).is_retryable());
    }

    #[test]
    fn test_user_message_hides_internals() {
        let err = CartError::ServerFault {
            status: 500,
            message: "stack trace here".to_string(),
        };
        assert!(!err.user_message().contains("stack trace"));
        let err = CartError::NetworkFailure("connection refused 10.0.0.1".to_string());
        assert!(!err.user_message().contains("10.0.0.1"));
    }
}
