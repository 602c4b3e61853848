//! JSON/HTTP implementation of [`RemoteCart`].
//!
//! Uses `reqwest` with a bearer credential taken from [`RemoteConfig`]. The
//! response body is read as text first so failures can be logged with a
//! truncated body before being mapped onto [`CartError`].

use std::sync::Arc;
use std::time::Duration;

use naked_pineapple_core::ProductId;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use super::{
    AddLineRequest, CartResponse, ClearOptions, ErrorBody, MergeRequest, RemoteCart,
    RemoteErrorKind, SetQuantityRequest,
};
use crate::config::RemoteConfig;
use crate::error::CartError;
use crate::model::{CartLine, LineKey};

/// Maximum number of body characters included in logs and error messages.
const LOGGED_BODY_CHARS: usize = 500;

/// Client for the remote cart authority.
///
/// Cheaply cloneable via `Arc`; the engine clones it into every spawned
/// request.
#[derive(Clone)]
pub struct HttpRemoteCart {
    inner: Arc<HttpRemoteCartInner>,
}

struct HttpRemoteCartInner {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl std::fmt::Debug for HttpRemoteCart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteCart")
            .field("base_url", &self.inner.base_url.as_str())
            .field("timeout", &self.inner.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpRemoteCart {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Config` if the credential cannot be encoded as a
    /// header or the HTTP client fails to build.
    pub fn new(config: &RemoteConfig) -> Result<Self, CartError> {
        let mut headers = HeaderMap::new();

        if let Some(token) = &config.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| CartError::Config(format!("Invalid bearer token format: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CartError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(HttpRemoteCartInner {
                client,
                base_url: config.base_url.clone(),
                timeout: config.request_timeout,
            }),
        })
    }

    /// Build `{base_url}/{segments...}` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, CartError> {
        let mut url = self.inner.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| CartError::Config("Remote base URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send a request and map the response onto the reconciliation contract.
    async fn execute<B: Serialize + Sync>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
        context: &str,
    ) -> Result<CartResponse, CartError> {
        let mut request = self.inner.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| self.transport_error(&e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(&e))?;

        if !status.is_success() {
            return Err(map_status(status, &text, context));
        }

        if text.trim().is_empty() {
            return Ok(CartResponse::default());
        }

        // Some authorities report stock rejections with a 200 and an error body
        if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
            return Err(map_error_body(body, context));
        }

        serde_json::from_str::<CartResponse>(&text).map_err(|e| {
            tracing::error!(
                error = %e,
                body = %truncate(&text),
                "Failed to parse cart authority response"
            );
            CartError::ServerFault {
                status: status.as_u16(),
                message: format!("Unparseable response: {e}"),
            }
        })
    }

    fn transport_error(&self, err: &reqwest::Error) -> CartError {
        if err.is_timeout() {
            let millis = u64::try_from(self.inner.timeout.as_millis()).unwrap_or(u64::MAX);
            CartError::Timeout(millis)
        } else {
            CartError::NetworkFailure(err.to_string())
        }
    }
}

impl RemoteCart for HttpRemoteCart {
    #[instrument(skip(self))]
    async fn fetch(&self) -> Result<CartResponse, CartError> {
        let url = self.endpoint(&["cart"])?;
        self.execute::<()>(Method::GET, url, None, "cart").await
    }

    #[instrument(skip(self), fields(product_id = %product_id))]
    async fn add(
        &self,
        product_id: &ProductId,
        variant_index: u32,
        quantity: u32,
    ) -> Result<CartResponse, CartError> {
        let url = self.endpoint(&["cart"])?;
        let body = AddLineRequest {
            product_id: product_id.clone(),
            variant_index,
            quantity,
        };
        self.execute(Method::POST, url, Some(&body), product_id.as_str())
            .await
    }

    #[instrument(skip(self), fields(line = %key))]
    async fn set_quantity(&self, key: &LineKey, quantity: u32) -> Result<CartResponse, CartError> {
        let url = self.endpoint(&["cart", key.product_id.as_str()])?;
        let body = SetQuantityRequest {
            variant_index: key.variant_index,
            quantity,
        };
        self.execute(Method::PUT, url, Some(&body), key.product_id.as_str())
            .await
    }

    #[instrument(skip(self), fields(line = %key))]
    async fn remove(&self, key: &LineKey) -> Result<CartResponse, CartError> {
        let mut url = self.endpoint(&["cart", key.product_id.as_str()])?;
        url.query_pairs_mut()
            .append_pair("variantIndex", &key.variant_index.to_string());
        self.execute::<()>(Method::DELETE, url, None, key.product_id.as_str())
            .await
    }

    #[instrument(skip(self))]
    async fn clear(&self, options: ClearOptions) -> Result<CartResponse, CartError> {
        let url = self.endpoint(&["cart"])?;
        self.execute(Method::DELETE, url, Some(&options), "cart")
            .await
    }

    #[instrument(skip(self, guest_lines), fields(lines = guest_lines.len()))]
    async fn merge(&self, guest_lines: &[CartLine]) -> Result<CartResponse, CartError> {
        let url = self.endpoint(&["cart", "merge"])?;
        let body = MergeRequest {
            lines: guest_lines.to_vec(),
        };
        debug!("Merging guest cart");
        self.execute(Method::POST, url, Some(&body), "merge").await
    }
}

/// Map a non-success status onto the error taxonomy.
fn map_status(status: StatusCode, body: &str, context: &str) -> CartError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CartError::Unauthenticated,
        StatusCode::NOT_FOUND => CartError::NotFound(context.to_string()),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            serde_json::from_str::<ErrorBody>(body).map_or_else(
                |_| CartError::ValidationRejected(truncate(body)),
                |parsed| map_error_body(parsed, context),
            )
        }
        _ => {
            tracing::error!(
                status = %status,
                body = %truncate(body),
                "Cart authority returned non-success status"
            );
            CartError::ServerFault {
                status: status.as_u16(),
                message: truncate(body),
            }
        }
    }
}

fn map_error_body(body: ErrorBody, context: &str) -> CartError {
    let message = body.message.unwrap_or_else(|| context.to_string());
    match body.error_kind {
        RemoteErrorKind::InsufficientStock => CartError::InsufficientStock(message),
        RemoteErrorKind::NotFound => CartError::NotFound(message),
        RemoteErrorKind::Unauthenticated => CartError::Unauthenticated,
        RemoteErrorKind::Invalid => CartError::ValidationRejected(message),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(LOGGED_BODY_CHARS).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn client(base: &str) -> HttpRemoteCart {
        HttpRemoteCart::new(&RemoteConfig {
            base_url: Url::parse(base).unwrap(),
            bearer_token: Some(SecretString::from("k3y-Zq81-xT0p")),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_joins_segments() {
        let remote = client("https://api.example.test/v1/");
        let url = remote.endpoint(&["cart", "p 1"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.test/v1/cart/p%201");

        let remote = client("https://api.example.test/v1");
        let url = remote.endpoint(&["cart", "merge"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.test/v1/cart/merge");
    }

    #[test]
    fn test_map_status_authentication() {
        assert_eq!(
            map_status(StatusCode::UNAUTHORIZED, "", "cart"),
            CartError::Unauthenticated
        );
    }

    #[test]
    fn test_map_status_not_found() {
        assert_eq!(
            map_status(StatusCode::NOT_FOUND, "", "p1"),
            CartError::NotFound("p1".to_string())
        );
    }

    #[test]
    fn test_map_status_insufficient_stock_body() {
        let err = map_status(
            StatusCode::CONFLICT,
            r#"{"errorKind":"InsufficientStock"}"#,
            "p1",
        );
        assert_eq!(err, CartError::InsufficientStock("p1".to_string()));
    }

    #[test]
    fn test_map_status_server_fault() {
        let err = map_status(StatusCode::BAD_GATEWAY, "upstream down", "cart");
        assert_eq!(
            err,
            CartError::ServerFault {
                status: 502,
                message: "upstream down".to_string()
            }
        );
    }

    #[test]
    fn test_debug_does_not_leak_token() {
        let remote = client("https://api.example.test/");
        let output = format!("{remote:?}");
        assert!(output.contains("api.example.test"));
        assert!(!output.contains("k3y-Zq81"));
    }
}
