//! In-process remote cart authority.
//!
//! Serves the cart wire protocol over HTTP on `127.0.0.1` with an ephemeral
//! port. State lives in memory and is inspected and steered by the test
//! through [`MockAuthority`].
//!
//! Merge policy: quantities for a product present in both carts are summed,
//! capped at the product's stock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use naked_pineapple_cart::remote::{
    AddLineRequest, ErrorBody, MergeRequest, RemoteErrorKind, SetQuantityRequest,
};
use naked_pineapple_cart::{
    CartAggregate, CartLine, CartResponse, ClearOptions, LineKey, ProductSnapshot, RemoteConfig,
    RemovalBatch,
};
use naked_pineapple_core::{CurrencyCode, LineId, Price, ProductId, StockStatus};
use secrecy::SecretString;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

/// A product the authority sells.
#[derive(Debug, Clone)]
pub struct CatalogItem {
    pub product_id: ProductId,
    pub name: String,
    pub unit_price: Price,
    /// Maximum quantity of this product one cart may hold.
    pub stock: u32,
}

impl CatalogItem {
    #[must_use]
    pub fn new(product_id: &str, unit_price: Price, stock: u32) -> Self {
        Self {
            product_id: ProductId::new(product_id),
            name: product_id.to_string(),
            unit_price,
            stock,
        }
    }
}

struct AuthorityState {
    token: String,
    catalog: HashMap<ProductId, CatalogItem>,
    lines: Vec<CartLine>,
    next_line: u64,
    removed: Option<RemovalBatch>,
    fail_merge: bool,
    requests: Vec<String>,
}

impl AuthorityState {
    fn snapshot(&self) -> CartAggregate {
        CartAggregate::from_lines(self.lines.clone(), CurrencyCode::USD)
    }

    fn collection(&self) -> CartResponse {
        let cart = self.snapshot();
        CartResponse {
            removed: self.removed.clone(),
            ..CartResponse::collection(cart.lines().to_vec(), cart.total(), cart.count())
        }
    }

    fn single(&self, key: &LineKey) -> CartResponse {
        let cart = self.snapshot();
        CartResponse::single(cart.line(key).cloned(), cart.total(), cart.count())
    }

    fn new_line(&mut self, item: &CatalogItem, variant_index: u32, quantity: u32) -> CartLine {
        self.next_line += 1;
        CartLine {
            line_id: LineId::new(format!("line-{}", self.next_line)),
            product_id: item.product_id.clone(),
            variant_index,
            quantity,
            unit_price: item.unit_price,
            product_snapshot: ProductSnapshot {
                name: item.name.clone(),
                image_url: None,
                stock_limit: Some(item.stock),
                stock_status: StockStatus::from_remaining(Some(item.stock), 5),
            },
            added_at: Utc::now(),
            is_provisional: false,
        }
    }

    fn quantity_of(&self, key: &LineKey) -> u32 {
        self.lines
            .iter()
            .find(|l| l.matches(key))
            .map_or(0, |l| l.quantity)
    }
}

type Shared = Arc<Mutex<AuthorityState>>;

fn lock(state: &Shared) -> MutexGuard<'_, AuthorityState> {
    state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Rejection sent back as an error body.
struct Rejection(StatusCode, ErrorBody);

impl Rejection {
    fn new(status: StatusCode, kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self(
            status,
            ErrorBody {
                error_kind: kind,
                message: Some(message.into()),
            },
        )
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

type Reply = Result<Json<CartResponse>, Rejection>;

/// Check the bearer credential and log the request.
fn authorize(state: &Shared, headers: &HeaderMap, request: String) -> Result<(), Rejection> {
    let mut guard = lock(state);
    guard.requests.push(request);
    let expected = format!("Bearer {}", guard.token);
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(Rejection::new(
            StatusCode::UNAUTHORIZED,
            RemoteErrorKind::Unauthenticated,
            "invalid credential",
        ))
    }
}

fn catalog_item(state: &AuthorityState, product_id: &ProductId) -> Result<CatalogItem, Rejection> {
    state.catalog.get(product_id).cloned().ok_or_else(|| {
        Rejection::new(
            StatusCode::NOT_FOUND,
            RemoteErrorKind::NotFound,
            format!("unknown product {product_id}"),
        )
    })
}

fn insufficient_stock(item: &CatalogItem) -> Rejection {
    Rejection::new(
        StatusCode::CONFLICT,
        RemoteErrorKind::InsufficientStock,
        format!("only {} of {} available", item.stock, item.product_id),
    )
}

async fn fetch(State(state): State<Shared>, headers: HeaderMap) -> Reply {
    authorize(&state, &headers, "GET /cart".to_string())?;
    Ok(Json(lock(&state).collection()))
}

async fn add(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<AddLineRequest>) -> Reply {
    authorize(&state, &headers, format!("POST /cart {}", body.product_id))?;
    let mut guard = lock(&state);
    let item = catalog_item(&guard, &body.product_id)?;
    let key = LineKey::new(body.product_id.clone(), body.variant_index);

    let wanted = guard.quantity_of(&key).saturating_add(body.quantity);
    if wanted > item.stock {
        return Err(insufficient_stock(&item));
    }

    if let Some(existing) = guard.lines.iter_mut().find(|l| l.matches(&key)) {
        existing.quantity = wanted;
    } else {
        let line = guard.new_line(&item, body.variant_index, body.quantity);
        guard.lines.push(line);
    }
    debug!(line = %key, quantity = wanted, "Authority added");
    Ok(Json(guard.single(&key)))
}

async fn set_quantity(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(product_id): Path<String>,
    Json(body): Json<SetQuantityRequest>,
) -> Reply {
    authorize(&state, &headers, format!("PUT /cart/{product_id}"))?;
    let mut guard = lock(&state);
    let key = LineKey::new(product_id.as_str(), body.variant_index);
    let item = catalog_item(&guard, &key.product_id)?;

    if guard.quantity_of(&key) == 0 {
        return Err(Rejection::new(
            StatusCode::NOT_FOUND,
            RemoteErrorKind::NotFound,
            format!("{key} is not in the cart"),
        ));
    }
    if body.quantity > item.stock {
        return Err(insufficient_stock(&item));
    }

    if body.quantity == 0 {
        guard.lines.retain(|l| !l.matches(&key));
    } else if let Some(existing) = guard.lines.iter_mut().find(|l| l.matches(&key)) {
        existing.quantity = body.quantity;
    }
    Ok(Json(guard.single(&key)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariantQuery {
    #[serde(default)]
    variant_index: u32,
}

async fn remove(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(product_id): Path<String>,
    Query(query): Query<VariantQuery>,
) -> Reply {
    authorize(&state, &headers, format!("DELETE /cart/{product_id}"))?;
    let mut guard = lock(&state);
    let key = LineKey::new(product_id.as_str(), query.variant_index);

    if guard.quantity_of(&key) == 0 {
        return Err(Rejection::new(
            StatusCode::NOT_FOUND,
            RemoteErrorKind::NotFound,
            format!("{key} is not in the cart"),
        ));
    }
    guard.lines.retain(|l| !l.matches(&key));
    Ok(Json(guard.single(&key)))
}

async fn clear(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Reply {
    authorize(&state, &headers, "DELETE /cart".to_string())?;
    let options: ClearOptions = if body.is_empty() {
        ClearOptions::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            Rejection::new(StatusCode::BAD_REQUEST, RemoteErrorKind::Invalid, e.to_string())
        })?
    };
    let mut guard = lock(&state);
    guard.lines.clear();
    debug!(restock = options.restock, "Authority cleared cart");
    Ok(Json(guard.collection()))
}

async fn merge(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<MergeRequest>) -> Response {
    if let Err(rejection) = authorize(&state, &headers, "POST /cart/merge".to_string()) {
        return rejection.into_response();
    }
    let mut guard = lock(&state);
    if guard.fail_merge {
        return (StatusCode::SERVICE_UNAVAILABLE, "merge unavailable").into_response();
    }

    for guest in body.lines {
        let Some(item) = guard.catalog.get(&guest.product_id).cloned() else {
            continue;
        };
        let key = guest.key();
        let merged = guard
            .quantity_of(&key)
            .saturating_add(guest.quantity)
            .min(item.stock);
        if let Some(existing) = guard.lines.iter_mut().find(|l| l.matches(&key)) {
            existing.quantity = merged;
        } else if merged > 0 {
            let line = guard.new_line(&item, guest.variant_index, merged);
            guard.lines.push(line);
        }
    }
    Json(guard.collection()).into_response()
}

fn router(state: Shared) -> Router {
    Router::new()
        .route("/cart", get(fetch).post(add).delete(clear))
        .route("/cart/merge", post(merge))
        .route("/cart/{product_id}", put(set_quantity).delete(remove))
        .with_state(state)
}

/// A running mock authority. The server stops when this is dropped.
pub struct MockAuthority {
    base_url: Url,
    state: Shared,
    server: JoinHandle<()>,
}

impl MockAuthority {
    /// Start serving `catalog`, accepting `token` as the only credential.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if no local port can be bound.
    pub async fn start(token: &str, catalog: Vec<CatalogItem>) -> std::io::Result<Self> {
        let state = Arc::new(Mutex::new(AuthorityState {
            token: token.to_string(),
            catalog: catalog
                .into_iter()
                .map(|item| (item.product_id.clone(), item))
                .collect(),
            lines: Vec::new(),
            next_line: 0,
            removed: None,
            fail_merge: false,
            requests: Vec::new(),
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = router(Arc::clone(&state));
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let base_url = Url::parse(&format!("http://{addr}/"))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        Ok(Self {
            base_url,
            state,
            server,
        })
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Client settings for this authority with the given credential.
    #[must_use]
    pub fn remote_config(&self, token: &str) -> RemoteConfig {
        RemoteConfig {
            base_url: self.base_url.clone(),
            bearer_token: Some(SecretString::from(token.to_string())),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Replace the account cart. Each line is re-issued from the catalog.
    pub fn seed(&self, lines: &[(&str, u32)]) {
        let mut guard = lock(&self.state);
        guard.lines.clear();
        for (product, quantity) in lines {
            let Some(item) = guard.catalog.get(&ProductId::new(*product)).cloned() else {
                continue;
            };
            let line = guard.new_line(&item, 0, *quantity);
            guard.lines.push(line);
        }
    }

    /// The account cart as `(product, quantity)` pairs.
    #[must_use]
    pub fn quantities(&self) -> Vec<(String, u32)> {
        lock(&self.state)
            .lines
            .iter()
            .map(|l| (l.product_id.to_string(), l.quantity))
            .collect()
    }

    /// Drop `products` from the account cart and report them as one removal
    /// batch on every later read.
    pub fn expire(&self, batch_id: &str, products: &[&str]) {
        let mut guard = lock(&self.state);
        let (gone, kept): (Vec<CartLine>, Vec<CartLine>) = guard
            .lines
            .drain(..)
            .partition(|l| products.contains(&l.product_id.as_str()));
        guard.lines = kept;
        guard.removed = Some(RemovalBatch {
            batch_id: batch_id.to_string(),
            lines: gone,
        });
    }

    /// Make `POST /cart/merge` fail with 503.
    pub fn fail_merge(&self, fail: bool) {
        lock(&self.state).fail_merge = fail;
    }

    /// Requests served so far, e.g. `"PUT /cart/p1"`.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        lock(&self.state).requests.clone()
    }
}

impl Drop for MockAuthority {
    fn drop(&mut self) {
        self.server.abort();
    }
}
