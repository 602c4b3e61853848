//! Cart data model.
//!
//! [`CartAggregate`] is the single value the engine shows to the UI. Its
//! `total` and `count` are derived from `lines` and are kept in step by the
//! reducer; nothing outside this crate can set them directly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use naked_pineapple_core::{CurrencyCode, LineId, Price, ProductId, StockStatus};
use serde::{Deserialize, Serialize};

/// Identity of a cart line: a product plus one purchasable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineKey {
    pub product_id: ProductId,
    pub variant_index: u32,
}

impl LineKey {
    /// Key for a specific variant of a product.
    #[must_use]
    pub fn new(product_id: impl Into<ProductId>, variant_index: u32) -> Self {
        Self {
            product_id: product_id.into(),
            variant_index,
        }
    }

    /// Key for a product's default (first) variant.
    #[must_use]
    pub fn product(product_id: impl Into<ProductId>) -> Self {
        Self::new(product_id, 0)
    }
}

impl std::fmt::Display for LineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.product_id, self.variant_index)
    }
}

/// Denormalized display data captured when a line is added or refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Maximum purchasable quantity, when the catalog tracks stock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_limit: Option<u32>,
    #[serde(default)]
    pub stock_status: StockStatus,
}

impl ProductSnapshot {
    /// Snapshot with only a display name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Whether the variant was purchasable when captured.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.stock_status.is_available()
    }
}

/// One product+variant combination in the cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub line_id: LineId,
    pub product_id: ProductId,
    #[serde(default)]
    pub variant_index: u32,
    pub quantity: u32,
    /// Price at the time the line was added.
    pub unit_price: Price,
    #[serde(default)]
    pub product_snapshot: ProductSnapshot,
    pub added_at: DateTime<Utc>,
    /// Set while an optimistic edit to this line awaits confirmation.
    #[serde(default)]
    pub is_provisional: bool,
}

impl CartLine {
    /// Identity of this line.
    #[must_use]
    pub fn key(&self) -> LineKey {
        LineKey::new(self.product_id.clone(), self.variant_index)
    }

    /// Whether this line has the given identity.
    #[must_use]
    pub fn matches(&self, key: &LineKey) -> bool {
        self.product_id == key.product_id && self.variant_index == key.variant_index
    }

    /// `unit_price × quantity`.
    #[must_use]
    pub fn line_total(&self) -> Price {
        self.unit_price.times(self.quantity)
    }
}

/// Kind of mutation a pending record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Add,
    SetQuantity,
    Remove,
    Clear,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::SetQuantity => write!(f, "set_quantity"),
            Self::Remove => write!(f, "remove"),
            Self::Clear => write!(f, "clear"),
        }
    }
}

/// Per-line fencing token. Larger tokens supersede smaller ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestToken(u64);

impl RequestToken {
    /// Create a token from its raw sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// The raw sequence number.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The token that follows this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for RequestToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The single outstanding mutation for a line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub operation_kind: OperationKind,
    pub request_token: RequestToken,
    /// Line quantity once the mutation lands; 0 for removals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_quantity: Option<u32>,
}

/// The full cart as shown to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartAggregate {
    lines: Vec<CartLine>,
    total: Price,
    count: u64,
    /// Session-local; never persisted or sent over the wire.
    #[serde(skip)]
    pending_by_product: BTreeMap<LineKey, PendingOperation>,
    #[serde(default)]
    is_hydrated: bool,
    #[serde(default)]
    currency_code: CurrencyCode,
}

impl Default for CartAggregate {
    fn default() -> Self {
        Self::empty(CurrencyCode::default())
    }
}

impl CartAggregate {
    /// An empty, not yet hydrated cart.
    #[must_use]
    pub fn empty(currency_code: CurrencyCode) -> Self {
        Self {
            lines: Vec::new(),
            total: Price::zero(currency_code),
            count: 0,
            pending_by_product: BTreeMap::new(),
            is_hydrated: false,
            currency_code,
        }
    }

    /// Build a cart from a line collection, computing totals.
    ///
    /// Lines with quantity 0 are dropped and duplicate keys are folded into
    /// the first occurrence, so the result always satisfies the line
    /// uniqueness invariant.
    #[must_use]
    pub fn from_lines(lines: impl IntoIterator<Item = CartLine>, currency_code: CurrencyCode) -> Self {
        let mut cart = Self::empty(currency_code);
        for line in lines {
            if line.quantity == 0 {
                continue;
            }
            if let Some(existing) = cart.lines.iter_mut().find(|l| l.matches(&line.key())) {
                existing.quantity = existing.quantity.saturating_add(line.quantity);
            } else {
                cart.lines.push(line);
            }
        }
        cart.recompute();
        cart
    }

    /// Lines in display order.
    #[must_use]
    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    /// `Σ(unit_price × quantity)`.
    #[must_use]
    pub const fn total(&self) -> Price {
        self.total
    }

    /// `Σ(quantity)`, widened so many large lines cannot overflow it.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Whether the cart has been loaded from the remote authority this session.
    #[must_use]
    pub const fn is_hydrated(&self) -> bool {
        self.is_hydrated
    }

    #[must_use]
    pub const fn currency_code(&self) -> CurrencyCode {
        self.currency_code
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Find the line for a key.
    #[must_use]
    pub fn line(&self, key: &LineKey) -> Option<&CartLine> {
        self.lines.iter().find(|l| l.matches(key))
    }

    /// Outstanding mutations keyed by line.
    #[must_use]
    pub const fn pending_by_product(&self) -> &BTreeMap<LineKey, PendingOperation> {
        &self.pending_by_product
    }

    /// The outstanding mutation for a line, if any.
    #[must_use]
    pub fn pending(&self, key: &LineKey) -> Option<&PendingOperation> {
        self.pending_by_product.get(key)
    }

    /// Whether any mutation awaits a response.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending_by_product.is_empty()
    }

    /// Whether `total` and `count` agree with the line collection and no two
    /// lines share a key.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let expected_total = Price::sum(self.lines.iter().map(CartLine::line_total), self.currency_code);
        let expected_count: u64 = self.lines.iter().map(|l| u64::from(l.quantity)).sum();
        let mut keys: Vec<LineKey> = self.lines.iter().map(CartLine::key).collect();
        keys.sort();
        keys.dedup();
        self.total.amount == expected_total.amount
            && self.count == expected_count
            && keys.len() == self.lines.len()
            && self.lines.iter().all(|l| l.quantity > 0)
    }

    // Mutation helpers used by the reducer and the fencing tracker.

    pub(crate) fn lines_mut(&mut self) -> &mut Vec<CartLine> {
        &mut self.lines
    }

    pub(crate) fn line_mut(&mut self, key: &LineKey) -> Option<&mut CartLine> {
        self.lines.iter_mut().find(|l| l.matches(key))
    }

    pub(crate) fn pending_mut(&mut self) -> &mut BTreeMap<LineKey, PendingOperation> {
        &mut self.pending_by_product
    }

    pub(crate) const fn set_hydrated(&mut self, hydrated: bool) {
        self.is_hydrated = hydrated;
    }

    pub(crate) const fn set_totals(&mut self, total: Price, count: u64) {
        self.currency_code = total.currency_code;
        self.total = total;
        self.count = count;
    }

    /// Recompute `total`/`count` from the lines, dropping zero-quantity lines.
    pub(crate) fn recompute(&mut self) {
        self.lines.retain(|l| l.quantity > 0);
        if let Some(first) = self.lines.first() {
            self.currency_code = first.unit_price.currency_code;
        }
        self.total = Price::sum(self.lines.iter().map(CartLine::line_total), self.currency_code);
        self.count = self.lines.iter().map(|l| u64::from(l.quantity)).sum();
    }
}

/// A batch of lines the remote authority removed on its own (e.g. an expired
/// stock reservation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalBatch {
    pub batch_id: String,
    pub lines: Vec<CartLine>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    use super::*;

    pub fn price(whole: i64) -> Price {
        Price::new(Decimal::new(whole, 0), CurrencyCode::USD)
    }

    pub fn line(product: &str, quantity: u32, unit: i64) -> CartLine {
        CartLine {
            line_id: LineId::new(format!("line-{product}")),
            product_id: ProductId::new(product),
            variant_index: 0,
            quantity,
            unit_price: price(unit),
            product_snapshot: ProductSnapshot::named(product),
            added_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            is_provisional: false,
        }
    }
}
