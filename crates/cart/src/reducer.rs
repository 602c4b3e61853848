//! Pure state transitions over [`CartAggregate`].
//!
//! Every function here takes the current aggregate by reference and returns
//! a new one; none of them perform I/O. The coordinator is the only caller
//! that keeps the result, so swapping the store or testing a transition never
//! needs a runtime.
//!
//! After every transition `total == Σ(unit_price × quantity)` and
//! `count == Σ(quantity)` hold, and no two lines share a [`LineKey`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use naked_pineapple_core::{LineId, Price};
use tracing::{debug, warn};

use crate::model::{
    CartAggregate, CartLine, LineKey, OperationKind, PendingOperation, ProductSnapshot,
    RequestToken,
};
use crate::remote::CartResponse;

/// Outcome of a token-checked transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The token was current; here is the new aggregate.
    Applied(CartAggregate),
    /// The token was superseded; the aggregate is unchanged.
    Stale,
}

impl Transition {
    /// The new aggregate, or `None` for a stale response.
    #[must_use]
    pub fn applied(self) -> Option<CartAggregate> {
        match self {
            Self::Applied(cart) => Some(cart),
            Self::Stale => None,
        }
    }

    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }
}

/// An add-to-cart intent with the price and display data captured at the
/// moment of the add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddLine {
    pub key: LineKey,
    pub quantity: u32,
    pub unit_price: Price,
    pub product: ProductSnapshot,
    pub added_at: DateTime<Utc>,
}

impl AddLine {
    /// Capture an add intent now.
    #[must_use]
    pub fn new(key: LineKey, quantity: u32, unit_price: Price, product: ProductSnapshot) -> Self {
        Self {
            key,
            quantity,
            unit_price,
            product,
            added_at: Utc::now(),
        }
    }

    /// The provisional line this intent creates when the cart has none yet.
    fn into_line(self) -> CartLine {
        CartLine {
            line_id: LineId::provisional(),
            product_id: self.key.product_id,
            variant_index: self.key.variant_index,
            quantity: self.quantity,
            unit_price: self.unit_price,
            product_snapshot: self.product,
            added_at: self.added_at,
            is_provisional: true,
        }
    }
}

/// State of one line before a mutation, used to roll the mutation back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSnapshot {
    line: Option<CartLine>,
    position: Option<usize>,
}

impl LineSnapshot {
    /// Capture the current state of `key` in `cart` (possibly absent).
    #[must_use]
    pub fn capture(cart: &CartAggregate, key: &LineKey) -> Self {
        let position = cart.lines().iter().position(|l| l.matches(key));
        Self {
            line: position.and_then(|i| cart.lines().get(i).cloned()),
            position,
        }
    }

    /// Snapshot built from an authoritative line state, keeping the display
    /// position of `previous`.
    #[must_use]
    pub fn authoritative(line: Option<CartLine>, previous: &Self) -> Self {
        Self {
            line: line.map(|mut l| {
                l.is_provisional = false;
                l
            }),
            position: previous.position,
        }
    }

    /// The captured line, `None` if the line did not exist.
    #[must_use]
    pub const fn line(&self) -> Option<&CartLine> {
        self.line.as_ref()
    }
}

/// Record the outstanding mutation for `key`, replacing any earlier one.
#[must_use]
pub fn record_pending(cart: &CartAggregate, key: &LineKey, pending: PendingOperation) -> CartAggregate {
    let mut next = cart.clone();
    next.pending_mut().insert(key.clone(), pending);
    next
}

/// Optimistically add units of a product variant.
///
/// Increments an existing line or appends a new provisional line with a
/// temporary ID. Never rejects; stock is validated by the remote authority.
#[must_use]
pub fn apply_optimistic_add(cart: &CartAggregate, intent: &AddLine) -> CartAggregate {
    let mut next = cart.clone();
    if intent.quantity == 0 {
        return next;
    }
    match next.line_mut(&intent.key) {
        Some(line) => {
            line.quantity = line.quantity.saturating_add(intent.quantity);
            line.is_provisional = true;
        }
        None => next.lines_mut().push(intent.clone().into_line()),
    }
    next.recompute();
    next
}

/// Optimistically set a line's quantity; 0 removes the line.
///
/// Setting a quantity on a line that is not in the cart does nothing, since
/// no price snapshot exists for it.
#[must_use]
pub fn apply_optimistic_set_quantity(cart: &CartAggregate, key: &LineKey, quantity: u32) -> CartAggregate {
    if quantity == 0 {
        return apply_optimistic_remove(cart, key);
    }
    let mut next = cart.clone();
    if let Some(line) = next.line_mut(key) {
        line.quantity = quantity;
        line.is_provisional = true;
    }
    next.recompute();
    next
}

/// Optimistically delete a line. Deleting an absent line is a no-op.
#[must_use]
pub fn apply_optimistic_remove(cart: &CartAggregate, key: &LineKey) -> CartAggregate {
    let mut next = cart.clone();
    next.lines_mut().retain(|l| !l.matches(key));
    next.recompute();
    next
}

/// Optimistically empty the cart. Pending records are kept; the caller
/// fences every line before calling this.
#[must_use]
pub fn apply_optimistic_clear(cart: &CartAggregate) -> CartAggregate {
    let mut next = cart.clone();
    next.lines_mut().clear();
    next.recompute();
    next
}

/// Replace the provisional state of `key` with the authority's answer.
///
/// Returns [`Transition::Stale`] when `token` is not the current pending
/// token for `key`.
#[must_use]
pub fn reconcile(
    cart: &CartAggregate,
    key: &LineKey,
    token: RequestToken,
    response: &CartResponse,
) -> Transition {
    if !token_is_current(cart, key, token) {
        debug!(line = %key, token = %token, "Dropping stale response");
        return Transition::Stale;
    }

    let mut next = cart.clone();
    next.pending_mut().remove(key);

    match &response.lines {
        Some(lines) => adopt_collection(&mut next, lines),
        None => {
            let authoritative = response.authoritative_line(key).cloned();
            replace_line(&mut next, key, authoritative, None);
        }
    }

    adopt_server_totals(&mut next, response);
    Transition::Applied(next)
}

/// Restore `key` to its state before the rejected mutation.
///
/// Returns [`Transition::Stale`] when `token` is not the current pending
/// token for `key`.
#[must_use]
pub fn rollback(
    cart: &CartAggregate,
    key: &LineKey,
    token: RequestToken,
    snapshot: &LineSnapshot,
) -> Transition {
    if !token_is_current(cart, key, token) {
        debug!(line = %key, token = %token, "Dropping stale rejection");
        return Transition::Stale;
    }

    let mut next = cart.clone();
    next.pending_mut().remove(key);
    replace_line(&mut next, key, snapshot.line.clone(), snapshot.position);
    next.recompute();
    Transition::Applied(next)
}

/// Replace the whole line set with an authoritative read.
///
/// Lines whose keys still have a pending mutation keep their local state so
/// a read never clobbers an in-flight optimistic edit. Marks the aggregate
/// hydrated.
#[must_use]
pub fn hydrate(cart: &CartAggregate, response: &CartResponse) -> CartAggregate {
    let mut next = cart.clone();
    if let Some(lines) = &response.lines {
        adopt_collection(&mut next, lines);
        adopt_server_totals(&mut next, response);
    } else {
        next.recompute();
    }
    next.set_hydrated(true);
    next
}

/// Treat every line as confirmed. Used for guest carts, where local storage
/// is the only authority.
#[must_use]
pub fn confirm_local(cart: &CartAggregate) -> CartAggregate {
    let mut next = cart.clone();
    for line in next.lines_mut() {
        line.is_provisional = false;
    }
    next.pending_mut().clear();
    next
}

/// Drop every pending record without touching lines.
#[must_use]
pub fn clear_pending(cart: &CartAggregate) -> CartAggregate {
    let mut next = cart.clone();
    next.pending_mut().clear();
    next
}

/// Whether `token` is the outstanding token for `key`.
#[must_use]
pub fn token_is_current(cart: &CartAggregate, key: &LineKey, token: RequestToken) -> bool {
    cart.pending(key).is_some_and(|p| p.request_token == token)
}

/// Pending record for a new mutation.
#[must_use]
pub const fn pending(kind: OperationKind, token: RequestToken, target_quantity: Option<u32>) -> PendingOperation {
    PendingOperation {
        operation_kind: kind,
        request_token: token,
        target_quantity,
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Put `line` (or its absence) in place of `key`.
///
/// An existing line is replaced in place; a new one goes to `position` when
/// given, else to the end.
fn replace_line(cart: &mut CartAggregate, key: &LineKey, line: Option<CartLine>, position: Option<usize>) {
    let existing = cart.lines().iter().position(|l| l.matches(key));
    match (existing, line) {
        (Some(i), Some(mut line)) => {
            line.is_provisional = false;
            if let Some(slot) = cart.lines_mut().get_mut(i) {
                *slot = line;
            }
        }
        (Some(i), None) => {
            cart.lines_mut().remove(i);
        }
        (None, Some(mut line)) => {
            line.is_provisional = false;
            let lines = cart.lines_mut();
            let at = position.unwrap_or(lines.len()).min(lines.len());
            lines.insert(at, line);
        }
        (None, None) => {}
    }
}

/// Take the server's line collection, keeping local state for keys that
/// still have a pending mutation.
fn adopt_collection(cart: &mut CartAggregate, server_lines: &[CartLine]) {
    let pending: BTreeSet<LineKey> = cart.pending_by_product().keys().cloned().collect();
    let local = std::mem::take(cart.lines_mut());
    let mut merged: Vec<CartLine> = Vec::with_capacity(server_lines.len());

    for server in server_lines {
        let key = server.key();
        if merged.iter().any(|l| l.matches(&key)) {
            continue;
        }
        if pending.contains(&key) {
            if let Some(local_line) = local.iter().find(|l| l.matches(&key)) {
                merged.push(local_line.clone());
            }
        } else {
            let mut line = server.clone();
            line.is_provisional = false;
            merged.push(line);
        }
    }

    for local_line in local {
        let key = local_line.key();
        if pending.contains(&key) && !merged.iter().any(|l| l.matches(&key)) {
            merged.push(local_line);
        }
    }

    *cart.lines_mut() = merged;
}

/// Recompute totals, then adopt the server's totals if they agree.
///
/// Server totals that disagree with the line collection are ignored so the
/// totals invariant holds even when the authority is inconsistent.
fn adopt_server_totals(cart: &mut CartAggregate, response: &CartResponse) {
    cart.recompute();

    let agrees = response
        .total
        .is_none_or(|t| t.amount == cart.total().amount)
        && response.count.is_none_or(|c| c == cart.count());

    if !agrees {
        if cart.has_pending() {
            debug!("Server totals differ while other edits are in flight; using local totals");
        } else {
            warn!(
                server_total = ?response.total.map(|t| t.amount),
                server_count = ?response.count,
                local_total = %cart.total().amount,
                local_count = cart.count(),
                "Server totals disagree with line collection; using recomputed totals"
            );
        }
        return;
    }

    if let Some(total) = response.total {
        cart.set_totals(total, cart.count());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use naked_pineapple_core::CurrencyCode;
    use proptest::prelude::*;

    use super::*;
    use crate::model::fixtures::{line, price};

    fn add(product: &str, quantity: u32, unit: i64) -> AddLine {
        AddLine::new(
            LineKey::product(product),
            quantity,
            price(unit),
            ProductSnapshot::named(product),
        )
    }

    fn with_pending(cart: &CartAggregate, product: &str, token: u64) -> CartAggregate {
        record_pending(
            cart,
            &LineKey::product(product),
            pending(OperationKind::SetQuantity, RequestToken::new(token), None),
        )
    }

    #[test]
    fn test_add_twice_merges_into_one_line() {
        let cart = CartAggregate::default();
        let cart = apply_optimistic_add(&cart, &add("p1", 1, 10));
        let cart = apply_optimistic_add(&cart, &add("p1", 2, 10));

        assert_eq!(cart.lines().len(), 1);
        assert_eq!(cart.lines()[0].quantity, 3);
        assert_eq!(cart.total(), price(30));
        assert_eq!(cart.count(), 3);
        assert!(cart.lines()[0].is_provisional);
        assert!(cart.lines()[0].line_id.is_provisional());
    }

    #[test]
    fn test_count_does_not_overflow_with_huge_quantities() {
        let cart = apply_optimistic_add(&CartAggregate::default(), &add("p1", u32::MAX, 1));
        let cart = apply_optimistic_add(&cart, &add("p2", 1, 1));
        let cart = apply_optimistic_add(&cart, &add("p1", 5, 1));

        assert_eq!(cart.line(&LineKey::product("p1")).unwrap().quantity, u32::MAX);
        assert_eq!(cart.count(), u64::from(u32::MAX) + 1);
        assert!(cart.is_consistent());
    }

    #[test]
    fn test_add_zero_is_noop() {
        let cart = CartAggregate::from_lines([line("p1", 1, 10)], CurrencyCode::USD);
        assert_eq!(apply_optimistic_add(&cart, &add("p1", 0, 10)), cart);
    }

    #[test]
    fn test_variants_are_separate_lines() {
        let cart = CartAggregate::default();
        let cart = apply_optimistic_add(&cart, &add("p1", 1, 10));
        let mut other_variant = add("p1", 1, 12);
        other_variant.key = LineKey::new("p1", 1);
        let cart = apply_optimistic_add(&cart, &other_variant);
        assert_eq!(cart.lines().len(), 2);
        assert_eq!(cart.total(), price(22));
    }

    #[test]
    fn test_set_quantity_zero_removes_line() {
        let cart = CartAggregate::from_lines([line("p1", 4, 10), line("p2", 1, 5)], CurrencyCode::USD);
        let next = apply_optimistic_set_quantity(&cart, &LineKey::product("p1"), 0);
        assert!(next.line(&LineKey::product("p1")).is_none());
        assert_eq!(next.count(), cart.count() - 4);
        assert!(next.is_consistent());
    }

    #[test]
    fn test_set_quantity_on_absent_line_is_noop() {
        let cart = CartAggregate::from_lines([line("p2", 1, 5)], CurrencyCode::USD);
        assert_eq!(apply_optimistic_set_quantity(&cart, &LineKey::product("p1"), 3), cart);
    }

    #[test]
    fn test_remove_absent_line_is_idempotent() {
        let cart = CartAggregate::from_lines([line("p2", 1, 5)], CurrencyCode::USD);
        assert_eq!(apply_optimistic_remove(&cart, &LineKey::product("p1")), cart);
    }

    #[test]
    fn test_reconcile_with_superseded_token_is_stale() {
        let cart = CartAggregate::from_lines([line("p1", 2, 10)], CurrencyCode::USD);
        let cart = with_pending(&cart, "p1", 2);
        let response = CartResponse::single(Some(line("p1", 9, 10)), price(90), 9);
        assert!(reconcile(&cart, &LineKey::product("p1"), RequestToken::new(1), &response).is_stale());
    }

    #[test]
    fn test_reconcile_without_pending_is_stale() {
        let cart = CartAggregate::from_lines([line("p1", 2, 10)], CurrencyCode::USD);
        let response = CartResponse::single(Some(line("p1", 9, 10)), price(90), 9);
        assert!(reconcile(&cart, &LineKey::product("p1"), RequestToken::new(1), &response).is_stale());
    }

    #[test]
    fn test_reconcile_single_line_replaces_provisional() {
        let cart = apply_optimistic_add(&CartAggregate::default(), &add("p1", 2, 10));
        let cart = with_pending(&cart, "p1", 1);
        let mut server = line("p1", 2, 10);
        server.line_id = LineId::new("srv-1");
        let response = CartResponse::single(Some(server), price(20), 2);

        let next = reconcile(&cart, &LineKey::product("p1"), RequestToken::new(1), &response)
            .applied()
            .unwrap();

        assert_eq!(next.lines()[0].line_id.as_str(), "srv-1");
        assert!(!next.lines()[0].is_provisional);
        assert!(next.pending(&LineKey::product("p1")).is_none());
        assert!(next.is_consistent());
    }

    #[test]
    fn test_reconcile_removal() {
        let cart = CartAggregate::from_lines([line("p1", 2, 10)], CurrencyCode::USD);
        let cart = with_pending(&cart, "p1", 1);
        let response = CartResponse::single(None, price(0), 0);
        let next = reconcile(&cart, &LineKey::product("p1"), RequestToken::new(1), &response)
            .applied()
            .unwrap();
        assert!(next.is_empty());
        assert_eq!(next.count(), 0);
    }

    #[test]
    fn test_reconcile_collection_keeps_other_pending_lines() {
        // p1 is being reconciled, p2 has its own edit in flight.
        let cart = CartAggregate::from_lines([line("p1", 1, 10), line("p2", 5, 3)], CurrencyCode::USD);
        let cart = with_pending(&cart, "p1", 1);
        let cart = with_pending(&cart, "p2", 1);

        let response = CartResponse::collection(
            vec![line("p1", 2, 10), line("p2", 1, 3), line("p3", 1, 7)],
            price(30),
            4,
        );
        let next = reconcile(&cart, &LineKey::product("p1"), RequestToken::new(1), &response)
            .applied()
            .unwrap();

        assert_eq!(next.line(&LineKey::product("p1")).unwrap().quantity, 2);
        assert_eq!(next.line(&LineKey::product("p2")).unwrap().quantity, 5);
        assert!(next.line(&LineKey::product("p3")).is_some());
        assert!(next.pending(&LineKey::product("p2")).is_some());
        // Local totals win because p2's local state differs from the server's
        assert_eq!(next.total(), price(42));
        assert!(next.is_consistent());
    }

    #[test]
    fn test_reconcile_ignores_inconsistent_server_totals() {
        let cart = CartAggregate::from_lines([line("p1", 1, 10)], CurrencyCode::USD);
        let cart = with_pending(&cart, "p1", 1);
        let response = CartResponse::single(Some(line("p1", 2, 10)), price(999), 7);
        let next = reconcile(&cart, &LineKey::product("p1"), RequestToken::new(1), &response)
            .applied()
            .unwrap();
        assert_eq!(next.total(), price(20));
        assert_eq!(next.count(), 2);
    }

    #[test]
    fn test_rollback_restores_exact_state() {
        let before = CartAggregate::from_lines([line("p2", 1, 5)], CurrencyCode::USD);
        let key = LineKey::product("p1");
        let snapshot = LineSnapshot::capture(&before, &key);
        let token = RequestToken::new(1);

        let cart = record_pending(&before, &key, pending(OperationKind::Add, token, Some(3)));
        let cart = apply_optimistic_add(&cart, &add("p1", 3, 10));
        assert_eq!(cart.count(), 4);

        let restored = rollback(&cart, &key, token, &snapshot).applied().unwrap();
        assert_eq!(restored, before);
    }

    #[test]
    fn test_rollback_restores_removed_line_in_place() {
        let before = CartAggregate::from_lines(
            [line("p1", 1, 10), line("p2", 2, 5), line("p3", 1, 1)],
            CurrencyCode::USD,
        );
        let key = LineKey::product("p2");
        let snapshot = LineSnapshot::capture(&before, &key);
        let token = RequestToken::new(4);

        let cart = record_pending(&before, &key, pending(OperationKind::Remove, token, None));
        let cart = apply_optimistic_remove(&cart, &key);
        let restored = rollback(&cart, &key, token, &snapshot).applied().unwrap();
        assert_eq!(restored, before);
    }

    #[test]
    fn test_rollback_with_superseded_token_is_stale() {
        let cart = CartAggregate::from_lines([line("p1", 1, 10)], CurrencyCode::USD);
        let cart = with_pending(&cart, "p1", 3);
        let snapshot = LineSnapshot::capture(&cart, &LineKey::product("p1"));
        assert!(rollback(&cart, &LineKey::product("p1"), RequestToken::new(2), &snapshot).is_stale());
    }

    #[test]
    fn test_hydrate_marks_hydrated_and_preserves_pending() {
        let cart = CartAggregate::from_lines([line("p1", 3, 10)], CurrencyCode::USD);
        let cart = with_pending(&cart, "p1", 1);
        let response = CartResponse::collection(vec![line("p1", 1, 10), line("p2", 2, 5)], price(20), 3);
        let next = hydrate(&cart, &response);
        assert!(next.is_hydrated());
        assert_eq!(next.line(&LineKey::product("p1")).unwrap().quantity, 3);
        assert_eq!(next.line(&LineKey::product("p2")).unwrap().quantity, 2);
        assert!(next.is_consistent());
    }

    #[test]
    fn test_hydrate_drops_duplicate_server_lines() {
        let response = CartResponse::collection(vec![line("p1", 1, 10), line("p1", 4, 10)], price(10), 1);
        let next = hydrate(&CartAggregate::default(), &response);
        assert_eq!(next.lines().len(), 1);
        assert!(next.is_consistent());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u32),
        Set(u8, u32),
        Remove(u8),
        Clear,
        Reconcile(u8, u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 0u32..6).prop_map(|(p, q)| Op::Add(p, q)),
            (0u8..4, 0u32..6).prop_map(|(p, q)| Op::Set(p, q)),
            (0u8..4).prop_map(Op::Remove),
            Just(Op::Clear),
            (0u8..4, 0u32..6).prop_map(|(p, q)| Op::Reconcile(p, q)),
        ]
    }

    proptest! {
        #[test]
        fn prop_totals_always_match_lines(ops in prop::collection::vec(op(), 0..40)) {
            let mut cart = CartAggregate::default();
            for op in ops {
                cart = match op {
                    Op::Add(p, q) => apply_optimistic_add(&cart, &add(&format!("p{p}"), q, i64::from(p) + 1)),
                    Op::Set(p, q) => apply_optimistic_set_quantity(&cart, &LineKey::product(format!("p{p}")), q),
                    Op::Remove(p) => apply_optimistic_remove(&cart, &LineKey::product(format!("p{p}"))),
                    Op::Clear => apply_optimistic_clear(&cart),
                    Op::Reconcile(p, q) => {
                        let key = LineKey::product(format!("p{p}"));
                        let fenced = record_pending(&cart, &key, pending(OperationKind::SetQuantity, RequestToken::new(1), Some(q)));
                        let server = (q > 0).then(|| line(&format!("p{p}"), q, i64::from(p) + 1));
                        let response = CartResponse::single(server, price(0), 0);
                        reconcile(&fenced, &key, RequestToken::new(1), &response).applied().unwrap_or(fenced)
                    }
                };
                prop_assert!(cart.is_consistent());
            }
        }
    }
}
