//! Per-line request fencing.
//!
//! Every mutation on a line gets a strictly increasing [`RequestToken`]. Only
//! the response carrying the line's current token may change the cart; older
//! responses are stale and dropped. Tokens are never reused, even across
//! session changes.
//!
//! The tracker also keeps, per line, one rollback entry for every mutation
//! that may still be answered: the line as it was just before that mutation
//! and the pending record it carried. Rejecting the newest mutation restores
//! its own snapshot and hands the line back to the previous one, so a late
//! answer to an earlier request still lands. Debounced edits that were never
//! sent collapse into the edit that replaces them.

use std::collections::HashMap;

use tracing::debug;

use crate::model::{CartAggregate, LineKey, OperationKind, PendingOperation, RequestToken};
use crate::reducer::{self, LineSnapshot, Transition};
use crate::remote::CartResponse;

#[derive(Debug, Clone)]
struct Outstanding {
    pending: PendingOperation,
    before: LineSnapshot,
    sent: bool,
}

#[derive(Debug, Default)]
pub struct FencingTracker {
    issued: HashMap<LineKey, RequestToken>,
    /// Oldest first; the last entry matches the aggregate's pending record.
    outstanding: HashMap<LineKey, Vec<Outstanding>>,
}

impl FencingTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a mutation on `key`.
    ///
    /// Must be called before the optimistic change is applied so the rollback
    /// snapshot captures the line as the user saw it. Returns the cart with
    /// the new pending record and the token the request must carry.
    pub fn begin(
        &mut self,
        cart: &CartAggregate,
        key: &LineKey,
        kind: OperationKind,
        target_quantity: Option<u32>,
    ) -> (CartAggregate, RequestToken) {
        let token = self
            .issued
            .get(key)
            .map_or(RequestToken::new(1), RequestToken::next);
        self.issued.insert(key.clone(), token);

        let entries = self.outstanding.entry(key.clone()).or_default();
        if cart.pending(key).is_none() {
            entries.clear();
        }
        // An unsent edit never reached the authority
        let replaces_unsent = entries.last().is_some_and(|e| !e.sent);
        let before = replaces_unsent
            .then(|| entries.pop())
            .flatten()
            .map_or_else(|| LineSnapshot::capture(cart, key), |e| e.before);

        let pending = reducer::pending(kind, token, target_quantity);
        entries.push(Outstanding {
            pending: pending.clone(),
            before,
            sent: false,
        });

        let next = reducer::record_pending(cart, key, pending);
        debug!(line = %key, token = %token, kind = %kind, "Fenced mutation");
        (next, token)
    }

    /// Mark `(key, token)` as sent to the authority.
    pub fn sent(&mut self, key: &LineKey, token: RequestToken) {
        if let Some(entry) = self
            .outstanding
            .get_mut(key)
            .and_then(|entries| entries.iter_mut().find(|e| e.pending.request_token == token))
        {
            entry.sent = true;
        }
    }

    /// The most recent token issued for `key`, if any.
    #[must_use]
    pub fn latest(&self, key: &LineKey) -> Option<RequestToken> {
        self.issued.get(key).copied()
    }

    /// Whether `token` is still the one that may change `key`.
    #[must_use]
    pub fn is_current(&self, cart: &CartAggregate, key: &LineKey, token: RequestToken) -> bool {
        self.latest(key) == Some(token) && reducer::token_is_current(cart, key, token)
    }

    /// The snapshot a rejection of the current mutation on `key` would
    /// restore.
    #[must_use]
    pub fn snapshot(&self, key: &LineKey) -> Option<&LineSnapshot> {
        self.outstanding
            .get(key)
            .and_then(|entries| entries.last())
            .map(|e| &e.before)
    }

    /// Apply a successful response for `(key, token)`.
    ///
    /// A stale success leaves the cart alone but becomes the rollback state
    /// of the next newer mutation, since the authority has applied it.
    pub fn accept(
        &mut self,
        cart: &CartAggregate,
        key: &LineKey,
        token: RequestToken,
        response: &CartResponse,
    ) -> Transition {
        let transition = reducer::reconcile(cart, key, token, response);
        match &transition {
            Transition::Applied(next) => self.settle(next, key),
            Transition::Stale => {
                if let Some(entries) = self.outstanding.get_mut(key)
                    && let Some(i) = entries.iter().position(|e| e.pending.request_token == token)
                {
                    let applied: Vec<Outstanding> = entries.drain(..=i).collect();
                    if let (Some(done), Some(newer)) = (applied.last(), entries.first_mut()) {
                        newer.before = LineSnapshot::authoritative(
                            response.authoritative_line(key).cloned(),
                            &done.before,
                        );
                    }
                }
            }
        }
        transition
    }

    /// Roll back a rejected `(key, token)`.
    ///
    /// The current mutation restores the line as it was just before it and
    /// leaves the previous outstanding mutation pending. A stale rejection
    /// changes nothing visible; the next newer mutation inherits its
    /// snapshot, since the authority never applied it.
    pub fn reject(&mut self, cart: &CartAggregate, key: &LineKey, token: RequestToken) -> Transition {
        let Some(entries) = self.outstanding.get_mut(key) else {
            return Transition::Stale;
        };
        let Some(i) = entries.iter().position(|e| e.pending.request_token == token) else {
            return Transition::Stale;
        };

        if !reducer::token_is_current(cart, key, token) {
            let failed = entries.remove(i);
            if let Some(newer) = entries.get_mut(i) {
                newer.before = failed.before;
            }
            return Transition::Stale;
        }

        let failed = entries.remove(i);
        let previous = entries.last().map(|e| e.pending.clone());
        let next = match reducer::rollback(cart, key, token, &failed.before) {
            Transition::Applied(next) => next,
            Transition::Stale => return Transition::Stale,
        };
        match previous {
            Some(previous) => {
                debug!(line = %key, token = %previous.request_token, "Earlier mutation pending again");
                Transition::Applied(reducer::record_pending(&next, key, previous))
            }
            None => {
                self.settle(&next, key);
                Transition::Applied(next)
            }
        }
    }

    /// Forget the rollback entries for `key` once nothing is pending on it.
    fn settle(&mut self, cart: &CartAggregate, key: &LineKey) {
        if cart.pending(key).is_none() {
            self.outstanding.remove(key);
        }
    }

    /// Abandon every outstanding mutation.
    ///
    /// Issued tokens stay on record so responses still in flight compare as
    /// stale.
    pub fn abort_all(&mut self, cart: &CartAggregate) -> CartAggregate {
        self.outstanding.clear();
        reducer::clear_pending(cart)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use naked_pineapple_core::CurrencyCode;

    use super::*;
    use crate::model::fixtures::{line, price};
    use crate::model::ProductSnapshot;
    use crate::reducer::{AddLine, apply_optimistic_add, apply_optimistic_remove, apply_optimistic_set_quantity};

    fn cart() -> CartAggregate {
        CartAggregate::from_lines([line("p1", 1, 10)], CurrencyCode::USD)
    }

    #[test]
    fn test_tokens_increase_per_line() {
        let mut tracker = FencingTracker::new();
        let key = LineKey::product("p1");
        let other = LineKey::product("p2");

        let (c, t1) = tracker.begin(&cart(), &key, OperationKind::SetQuantity, Some(2));
        let (c, t2) = tracker.begin(&c, &key, OperationKind::SetQuantity, Some(3));
        let (_, o1) = tracker.begin(&c, &other, OperationKind::Add, Some(1));

        assert!(t2 > t1);
        assert_eq!(o1, RequestToken::new(1));
        assert_eq!(tracker.latest(&key), Some(t2));
    }

    #[test]
    fn test_older_response_is_stale_after_newer_accepted() {
        let mut tracker = FencingTracker::new();
        let key = LineKey::product("p1");

        let (c, t1) = tracker.begin(&cart(), &key, OperationKind::SetQuantity, Some(2));
        let c = apply_optimistic_set_quantity(&c, &key, 2);
        let (c, t2) = tracker.begin(&c, &key, OperationKind::SetQuantity, Some(3));
        let c = apply_optimistic_set_quantity(&c, &key, 3);

        let newer = CartResponse::single(Some(line("p1", 3, 10)), price(30), 3);
        let c = tracker.accept(&c, &key, t2, &newer).applied().unwrap();
        assert_eq!(c.count(), 3);

        let older = CartResponse::single(Some(line("p1", 2, 10)), price(20), 2);
        assert!(tracker.accept(&c, &key, t1, &older).is_stale());
        assert!(!tracker.is_current(&c, &key, t1));
    }

    #[test]
    fn test_unsent_edit_collapses_into_its_replacement() {
        let mut tracker = FencingTracker::new();
        let key = LineKey::product("p1");
        let before = cart();

        let (c, _t1) = tracker.begin(&before, &key, OperationKind::SetQuantity, Some(2));
        let c = apply_optimistic_set_quantity(&c, &key, 2);
        let (c, t2) = tracker.begin(&c, &key, OperationKind::SetQuantity, Some(9));
        let c = apply_optimistic_set_quantity(&c, &key, 9);
        tracker.sent(&key, t2);

        let restored = tracker.reject(&c, &key, t2).applied().unwrap();
        assert_eq!(restored, before);
        assert!(tracker.snapshot(&key).is_none());
    }

    #[test]
    fn test_reject_restores_state_before_the_rejected_edit() {
        let mut tracker = FencingTracker::new();
        let key = LineKey::product("p1");

        let (c, t1) = tracker.begin(&cart(), &key, OperationKind::Remove, Some(0));
        tracker.sent(&key, t1);
        let c = apply_optimistic_remove(&c, &key);
        let (c, t2) = tracker.begin(&c, &key, OperationKind::Add, Some(3));
        tracker.sent(&key, t2);
        let c = apply_optimistic_add(&c, &AddLine::new(key.clone(), 3, price(10), ProductSnapshot::named("p1")));

        let c = tracker.reject(&c, &key, t2).applied().unwrap();
        assert!(c.line(&key).is_none());
        assert_eq!(c.pending(&key).map(|p| p.request_token), Some(t1));

        // The remove is answered after all
        let removed = CartResponse::single(None, price(0), 0);
        let c = tracker.accept(&c, &key, t1, &removed).applied().unwrap();
        assert!(c.line(&key).is_none());
        assert!(!c.has_pending());
        assert!(tracker.snapshot(&key).is_none());
    }

    #[test]
    fn test_earlier_edit_rejected_after_newer_rejection_restores_original() {
        let mut tracker = FencingTracker::new();
        let key = LineKey::product("p1");
        let before = cart();

        let (c, t1) = tracker.begin(&before, &key, OperationKind::Remove, Some(0));
        tracker.sent(&key, t1);
        let c = apply_optimistic_remove(&c, &key);
        let (c, t2) = tracker.begin(&c, &key, OperationKind::Add, Some(3));
        tracker.sent(&key, t2);
        let c = apply_optimistic_add(&c, &AddLine::new(key.clone(), 3, price(10), ProductSnapshot::named("p1")));

        let c = tracker.reject(&c, &key, t2).applied().unwrap();
        let c = tracker.reject(&c, &key, t1).applied().unwrap();
        assert_eq!(c, before);
    }

    #[test]
    fn test_stale_rejection_passes_its_snapshot_on() {
        let mut tracker = FencingTracker::new();
        let key = LineKey::product("p1");
        let before = cart();

        let (c, t1) = tracker.begin(&before, &key, OperationKind::SetQuantity, Some(4));
        tracker.sent(&key, t1);
        let c = apply_optimistic_set_quantity(&c, &key, 4);
        let (c, t2) = tracker.begin(&c, &key, OperationKind::SetQuantity, Some(2));
        tracker.sent(&key, t2);
        let c = apply_optimistic_set_quantity(&c, &key, 2);

        assert!(tracker.reject(&c, &key, t1).is_stale());
        let restored = tracker.reject(&c, &key, t2).applied().unwrap();
        assert_eq!(restored, before);
    }

    #[test]
    fn test_stale_success_refreshes_rollback_snapshot() {
        let mut tracker = FencingTracker::new();
        let key = LineKey::product("p1");

        let (c, t1) = tracker.begin(&cart(), &key, OperationKind::SetQuantity, Some(2));
        tracker.sent(&key, t1);
        let c = apply_optimistic_set_quantity(&c, &key, 2);
        let (c, t2) = tracker.begin(&c, &key, OperationKind::SetQuantity, Some(9));
        tracker.sent(&key, t2);
        let c = apply_optimistic_set_quantity(&c, &key, 9);

        // The first edit landed on the authority before the second was rejected
        let first = CartResponse::single(Some(line("p1", 2, 10)), price(20), 2);
        assert!(tracker.accept(&c, &key, t1, &first).is_stale());

        let restored = tracker.reject(&c, &key, t2).applied().unwrap();
        assert_eq!(restored.line(&key).unwrap().quantity, 2);
        assert!(!restored.has_pending());
        assert!(restored.is_consistent());
    }

    #[test]
    fn test_abort_all_makes_in_flight_tokens_stale() {
        let mut tracker = FencingTracker::new();
        let key = LineKey::product("p1");
        let (c, t1) = tracker.begin(&cart(), &key, OperationKind::Remove, None);

        let c = tracker.abort_all(&c);
        assert!(!c.has_pending());

        let response = CartResponse::single(None, price(0), 0);
        assert!(tracker.accept(&c, &key, t1, &response).is_stale());

        // Numbering continues after an abort
        let (_, t2) = tracker.begin(&c, &key, OperationKind::Remove, None);
        assert!(t2 > t1);
    }
}
