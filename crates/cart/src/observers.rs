//! Listener registry for cart changes and server-initiated removals.

use std::fmt;

use crate::model::{CartAggregate, RemovalBatch};

type CartListener = Box<dyn Fn(&CartAggregate) + Send + Sync>;
type RemovalListener = Box<dyn Fn(&RemovalBatch) + Send + Sync>;

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Registered listeners, notified in subscription order.
#[derive(Default)]
pub struct Observers {
    next_id: u64,
    cart_changed: Vec<(SubscriptionId, CartListener)>,
    server_removal: Vec<(SubscriptionId, RemovalListener)>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("cart_changed", &self.cart_changed.len())
            .field("server_removal", &self.server_removal.len())
            .finish()
    }
}

impl Observers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn issue(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    /// Call `listener` with the new aggregate after every visible change.
    pub fn on_cart_changed(
        &mut self,
        listener: impl Fn(&CartAggregate) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.issue();
        self.cart_changed.push((id, Box::new(listener)));
        id
    }

    /// Call `listener` once per removal batch reported by the authority.
    pub fn on_server_removal(
        &mut self,
        listener: impl Fn(&RemovalBatch) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.issue();
        self.server_removal.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.cart_changed.len() + self.server_removal.len();
        self.cart_changed.retain(|(sub, _)| *sub != id);
        self.server_removal.retain(|(sub, _)| *sub != id);
        before != self.cart_changed.len() + self.server_removal.len()
    }

    pub fn notify_cart_changed(&self, cart: &CartAggregate) {
        for (_, listener) in &self.cart_changed {
            listener(cart);
        }
    }

    pub fn notify_server_removal(&self, batch: &RemovalBatch) {
        for (_, listener) in &self.server_removal {
            listener(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_notify_and_unsubscribe() {
        let mut observers = Observers::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let id = observers.on_cart_changed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        observers.notify_cart_changed(&CartAggregate::default());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.notify_cart_changed(&CartAggregate::default());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removal_listeners_receive_batch() {
        let mut observers = Observers::new();
        let seen = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&seen);
        let first = observers.on_server_removal(move |batch| {
            counter.fetch_add(u32::try_from(batch.lines.len()).unwrap_or(0) + 1, Ordering::SeqCst);
        });
        let second = observers.on_cart_changed(|_| {});
        assert_ne!(first, second);

        observers.notify_server_removal(&RemovalBatch {
            batch_id: "b1".to_string(),
            lines: Vec::new(),
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
