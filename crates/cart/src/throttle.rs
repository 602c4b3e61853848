//! Per-key trailing-edge debounce with hard-cancellable timers.
//!
//! Quantity edits on the same line within the window collapse into one
//! remote call carrying the last value. Each armed key owns one Tokio sleep
//! task; re-arming aborts the previous task, so a superseded timer never
//! fires. The task only posts a message; the owner confirms the firing with
//! [`Debouncer::take_due`], which also rejects a firing that raced a
//! re-arm.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

use crate::model::RequestToken;

struct Armed {
    token: RequestToken,
    value: u32,
    timer: AbortHandle,
}

/// Debounce timers keyed by `K`.
pub struct Debouncer<K> {
    window: Duration,
    armed: HashMap<K, Armed>,
}

impl<K> std::fmt::Debug for Debouncer<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("window", &self.window)
            .field("armed", &self.armed.len())
            .finish()
    }
}

impl<K: Clone + Eq + Hash + Send + 'static> Debouncer<K> {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            armed: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Arm (or re-arm) the timer for `key`.
    ///
    /// When the window elapses without another `arm` or `cancel` for the same
    /// key, `wrap(key, token)` is sent on `tx`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn arm<M, F>(
        &mut self,
        key: K,
        token: RequestToken,
        value: u32,
        tx: &UnboundedSender<M>,
        wrap: F,
    ) where
        M: Send + 'static,
        F: FnOnce(K, RequestToken) -> M + Send + 'static,
    {
        self.cancel(&key);

        let tx = tx.clone();
        let window = self.window;
        let fired_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Receiver gone means the engine was dropped
            let _ = tx.send(wrap(fired_key, token));
        })
        .abort_handle();

        self.armed.insert(key, Armed { token, value, timer });
    }

    /// Cancel the timer for `key`. Returns whether one was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.armed.remove(key).is_some_and(|armed| {
            armed.timer.abort();
            true
        })
    }

    /// Cancel every armed timer.
    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.timer.abort();
        }
    }

    /// Claim a fired timer.
    ///
    /// Returns the debounced value when `token` is still the armed token for
    /// `key`, disarming it. A firing for a superseded token returns `None`.
    pub fn take_due(&mut self, key: &K, token: RequestToken) -> Option<u32> {
        if self.armed.get(key).is_some_and(|armed| armed.token == token) {
            self.armed.remove(key).map(|armed| armed.value)
        } else {
            None
        }
    }

    /// The value waiting to be sent for `key`.
    #[must_use]
    pub fn pending_value(&self, key: &K) -> Option<u32> {
        self.armed.get(key).map(|armed| armed.value)
    }

    #[must_use]
    pub fn is_armed(&self, key: &K) -> bool {
        self.armed.contains_key(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        for armed in self.armed.values() {
            armed.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn test_rearm_within_window_fires_once_with_last_value() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = Debouncer::new(WINDOW);

        debouncer.arm("p1", RequestToken::new(1), 5, &tx, |k, t| (k, t));
        tokio::time::sleep(Duration::from_millis(40)).await;
        debouncer.arm("p1", RequestToken::new(2), 6, &tx, |k, t| (k, t));
        tokio::time::sleep(Duration::from_millis(40)).await;
        debouncer.arm("p1", RequestToken::new(3), 7, &tx, |k, t| (k, t));

        let (key, token) = rx.recv().await.unwrap_or(("none", RequestToken::new(0)));
        assert_eq!(key, "p1");
        assert_eq!(token, RequestToken::new(3));
        assert_eq!(debouncer.take_due(&key, token), Some(7));

        tokio::time::sleep(WINDOW * 3).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = Debouncer::new(WINDOW);

        debouncer.arm("p1", RequestToken::new(1), 1, &tx, |k, t| (k, t));
        debouncer.arm("p2", RequestToken::new(1), 2, &tx, |k, t| (k, t));

        tokio::time::sleep(WINDOW * 2).await;
        let mut fired = vec![
            rx.try_recv().ok().map(|(k, _)| k),
            rx.try_recv().ok().map(|(k, _)| k),
        ];
        fired.sort();
        assert_eq!(fired, vec![Some("p1"), Some("p2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = Debouncer::new(WINDOW);

        debouncer.arm("p1", RequestToken::new(1), 3, &tx, |k, t| (k, t));
        assert!(debouncer.cancel(&"p1"));
        assert!(!debouncer.cancel(&"p1"));

        tokio::time::sleep(WINDOW * 2).await;
        assert!(rx.try_recv().is_err());
        assert!(debouncer.is_empty());
    }

    #[test]
    fn test_take_due_rejects_superseded_token() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build();
        let Ok(runtime) = runtime else { return };
        runtime.block_on(async {
            let (tx, _rx) = mpsc::unbounded_channel::<(&str, RequestToken)>();
            let mut debouncer = Debouncer::new(WINDOW);
            debouncer.arm("p1", RequestToken::new(4), 9, &tx, |k, t| (k, t));
            assert_eq!(debouncer.take_due(&"p1", RequestToken::new(3)), None);
            assert_eq!(debouncer.pending_value(&"p1"), Some(9));
            assert_eq!(debouncer.take_due(&"p1", RequestToken::new(4)), Some(9));
            assert!(!debouncer.is_armed(&"p1"));
        });
    }
}
