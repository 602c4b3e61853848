//! A `RemoteCart` whose every call waits for the test to answer it.

use std::sync::{Arc, Mutex, MutexGuard};

use naked_pineapple_cart::{CartError, CartLine, CartResponse, ClearOptions, LineKey, RemoteCart};
use naked_pineapple_core::ProductId;
use tokio::sync::{Notify, oneshot};

type Reply = Result<CartResponse, CartError>;

/// A call the engine made, with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Fetch,
    Add { key: LineKey, quantity: u32 },
    SetQuantity { key: LineKey, quantity: u32 },
    Remove { key: LineKey },
    Clear { restock: bool },
    Merge { lines: Vec<CartLine> },
}

struct Recorded {
    call: Call,
    responder: Option<oneshot::Sender<Reply>>,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<Recorded>>,
    arrived: Notify,
}

/// Remote cart double with test-controlled responses.
///
/// Calls are numbered in arrival order. A call stays blocked until
/// [`ScriptedRemote::respond`] answers it; answering out of order is how the
/// tests reorder the network.
#[derive(Clone, Default)]
pub struct ScriptedRemote {
    shared: Arc<Shared>,
}

impl ScriptedRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Recorded>> {
        self.shared
            .calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn call(&self, call: Call) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.lock().push(Recorded {
            call,
            responder: Some(tx),
        });
        self.shared.arrived.notify_waiters();
        rx.await
            .unwrap_or_else(|_| Err(CartError::NetworkFailure("scripted call abandoned".to_string())))
    }

    /// Every call made so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.lock().iter().map(|r| r.call.clone()).collect()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.lock().len()
    }

    /// Wait until at least `n` calls have arrived.
    pub async fn wait_for_calls(&self, n: usize) {
        loop {
            let arrived = self.shared.arrived.notified();
            if self.call_count() >= n {
                return;
            }
            arrived.await;
        }
    }

    /// Answer call number `index`.
    ///
    /// # Panics
    ///
    /// Panics if the call does not exist or was already answered.
    pub fn respond(&self, index: usize, reply: Reply) {
        let responder = self
            .lock()
            .get_mut(index)
            .and_then(|r| r.responder.take())
            .unwrap_or_else(|| panic!("call {index} does not exist or was already answered"));
        // The engine may have timed the call out already
        let _ = responder.send(reply);
    }
}

impl RemoteCart for ScriptedRemote {
    async fn fetch(&self) -> Reply {
        self.call(Call::Fetch).await
    }

    async fn add(&self, product_id: &ProductId, variant_index: u32, quantity: u32) -> Reply {
        let key = LineKey::new(product_id.clone(), variant_index);
        self.call(Call::Add { key, quantity }).await
    }

    async fn set_quantity(&self, key: &LineKey, quantity: u32) -> Reply {
        self.call(Call::SetQuantity {
            key: key.clone(),
            quantity,
        })
        .await
    }

    async fn remove(&self, key: &LineKey) -> Reply {
        self.call(Call::Remove { key: key.clone() }).await
    }

    async fn clear(&self, options: ClearOptions) -> Reply {
        self.call(Call::Clear {
            restock: options.restock,
        })
        .await
    }

    async fn merge(&self, guest_lines: &[CartLine]) -> Reply {
        self.call(Call::Merge {
            lines: guest_lines.to_vec(),
        })
        .await
    }
}
