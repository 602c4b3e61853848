//! The cart coordinator.
//!
//! [`CartSync`] owns the [`CartAggregate`] and is the only thing that
//! changes it. Intents (`add`, `set_quantity`, `remove`, `clear`) apply
//! optimistically and synchronously; the matching remote call runs as a
//! Tokio task and reports back over a channel. The embedder drives the
//! engine by awaiting [`CartSync::next_event`] (or [`CartSync::settle`]),
//! which applies one result at a time through the fencing tracker.
//!
//! Anonymous sessions never touch the network: the guest store is the
//! authority and every change is persisted before it becomes visible.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{self, CartError, Result};
use crate::fencing::FencingTracker;
use crate::guest_store::GuestCartStore;
use crate::model::{CartAggregate, CartLine, LineKey, OperationKind, RemovalBatch, RequestToken};
use crate::observers::{Observers, SubscriptionId};
use crate::reducer::{self, AddLine, Transition};
use crate::remote::{CartResponse, ClearOptions, RemoteCart, with_deadline};
use crate::revalidate::{self, EngineActivity, RevalidationDecision, RevalidationTrigger, Revalidator};
use crate::session::{Handoff, MergeOutcome, SessionEvent, SessionIdentity, SessionState, transplant_guest_cart};
use crate::throttle::Debouncer;

/// A transient, user-facing message produced while processing events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartNotice {
    /// A rejected edit was undone. `key` is `None` for a whole-cart clear.
    RolledBack {
        key: Option<LineKey>,
        operation: OperationKind,
        error: CartError,
    },
    /// The authority rejected the credential; the engine is now anonymous.
    SessionExpired,
    /// The login handoff could not complete.
    MergeFailed(CartError),
    /// Some guest lines could not be added at login and stay on the device.
    GuestLinesKept { count: usize },
    /// The authority removed lines on its own.
    ItemsRemoved(RemovalBatch),
    /// Loading the account cart failed.
    LoadFailed(CartError),
}

impl CartNotice {
    /// Text suitable for a toast or status line.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::RolledBack { error, .. } | Self::MergeFailed(error) | Self::LoadFailed(error) => {
                error.user_message()
            }
            Self::SessionExpired => CartError::Unauthenticated.user_message(),
            Self::GuestLinesKept { count } => {
                format!("{count} item(s) from your guest cart could not be added yet")
            }
            Self::ItemsRemoved(batch) => {
                let names: Vec<&str> = batch
                    .lines
                    .iter()
                    .map(|l| l.product_snapshot.name.as_str())
                    .collect();
                if names.is_empty() {
                    "Some items were removed from your cart".to_string()
                } else {
                    format!("Removed from your cart: {}", names.join(", "))
                }
            }
        }
    }
}

enum EngineEvent {
    Completed {
        generation: u64,
        key: LineKey,
        token: RequestToken,
        operation: OperationKind,
        result: Result<CartResponse>,
    },
    Cleared {
        generation: u64,
        fences: Vec<(LineKey, RequestToken)>,
        result: Result<CartResponse>,
    },
    DebounceFired {
        key: LineKey,
        token: RequestToken,
    },
    Revalidated {
        generation: u64,
        epoch: u64,
        result: Result<CartResponse>,
    },
    SessionReady {
        generation: u64,
        result: Result<Handoff>,
    },
    Trigger(RevalidationTrigger),
}

/// Cart synchronization engine.
pub struct CartSync<R: RemoteCart, S: GuestCartStore + 'static> {
    remote: R,
    store: Arc<S>,
    config: SyncConfig,
    cart: CartAggregate,
    session: SessionState,
    /// Bumped on every session change; results from older generations are
    /// dropped.
    generation: u64,
    /// Bumped whenever a mutation starts; a revalidation that spans a bump
    /// is dropped.
    mutation_epoch: u64,
    /// Spawned tasks whose result has not been processed yet.
    in_flight: usize,
    /// The login merge and first account read are still outstanding.
    handoff_pending: bool,
    fencing: FencingTracker,
    debouncer: Debouncer<LineKey>,
    revalidator: Revalidator,
    observers: Observers,
    interval: Option<JoinHandle<()>>,
    tx: UnboundedSender<EngineEvent>,
    rx: UnboundedReceiver<EngineEvent>,
}

impl<R: RemoteCart, S: GuestCartStore + 'static> std::fmt::Debug for CartSync<R, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartSync")
            .field("session", &self.session)
            .field("generation", &self.generation)
            .field("lines", &self.cart.lines().len())
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteCart, S: GuestCartStore + 'static> CartSync<R, S> {
    /// Create an anonymous engine, loading the guest cart from `store`.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Persistence` if the guest cart cannot be read.
    pub fn new(remote: R, store: S, config: SyncConfig) -> Result<Self> {
        let store = Arc::new(store);
        let guest = store.load()?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            remote,
            store,
            cart: guest_cart(guest),
            session: SessionState::Anonymous,
            generation: 0,
            mutation_epoch: 0,
            in_flight: 0,
            handoff_pending: false,
            fencing: FencingTracker::new(),
            debouncer: Debouncer::new(config.debounce),
            revalidator: Revalidator::new(&config),
            observers: Observers::new(),
            interval: None,
            config,
            tx,
            rx,
        })
    }

    /// The cart as the UI should show it.
    #[must_use]
    pub const fn cart(&self) -> &CartAggregate {
        &self.cart
    }

    #[must_use]
    pub const fn session(&self) -> &SessionState {
        &self.session
    }

    /// Whether a remote call, debounce timer or background fetch is still
    /// outstanding.
    #[must_use]
    pub fn has_outstanding_work(&self) -> bool {
        self.in_flight > 0 || !self.debouncer.is_empty()
    }

    // =========================================================================
    // Observers
    // =========================================================================

    pub fn on_cart_changed(
        &mut self,
        listener: impl Fn(&CartAggregate) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.observers.on_cart_changed(listener)
    }

    pub fn on_server_removal(
        &mut self,
        listener: impl Fn(&RemovalBatch) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.observers.on_server_removal(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    // =========================================================================
    // Intents
    // =========================================================================

    /// Add units of a product variant.
    ///
    /// If a quantity edit for the same line is still being debounced, the
    /// add joins it and the combined quantity is sent when the window ends.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Persistence` if a guest cart cannot be saved.
    /// Remote failures arrive later as [`CartNotice`]s.
    #[instrument(skip(self, intent), fields(line = %intent.key, quantity = intent.quantity))]
    pub fn add(&mut self, intent: AddLine) -> Result<()> {
        if intent.quantity == 0 {
            return Ok(());
        }
        if !self.session.is_authenticated() {
            let next = reducer::apply_optimistic_add(&self.cart, &intent);
            return self.commit_guest(next);
        }

        let key = intent.key.clone();
        let target = self
            .cart
            .line(&key)
            .map_or(intent.quantity, |l| l.quantity.saturating_add(intent.quantity));
        if self.debouncer.is_armed(&key) {
            let token = self.fence(&key, OperationKind::SetQuantity, Some(target));
            self.cart = reducer::apply_optimistic_add(&self.cart, &intent);
            self.arm_debounce(key, token, target);
        } else {
            let token = self.fence(&key, OperationKind::Add, Some(target));
            self.cart = reducer::apply_optimistic_add(&self.cart, &intent);
            let quantity = intent.quantity;
            self.dispatch(key.clone(), token, OperationKind::Add, move |remote| async move {
                remote.add(&key.product_id, key.variant_index, quantity).await
            });
        }
        self.observers.notify_cart_changed(&self.cart);
        Ok(())
    }

    /// Set a line's quantity; 0 removes it.
    ///
    /// The UI sees the new quantity immediately; the remote call is debounced
    /// per line so only the last value within the window is sent. Setting a
    /// quantity on a line that is not in the cart does nothing.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Persistence` if a guest cart cannot be saved.
    #[instrument(skip(self), fields(line = %key))]
    pub fn set_quantity(&mut self, key: &LineKey, quantity: u32) -> Result<()> {
        if self.cart.line(key).is_none() {
            debug!("Ignoring quantity change for a line not in the cart");
            return Ok(());
        }
        if !self.session.is_authenticated() {
            let next = reducer::apply_optimistic_set_quantity(&self.cart, key, quantity);
            return self.commit_guest(next);
        }

        let token = self.fence(key, OperationKind::SetQuantity, Some(quantity));
        self.cart = reducer::apply_optimistic_set_quantity(&self.cart, key, quantity);
        self.arm_debounce(key.clone(), token, quantity);
        self.observers.notify_cart_changed(&self.cart);
        Ok(())
    }

    /// Remove a line. Removing an absent line succeeds without a remote call.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Persistence` if a guest cart cannot be saved.
    #[instrument(skip(self), fields(line = %key))]
    pub fn remove(&mut self, key: &LineKey) -> Result<()> {
        self.debouncer.cancel(key);

        if !self.session.is_authenticated() {
            if self.cart.line(key).is_none() {
                return Ok(());
            }
            let next = reducer::apply_optimistic_remove(&self.cart, key);
            return self.commit_guest(next);
        }

        if self.cart.line(key).is_none() && self.cart.pending(key).is_none() {
            debug!("Line already absent");
            return Ok(());
        }

        let token = self.fence(key, OperationKind::Remove, Some(0));
        self.cart = reducer::apply_optimistic_remove(&self.cart, key);
        let target = key.clone();
        self.dispatch(key.clone(), token, OperationKind::Remove, move |remote| async move {
            remote.remove(&target).await
        });
        self.observers.notify_cart_changed(&self.cart);
        Ok(())
    }

    /// Empty the cart.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Persistence` if the guest cart cannot be cleared.
    #[instrument(skip(self))]
    pub fn clear(&mut self, options: ClearOptions) -> Result<()> {
        self.debouncer.cancel_all();

        if !self.session.is_authenticated() {
            if let Err(e) = self.store.clear() {
                error!(error = %e, "Failed to clear guest cart");
                return Err(e.into());
            }
            self.cart = reducer::apply_optimistic_clear(&self.cart);
            self.observers.notify_cart_changed(&self.cart);
            return Ok(());
        }

        let mut keys: Vec<LineKey> = self.cart.lines().iter().map(CartLine::key).collect();
        for key in self.cart.pending_by_product().keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        let fences: Vec<(LineKey, RequestToken)> = keys
            .into_iter()
            .map(|key| {
                let token = self.fence(&key, OperationKind::Clear, Some(0));
                (key, token)
            })
            .collect();
        for (key, token) in &fences {
            self.fencing.sent(key, *token);
        }
        self.cart = reducer::apply_optimistic_clear(&self.cart);

        let remote = self.remote.clone();
        let tx = self.tx.clone();
        let generation = self.generation;
        let deadline = self.config.request_timeout;
        self.spawn(async move {
            let result = with_deadline(deadline, remote.clear(options)).await;
            let _ = tx.send(EngineEvent::Cleared {
                generation,
                fences,
                result,
            });
        });
        self.observers.notify_cart_changed(&self.cart);
        Ok(())
    }

    // =========================================================================
    // Session and revalidation
    // =========================================================================

    /// React to an identity provider event.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Persistence` if the guest cart cannot be read when
    /// becoming anonymous. The engine is anonymous with an empty cart in that
    /// case.
    #[instrument(skip(self))]
    pub fn on_session_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Authenticated(identity) => {
                if self.session.identity() == Some(&identity) {
                    debug!("Already authenticated as this customer");
                    return Ok(());
                }
                self.begin_authenticated(identity);
                Ok(())
            }
            SessionEvent::Anonymous => {
                if !self.session.is_authenticated() {
                    return Ok(());
                }
                info!("Signed out; discarding account cart");
                error::add_breadcrumb("session", "Signed out", None);
                self.become_anonymous()
            }
            SessionEvent::CredentialExpired => {
                warn!("Credential expired; resetting cart session");
                error::add_breadcrumb("session", "Credential expired", None);
                self.become_anonymous()
            }
        }
    }

    /// Ask for a background refresh of the account cart.
    #[instrument(skip(self))]
    pub fn revalidate(&mut self, trigger: RevalidationTrigger) -> RevalidationDecision {
        let activity = EngineActivity {
            authenticated: self.session.is_authenticated(),
            mutation_pending: self.handoff_pending
                || self.cart.has_pending()
                || !self.debouncer.is_empty(),
        };
        let decision = self.revalidator.decide(trigger, activity);
        if !decision.started() {
            return decision;
        }

        let remote = self.remote.clone();
        let tx = self.tx.clone();
        let generation = self.generation;
        let epoch = self.mutation_epoch;
        let deadline = self.config.request_timeout;
        self.spawn(async move {
            let result = with_deadline(deadline, remote.fetch()).await;
            let _ = tx.send(EngineEvent::Revalidated {
                generation,
                epoch,
                result,
            });
        });
        decision
    }

    /// Revalidate every `period` until stopped or the engine is dropped.
    pub fn start_revalidation_interval(&mut self, period: Duration) {
        self.stop_revalidation_interval();
        self.interval = Some(revalidate::spawn_interval(period, self.tx.clone(), || {
            EngineEvent::Trigger(RevalidationTrigger::Interval)
        }));
    }

    pub fn stop_revalidation_interval(&mut self) {
        if let Some(handle) = self.interval.take() {
            handle.abort();
        }
    }

    // =========================================================================
    // Event processing
    // =========================================================================

    /// Wait for the next task result or timer and apply it.
    pub async fn next_event(&mut self) -> Vec<CartNotice> {
        match self.rx.recv().await {
            Some(event) => self.handle(event),
            None => Vec::new(),
        }
    }

    /// Process events until no work is outstanding.
    pub async fn settle(&mut self) -> Vec<CartNotice> {
        let mut notices = Vec::new();
        while self.has_outstanding_work() {
            notices.extend(self.next_event().await);
        }
        notices
    }

    fn handle(&mut self, event: EngineEvent) -> Vec<CartNotice> {
        match event {
            EngineEvent::Completed {
                generation,
                key,
                token,
                operation,
                result,
            } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if generation != self.generation {
                    debug!(line = %key, token = %token, "Dropping response from an earlier session");
                    return Vec::new();
                }
                self.complete_line(&key, token, operation, result)
            }
            EngineEvent::Cleared {
                generation,
                fences,
                result,
            } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if generation != self.generation {
                    debug!("Dropping clear response from an earlier session");
                    return Vec::new();
                }
                self.complete_clear(&fences, result)
            }
            EngineEvent::DebounceFired { key, token } => {
                self.flush_debounced(key, token);
                Vec::new()
            }
            EngineEvent::Revalidated {
                generation,
                epoch,
                result,
            } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if generation != self.generation {
                    debug!("Dropping revalidation from an earlier session");
                    return Vec::new();
                }
                self.revalidator.finish();
                self.complete_revalidation(epoch, result)
            }
            EngineEvent::SessionReady { generation, result } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if generation != self.generation {
                    debug!("Dropping login handoff from an earlier session");
                    return Vec::new();
                }
                self.handoff_pending = false;
                // A read that started before the merge landed is out of date
                self.mutation_epoch += 1;
                self.complete_handoff(result)
            }
            EngineEvent::Trigger(trigger) => {
                self.revalidate(trigger);
                Vec::new()
            }
        }
    }

    fn complete_line(
        &mut self,
        key: &LineKey,
        token: RequestToken,
        operation: OperationKind,
        result: Result<CartResponse>,
    ) -> Vec<CartNotice> {
        let result = match result {
            // Absence is the goal of these operations
            Err(CartError::NotFound(_)) if operation != OperationKind::Add => Ok(CartResponse::default()),
            other => other,
        };

        match result {
            Ok(response) => {
                let mut notices = Vec::new();
                match self.fencing.accept(&self.cart, key, token, &response) {
                    Transition::Applied(next) => {
                        self.cart = next;
                        self.observers.notify_cart_changed(&self.cart);
                    }
                    Transition::Stale => debug!(line = %key, token = %token, "Stale response dropped"),
                }
                notices.extend(self.surface_removals(&response));
                notices
            }
            Err(CartError::Unauthenticated) => self.expire_session(),
            Err(err) => self.roll_back(key, token, operation, err).into_iter().collect(),
        }
    }

    fn roll_back(
        &mut self,
        key: &LineKey,
        token: RequestToken,
        operation: OperationKind,
        err: CartError,
    ) -> Option<CartNotice> {
        match self.fencing.reject(&self.cart, key, token) {
            Transition::Applied(next) => {
                warn!(line = %key, token = %token, %operation, error = %err, "Rolled back optimistic edit");
                error::add_breadcrumb(
                    "cart",
                    "Rolled back optimistic edit",
                    Some(&[
                        ("line", key.to_string().as_str()),
                        ("operation", operation.to_string().as_str()),
                    ]),
                );
                self.cart = next;
                self.observers.notify_cart_changed(&self.cart);
                Some(CartNotice::RolledBack {
                    key: Some(key.clone()),
                    operation,
                    error: err,
                })
            }
            Transition::Stale => {
                debug!(line = %key, token = %token, error = %err, "Stale failure dropped");
                None
            }
        }
    }

    fn complete_clear(&mut self, fences: &[(LineKey, RequestToken)], result: Result<CartResponse>) -> Vec<CartNotice> {
        let result = match result {
            Err(CartError::NotFound(_)) => Ok(CartResponse::default()),
            other => other,
        };

        match result {
            Ok(response) => {
                let mut changed = false;
                for (key, token) in fences {
                    if let Transition::Applied(next) = self.fencing.accept(&self.cart, key, *token, &response) {
                        self.cart = next;
                        changed = true;
                    }
                }
                if changed {
                    self.observers.notify_cart_changed(&self.cart);
                }
                self.surface_removals(&response)
            }
            Err(CartError::Unauthenticated) => self.expire_session(),
            Err(err) => {
                let mut restored = false;
                for (key, token) in fences {
                    if let Transition::Applied(next) = self.fencing.reject(&self.cart, key, *token) {
                        self.cart = next;
                        restored = true;
                    }
                }
                if !restored {
                    debug!(error = %err, "Stale clear failure dropped");
                    return Vec::new();
                }
                warn!(error = %err, "Rolled back cart clear");
                self.observers.notify_cart_changed(&self.cart);
                vec![CartNotice::RolledBack {
                    key: None,
                    operation: OperationKind::Clear,
                    error: err,
                }]
            }
        }
    }

    fn complete_revalidation(&mut self, epoch: u64, result: Result<CartResponse>) -> Vec<CartNotice> {
        match result {
            Ok(response) => {
                if epoch != self.mutation_epoch || self.cart.has_pending() {
                    debug!("Dropping revalidation that raced a local edit");
                    return Vec::new();
                }
                self.cart = reducer::hydrate(&self.cart, &response);
                self.observers.notify_cart_changed(&self.cart);
                self.surface_removals(&response)
            }
            Err(CartError::Unauthenticated) => self.expire_session(),
            Err(err) => {
                warn!(error = %err, "Background revalidation failed");
                Vec::new()
            }
        }
    }

    fn complete_handoff(&mut self, result: Result<Handoff>) -> Vec<CartNotice> {
        match result {
            Ok(handoff) => {
                self.cart = reducer::hydrate(&self.cart, &handoff.response);
                self.observers.notify_cart_changed(&self.cart);
                info!(outcome = ?handoff.outcome, lines = self.cart.lines().len(), "Account cart loaded");

                let mut notices = self.surface_removals(&handoff.response);
                if let MergeOutcome::LineByLine { kept, .. } = handoff.outcome
                    && kept > 0
                {
                    notices.push(CartNotice::GuestLinesKept { count: kept });
                }
                notices
            }
            Err(CartError::Unauthenticated) => self.expire_session(),
            Err(err @ CartError::MergeFailure(_)) => {
                warn!(error = %err, "Guest cart handoff failed");
                vec![CartNotice::MergeFailed(err)]
            }
            Err(err) => {
                warn!(error = %err, "Failed to load account cart");
                vec![CartNotice::LoadFailed(err)]
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Fence a mutation on `key` and record it in the aggregate.
    fn fence(&mut self, key: &LineKey, operation: OperationKind, target: Option<u32>) -> RequestToken {
        let (next, token) = self.fencing.begin(&self.cart, key, operation, target);
        self.cart = next;
        self.mutation_epoch += 1;
        token
    }

    fn arm_debounce(&mut self, key: LineKey, token: RequestToken, quantity: u32) {
        self.debouncer
            .arm(key, token, quantity, &self.tx, |key, token| EngineEvent::DebounceFired {
                key,
                token,
            });
    }

    fn flush_debounced(&mut self, key: LineKey, token: RequestToken) {
        let Some(quantity) = self.debouncer.take_due(&key, token) else {
            debug!(line = %key, token = %token, "Superseded debounce timer ignored");
            return;
        };
        if !self.fencing.is_current(&self.cart, &key, token) {
            debug!(line = %key, token = %token, "Debounced edit no longer current");
            return;
        }
        let target = key.clone();
        self.dispatch(key, token, OperationKind::SetQuantity, move |remote| async move {
            remote.set_quantity(&target, quantity).await
        });
    }

    /// Spawn a line mutation under the request deadline.
    fn dispatch<F, Fut>(&mut self, key: LineKey, token: RequestToken, operation: OperationKind, call: F)
    where
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = Result<CartResponse>> + Send + 'static,
    {
        self.fencing.sent(&key, token);
        let request = call(self.remote.clone());
        let tx = self.tx.clone();
        let generation = self.generation;
        let deadline = self.config.request_timeout;
        let span = info_span!("cart_request", line = %key, token = %token, %operation);
        self.spawn(
            async move {
                let result = with_deadline(deadline, request).await;
                let _ = tx.send(EngineEvent::Completed {
                    generation,
                    key,
                    token,
                    operation,
                    result,
                });
            }
            .instrument(span),
        );
    }

    fn spawn(&mut self, task: impl Future<Output = ()> + Send + 'static) {
        self.in_flight += 1;
        tokio::spawn(task);
    }

    fn begin_authenticated(&mut self, identity: SessionIdentity) {
        info!(customer_id = %identity.customer_id, "Signed in; loading account cart");
        error::set_sentry_customer(&identity.customer_id);
        error::add_breadcrumb(
            "session",
            "Signed in",
            Some(&[("customer_id", identity.customer_id.as_str())]),
        );

        self.reset_session_state();
        self.session = SessionState::Authenticated(identity);
        self.cart = CartAggregate::empty(self.cart.currency_code());
        self.observers.notify_cart_changed(&self.cart);

        self.handoff_pending = true;
        let remote = self.remote.clone();
        let store = Arc::clone(&self.store);
        let tx = self.tx.clone();
        let generation = self.generation;
        let deadline = self.config.request_timeout;
        self.spawn(async move {
            let result = transplant_guest_cart(&remote, store.as_ref(), deadline).await;
            let _ = tx.send(EngineEvent::SessionReady { generation, result });
        });
    }

    fn become_anonymous(&mut self) -> Result<()> {
        error::clear_sentry_customer();
        self.reset_session_state();
        self.session = SessionState::Anonymous;

        let loaded = self.store.load();
        self.cart = match &loaded {
            Ok(lines) => guest_cart(lines.clone()),
            Err(e) => {
                error!(error = %e, "Failed to load guest cart");
                CartAggregate::empty(self.cart.currency_code())
            }
        };
        self.observers.notify_cart_changed(&self.cart);
        loaded.map(|_| ()).map_err(Into::into)
    }

    fn expire_session(&mut self) -> Vec<CartNotice> {
        warn!("Authority rejected the credential");
        if let Err(e) = self.on_session_event(SessionEvent::CredentialExpired) {
            error!(error = %e, "Guest cart unavailable after session reset");
        }
        vec![CartNotice::SessionExpired]
    }

    /// Abandon everything tied to the current session.
    fn reset_session_state(&mut self) {
        self.generation += 1;
        self.handoff_pending = false;
        self.debouncer.cancel_all();
        self.cart = self.fencing.abort_all(&self.cart);
        self.revalidator.reset();
    }

    /// Persist a guest change, then publish it.
    fn commit_guest(&mut self, next: CartAggregate) -> Result<()> {
        let next = reducer::confirm_local(&next);
        if let Err(e) = self.store.save(next.lines()) {
            error!(error = %e, "Failed to save guest cart");
            return Err(e.into());
        }
        self.cart = next;
        self.observers.notify_cart_changed(&self.cart);
        Ok(())
    }

    fn surface_removals(&self, response: &CartResponse) -> Vec<CartNotice> {
        let Some(batch) = &response.removed else {
            return Vec::new();
        };
        if !self.revalidator.first_sighting(batch) {
            return Vec::new();
        }
        info!(batch_id = %batch.batch_id, lines = batch.lines.len(), "Authority removed lines");
        self.observers.notify_server_removal(batch);
        vec![CartNotice::ItemsRemoved(batch.clone())]
    }
}

impl<R: RemoteCart, S: GuestCartStore + 'static> Drop for CartSync<R, S> {
    fn drop(&mut self) {
        self.stop_revalidation_interval();
    }
}

fn guest_cart(lines: Vec<CartLine>) -> CartAggregate {
    let currency = lines
        .first()
        .map(|l| l.unit_price.currency_code)
        .unwrap_or_default();
    reducer::confirm_local(&CartAggregate::from_lines(lines, currency))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use naked_pineapple_core::CurrencyCode;

    use super::*;
    use crate::guest_store::MemoryGuestStore;
    use crate::model::ProductSnapshot;
    use crate::model::fixtures::{line, price};

    /// Remote that answers every call from a fixed server cart and counts
    /// calls.
    #[derive(Clone, Default)]
    struct EchoRemote {
        calls: Arc<AtomicU32>,
        reject_unauthenticated: bool,
    }

    impl EchoRemote {
        fn answer(&self, lines: Vec<CartLine>) -> Result<CartResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_unauthenticated {
                return Err(CartError::Unauthenticated);
            }
            let cart = CartAggregate::from_lines(lines, CurrencyCode::USD);
            Ok(CartResponse::collection(cart.lines().to_vec(), cart.total(), cart.count()))
        }
    }

    impl RemoteCart for EchoRemote {
        async fn fetch(&self) -> Result<CartResponse> {
            self.answer(vec![line("p9", 1, 4)])
        }

        async fn add(&self, product_id: &naked_pineapple_core::ProductId, _variant: u32, quantity: u32) -> Result<CartResponse> {
            self.answer(vec![line(product_id.as_str(), quantity, 10)])
        }

        async fn set_quantity(&self, key: &LineKey, quantity: u32) -> Result<CartResponse> {
            self.answer(vec![line(key.product_id.as_str(), quantity, 10)])
        }

        async fn remove(&self, _key: &LineKey) -> Result<CartResponse> {
            Err(CartError::NotFound("gone".to_string()))
        }

        async fn clear(&self, _options: ClearOptions) -> Result<CartResponse> {
            self.answer(Vec::new())
        }

        async fn merge(&self, guest_lines: &[CartLine]) -> Result<CartResponse> {
            self.answer(guest_lines.to_vec())
        }
    }

    fn intent(product: &str, quantity: u32) -> AddLine {
        AddLine::new(LineKey::product(product), quantity, price(10), ProductSnapshot::named(product))
    }

    fn engine(remote: EchoRemote, store: MemoryGuestStore) -> CartSync<EchoRemote, MemoryGuestStore> {
        CartSync::new(remote, store, SyncConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_changes_are_persisted_without_network() {
        let remote = EchoRemote::default();
        let store = MemoryGuestStore::new();
        let mut sync = engine(remote.clone(), store.clone());

        sync.add(intent("p1", 2)).unwrap();
        sync.set_quantity(&LineKey::product("p1"), 5).unwrap();

        assert!(!sync.has_outstanding_work());
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
        let stored = store.load().unwrap();
        assert_eq!(stored[0].quantity, 5);
        assert!(!stored[0].is_provisional);
        assert!(!sync.cart().has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_merges_guest_cart_and_clears_store() {
        let store = MemoryGuestStore::with_lines(vec![line("p1", 2, 10)]);
        let mut sync = engine(EchoRemote::default(), store.clone());

        sync.on_session_event(SessionEvent::Authenticated(SessionIdentity::new("c1")))
            .unwrap();
        let notices = sync.settle().await;

        assert!(notices.is_empty());
        assert!(sync.cart().is_hydrated());
        assert_eq!(sync.cart().count(), 2);
        assert!(!store.has_record());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_quantity_is_debounced() {
        let remote = EchoRemote::default();
        let mut sync = engine(remote.clone(), MemoryGuestStore::new());
        sync.on_session_event(SessionEvent::Authenticated(SessionIdentity::new("c1")))
            .unwrap();
        sync.settle().await;
        let after_login = remote.calls.load(Ordering::SeqCst);

        let key = LineKey::product("p9");
        for quantity in [5, 6, 7] {
            sync.set_quantity(&key, quantity).unwrap();
            assert_eq!(sync.cart().line(&key).unwrap().quantity, quantity);
        }
        sync.settle().await;

        assert_eq!(remote.calls.load(Ordering::SeqCst), after_login + 1);
        assert_eq!(sync.cart().line(&key).unwrap().quantity, 7);
        assert!(!sync.cart().has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_not_found_counts_as_success() {
        let mut sync = engine(EchoRemote::default(), MemoryGuestStore::new());
        sync.on_session_event(SessionEvent::Authenticated(SessionIdentity::new("c1")))
            .unwrap();
        sync.settle().await;

        sync.remove(&LineKey::product("p9")).unwrap();
        let notices = sync.settle().await;
        assert!(notices.is_empty());
        assert!(sync.cart().is_empty());
        assert!(sync.cart().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthenticated_response_resets_session() {
        let remote = EchoRemote {
            reject_unauthenticated: true,
            ..EchoRemote::default()
        };
        let store = MemoryGuestStore::new();
        let mut sync = engine(remote, store);
        sync.on_session_event(SessionEvent::Authenticated(SessionIdentity::new("c1")))
            .unwrap();

        let notices = sync.settle().await;
        assert_eq!(notices, vec![CartNotice::SessionExpired]);
        assert!(!sync.session().is_authenticated());
        assert!(!sync.cart().has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_see_every_change() {
        let mut sync = engine(EchoRemote::default(), MemoryGuestStore::new());
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let id = sync.on_cart_changed(move |cart| {
            assert!(cart.is_consistent());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sync.add(intent("p1", 1)).unwrap();
        sync.add(intent("p2", 1)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        assert!(sync.unsubscribe(id));
        sync.remove(&LineKey::product("p1")).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_notice_messages() {
        let notice = CartNotice::ItemsRemoved(RemovalBatch {
            batch_id: "b1".to_string(),
            lines: vec![line("Sunhat", 1, 10)],
        });
        assert_eq!(notice.message(), "Removed from your cart: Sunhat");
        assert_eq!(
            CartNotice::GuestLinesKept { count: 2 }.message(),
            "2 item(s) from your guest cart could not be added yet"
        );
    }
}
