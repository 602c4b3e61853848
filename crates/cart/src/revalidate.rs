//! Background revalidation policy and removal-batch deduplication.
//!
//! [`Revalidator`] decides whether a trigger may start a fetch and remembers
//! which server removal batches were already surfaced. It holds no cart
//! state; the coordinator supplies the facts it needs and performs the
//! fetch.

use std::time::Duration;

use moka::sync::Cache;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::SyncConfig;
use crate::model::RemovalBatch;

/// What asked for a revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevalidationTrigger {
    /// The application regained focus.
    Focus,
    /// The application became visible.
    Visibility,
    /// Periodic background refresh.
    Interval,
    /// Explicit user or caller request.
    Manual,
}

impl RevalidationTrigger {
    /// Whether triggers of this kind are rate limited.
    #[must_use]
    pub const fn is_spaced(self) -> bool {
        matches!(self, Self::Focus | Self::Visibility)
    }
}

/// Why a trigger did or did not start a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidationDecision {
    Started,
    SkippedAnonymous,
    SkippedPendingMutation,
    SkippedTooSoon,
    SkippedInFlight,
}

impl RevalidationDecision {
    #[must_use]
    pub const fn started(self) -> bool {
        matches!(self, Self::Started)
    }
}

/// Facts about the engine a trigger is judged against.
#[derive(Debug, Clone, Copy)]
pub struct EngineActivity {
    pub authenticated: bool,
    pub mutation_pending: bool,
}

pub struct Revalidator {
    min_interval: Duration,
    last_spaced: Option<Instant>,
    in_flight: bool,
    notified: Cache<String, ()>,
}

impl std::fmt::Debug for Revalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Revalidator")
            .field("min_interval", &self.min_interval)
            .field("in_flight", &self.in_flight)
            .field("notified", &self.notified.entry_count())
            .finish_non_exhaustive()
    }
}

impl Revalidator {
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            min_interval: config.revalidate_min_interval,
            last_spaced: None,
            in_flight: false,
            notified: Cache::builder()
                .max_capacity(config.notified_batch_capacity)
                .time_to_live(config.notified_batch_ttl)
                .build(),
        }
    }

    /// Judge a trigger. `Started` marks a fetch in flight until
    /// [`Revalidator::finish`].
    pub fn decide(&mut self, trigger: RevalidationTrigger, activity: EngineActivity) -> RevalidationDecision {
        let decision = if !activity.authenticated {
            RevalidationDecision::SkippedAnonymous
        } else if activity.mutation_pending {
            RevalidationDecision::SkippedPendingMutation
        } else if self.in_flight {
            RevalidationDecision::SkippedInFlight
        } else if trigger.is_spaced()
            && self
                .last_spaced
                .is_some_and(|last| last.elapsed() < self.min_interval)
        {
            RevalidationDecision::SkippedTooSoon
        } else {
            RevalidationDecision::Started
        };

        if decision.started() {
            self.in_flight = true;
            if trigger.is_spaced() {
                self.last_spaced = Some(Instant::now());
            }
        }
        debug!(?trigger, ?decision, "Revalidation trigger");
        decision
    }

    /// Mark the in-flight fetch finished.
    pub const fn finish(&mut self) {
        self.in_flight = false;
    }

    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Record a removal batch. Returns `true` the first time a batch is seen.
    pub fn first_sighting(&self, batch: &RemovalBatch) -> bool {
        let entry = self.notified.entry(batch.batch_id.clone()).or_insert(());
        if !entry.is_fresh() {
            debug!(batch_id = %batch.batch_id, "Removal batch already notified");
        }
        entry.is_fresh()
    }

    /// Forget session-scoped state (on logout or credential expiry).
    pub fn reset(&mut self) {
        self.notified.invalidate_all();
        self.last_spaced = None;
        self.in_flight = false;
    }
}

/// Send `make()` on `tx` every `period` until the receiver is dropped or the
/// task is aborted. The first tick fires after one full period.
#[must_use]
pub fn spawn_interval<M, F>(period: Duration, tx: UnboundedSender<M>, make: F) -> JoinHandle<()>
where
    M: Send + 'static,
    F: Fn() -> M + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.send(make()).is_err() {
                break;
            }
        }
    })
}
