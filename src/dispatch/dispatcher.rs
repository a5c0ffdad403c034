//! The per-subscription dispatcher.
//!
//! # Dispatch cycle
//!
//! Every trigger (flow permits, acks, redelivery requests, timers, new
//! entries in the log) runs one cycle under the dispatcher's state lock.
//! A cycle repeats rounds until a round makes no progress:
//!
//! ```text
//!  budget = min(credit of eligible consumers, unacked headroom, max batch)
//!     │
//!     ├─ due delayed positions ──► replay pool
//!     ├─ replay pool (dispatch order) ──┐
//!     └─ new entries from cursor ───────┤
//!                                       ▼
//!        filters ─► delayed? ─► key held? ─► select consumer ─► rate limit
//!                                       │
//!                                       ▼
//!                  one send per consumer, accepted prefix is recorded,
//!                  the refused tail goes back to the replay pool
//! ```
//!
//! Backpressure (no credit, unacked ceiling, throttling, unwritable
//! transport) never surfaces as an error; the entry waits in the replay
//! pool and the next trigger picks it up. Throttling and delayed delivery
//! arm one-shot timers so dispatch resumes without an external trigger.
//!
//! # Lifecycle
//!
//! ```text
//!   Open ──close()──► Closing ──teardown done──► Closed
//!    ▲                   │                          │
//!    └──────reset()──────┴──────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DispatchRate, DispatcherConfig};
use crate::dispatch::consumer::{Consumer, ConsumerFlowController};
use crate::dispatch::cursor::CursorRef;
use crate::dispatch::delayed::{DelayedDeliveryTracker, now_millis};
use crate::dispatch::filter::{
    EntryFilter, FilterContext, FilterCounters, FilterResult, apply_filters,
};
use crate::dispatch::hash::sticky_key_hash;
use crate::dispatch::rate_limiter::DispatchRateLimiter;
use crate::dispatch::redelivery::RedeliveryTracker;
use crate::dispatch::selector::{ActiveChange, ConsumerSelector};
use crate::error::{Error, Result};
use crate::metrics;
use crate::retry;
use crate::types::{ConsumerId, Entry, Epoch, MessageMetadata, Position, SubType};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Open,
    Closing,
    Closed,
}

impl DispatcherState {
    fn from_u8(value: u8) -> Self {
        match value {
            OPEN => DispatcherState::Open,
            CLOSING => DispatcherState::Closing,
            _ => DispatcherState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatcherState::Open => "open",
            DispatcherState::Closing => "closing",
            DispatcherState::Closed => "closed",
        }
    }
}

/// Per-consumer view in [`DispatcherStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    pub consumer_id: ConsumerId,
    pub name: String,
    pub permits: u64,
    pub unacked: u64,
    pub blocked: bool,
    pub active: bool,
}

/// Point-in-time snapshot of a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    pub subscription: String,
    pub sub_type: SubType,
    pub state: DispatcherState,
    pub consumers: Vec<ConsumerStats>,
    pub total_unacked: u64,
    pub pending_redeliveries: usize,
    pub delayed_messages: usize,
    pub blocked_on_unacked: bool,
    pub msgs_dispatched: u64,
}

type CloseFuture = Shared<BoxFuture<'static, Result<()>>>;

struct Member {
    consumer: Arc<Consumer>,
    flow: ConsumerFlowController,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    DelayedWakeup,
    ThrottleRetry,
}

struct Timer {
    id: u64,
    deadline_ms: u64,
    handle: JoinHandle<()>,
}

struct DispatchState {
    members: HashMap<ConsumerId, Member>,
    /// Attach order.
    order: Vec<ConsumerId>,
    selector: ConsumerSelector,
    redelivery: RedeliveryTracker,
    delayed: Option<DelayedDeliveryTracker>,
    total_unacked: u64,
    should_rewind: bool,
    wakeup: Option<Timer>,
    throttle_retry: Option<Timer>,
    next_timer_id: u64,
}

impl DispatchState {
    fn cancel_timers(&mut self) {
        for timer in [self.wakeup.take(), self.throttle_retry.take()]
            .into_iter()
            .flatten()
        {
            timer.handle.abort();
        }
    }

    fn release_unacked(&mut self, count: usize) {
        self.total_unacked = self.total_unacked.saturating_sub(count as u64);
    }

    fn recomputed_unacked(&self) -> u64 {
        self.members.values().map(|m| m.flow.unacked()).sum()
    }
}

/// An entry considered for dispatch in the current round.
struct Candidate {
    entry: Entry,
    /// Epoch observed when a replayed entry was picked; `None` for new entries.
    replay_epoch: Option<Epoch>,
    key_hash: u32,
}

#[derive(Debug, Default)]
struct RoundOutcome {
    sent: usize,
    new_read: usize,
    /// Replayed entries that could not be placed and are skipped for the
    /// rest of the cycle.
    parked_replays: usize,
    throttled: bool,
}

fn has_room(
    members: &HashMap<ConsumerId, Member>,
    reserved: &HashMap<ConsumerId, u64>,
    id: ConsumerId,
) -> bool {
    members.get(&id).is_some_and(|member| {
        member.consumer.is_writable()
            && member.flow.available() > reserved.get(&id).copied().unwrap_or(0)
    })
}

struct Inner {
    subscription: String,
    sub_type: SubType,
    config: DispatcherConfig,
    cursor: CursorRef,
    filters: Vec<Arc<dyn EntryFilter>>,
    filter_counters: FilterCounters,
    state: Mutex<DispatchState>,
    lifecycle: AtomicU8,
    close_generation: AtomicU64,
    close_future: Mutex<Option<CloseFuture>>,
    rate_limiter: RwLock<Option<Arc<DispatchRateLimiter>>>,
    total_dispatched: AtomicU64,
    progress_mark: AtomicU64,
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    subscription: String,
    sub_type: SubType,
    cursor: CursorRef,
    config: DispatcherConfig,
    filters: Vec<Arc<dyn EntryFilter>>,
}

impl DispatcherBuilder {
    pub fn new(subscription: impl Into<String>, sub_type: SubType, cursor: CursorRef) -> Self {
        Self {
            subscription: subscription.into(),
            sub_type,
            cursor,
            config: DispatcherConfig::default(),
            filters: Vec::new(),
        }
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a filter; filters run in the order they were added.
    pub fn entry_filter(mut self, filter: Arc<dyn EntryFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        let config = self.config.validated()?;

        let selector = ConsumerSelector::for_sub_type(
            self.sub_type,
            config.failover_partition_index,
            config.key_shared_mode,
            config.key_shared_virtual_nodes,
        );
        let delayed = (config.delayed_delivery_enabled
            && matches!(self.sub_type, SubType::Shared | SubType::KeyShared))
        .then(|| DelayedDeliveryTracker::new(config.delayed_delivery_tick));
        let rate_limiter = config
            .dispatch_rate
            .filter(|rate| rate.is_enabled())
            .map(|rate| Arc::new(DispatchRateLimiter::new(rate)));

        debug!(
            subscription = %self.subscription,
            sub_type = %self.sub_type,
            delayed_delivery = delayed.is_some(),
            rate_limited = rate_limiter.is_some(),
            filters = self.filters.len(),
            "Creating dispatcher"
        );

        Ok(Dispatcher {
            inner: Arc::new(Inner {
                subscription: self.subscription,
                sub_type: self.sub_type,
                cursor: self.cursor,
                filters: self.filters,
                filter_counters: FilterCounters::default(),
                state: Mutex::new(DispatchState {
                    members: HashMap::new(),
                    order: Vec::new(),
                    selector,
                    redelivery: RedeliveryTracker::new(),
                    delayed,
                    total_unacked: 0,
                    should_rewind: false,
                    wakeup: None,
                    throttle_retry: None,
                    next_timer_id: 0,
                }),
                lifecycle: AtomicU8::new(OPEN),
                close_generation: AtomicU64::new(0),
                close_future: Mutex::new(None),
                rate_limiter: RwLock::new(rate_limiter),
                total_dispatched: AtomicU64::new(0),
                progress_mark: AtomicU64::new(0),
                config,
            }),
        })
    }
}

/// Dispatches a subscription's entries to its consumers.
///
/// Cheap to clone; all clones drive the same subscription.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn builder(
        subscription: impl Into<String>,
        sub_type: SubType,
        cursor: CursorRef,
    ) -> DispatcherBuilder {
        DispatcherBuilder::new(subscription, sub_type, cursor)
    }

    pub fn new(
        subscription: impl Into<String>,
        sub_type: SubType,
        cursor: CursorRef,
        config: DispatcherConfig,
    ) -> Result<Self> {
        DispatcherBuilder::new(subscription, sub_type, cursor)
            .config(config)
            .build()
    }

    pub fn subscription(&self) -> &str {
        &self.inner.subscription
    }

    /// Subscription type enforced by this dispatcher. Never changes.
    pub fn sub_type(&self) -> SubType {
        self.inner.sub_type
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.inner.lifecycle.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Acquire) == CLOSED
    }

    fn is_open(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Acquire) == OPEN
    }

    fn sub_label(&self) -> &'static str {
        self.inner.sub_type.as_str()
    }

    // =========================================================================
    // Consumers
    // =========================================================================

    /// Attach a consumer.
    ///
    /// Fails without touching dispatcher state when the dispatcher is not
    /// open, the consumer's declared type differs from the subscription's,
    /// the id is already attached, an exclusive subscription already has a
    /// consumer, or a key-shared selector refuses the consumer's ranges.
    pub async fn add_consumer(&self, consumer: Arc<Consumer>) -> Result<()> {
        if !self.is_open() {
            metrics::record_consumer_event(self.sub_label(), "rejected");
            return Err(Error::Closed(self.inner.subscription.clone()));
        }

        let mut state = self.inner.state.lock().await;
        let subscription = &self.inner.subscription;

        let rejection = if consumer.sub_type() != self.inner.sub_type {
            Some(Error::SubscriptionBusy {
                subscription: subscription.clone(),
                expected: self.inner.sub_type,
                requested: consumer.sub_type(),
            })
        } else if state.members.contains_key(&consumer.id()) {
            Some(Error::ConsumerAssign {
                subscription: subscription.clone(),
                consumer_id: consumer.id(),
                reason: "consumer is already attached".to_string(),
            })
        } else if self.inner.sub_type == SubType::Exclusive && !state.members.is_empty() {
            Some(Error::ConsumerBusy {
                subscription: subscription.clone(),
            })
        } else {
            None
        };
        if let Some(err) = rejection {
            warn!(
                subscription = %subscription,
                consumer_id = %consumer.id(),
                error = %err,
                "Rejected consumer"
            );
            metrics::record_consumer_event(self.sub_label(), "rejected");
            return Err(err);
        }

        let change = match state.selector.add_consumer(subscription, &consumer) {
            Ok(change) => change,
            Err(err) => {
                warn!(
                    subscription = %subscription,
                    consumer_id = %consumer.id(),
                    error = %err,
                    "Rejected consumer"
                );
                metrics::record_consumer_event(self.sub_label(), "rejected");
                return Err(err);
            }
        };

        let id = consumer.id();
        state.order.push(id);
        state.members.insert(
            id,
            Member {
                consumer: consumer.clone(),
                flow: ConsumerFlowController::new(
                    self.inner.config.max_unacked_messages_per_consumer,
                ),
            },
        );

        info!(
            subscription = %subscription,
            sub_type = %self.inner.sub_type,
            consumer_id = %id,
            consumer_name = consumer.name(),
            consumers = state.order.len(),
            "Added consumer"
        );
        metrics::record_consumer_event(self.sub_label(), "added");
        self.publish_gauges(&state);

        if let Some(change) = change {
            self.apply_active_change(&mut state, change).await;
        } else if self.inner.sub_type.is_single_active() {
            consumer
                .transport()
                .notify_active_consumer_change(state.selector.active() == Some(id))
                .await;
        }

        self.dispatch_logged(&mut state).await;
        Ok(())
    }

    /// Detach a consumer. Its unacknowledged entries return to the replay pool.
    pub async fn remove_consumer(&self, consumer_id: ConsumerId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if self
            .detach(&mut state, consumer_id, "consumer_removed")
            .await
            .is_none()
        {
            return Err(Error::ConsumerNotFound {
                subscription: self.inner.subscription.clone(),
                consumer_id,
            });
        }
        info!(
            subscription = %self.inner.subscription,
            consumer_id = %consumer_id,
            consumers = state.order.len(),
            "Removed consumer"
        );
        self.dispatch_logged(&mut state).await;
        Ok(())
    }

    /// Grant `permits` more entries to a consumer and try to dispatch.
    ///
    /// Permits for a consumer that is not attached are ignored.
    pub async fn consumer_flow(&self, consumer_id: ConsumerId, permits: u64) {
        let mut state = self.inner.state.lock().await;
        let Some(member) = state.members.get_mut(&consumer_id) else {
            warn!(
                subscription = %self.inner.subscription,
                consumer_id = %consumer_id,
                permits,
                "Flow permits for unknown consumer ignored"
            );
            return;
        };
        member.flow.add_permits(permits);
        debug!(
            subscription = %self.inner.subscription,
            consumer_id = %consumer_id,
            added = permits,
            available = member.flow.permits(),
            "Flow permits"
        );
        self.dispatch_logged(&mut state).await;
    }

    /// True when at least one live consumer is attached.
    pub async fn is_consumer_connected(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.members.values().any(|m| m.consumer.is_connected())
    }

    /// Attached consumers in attach order. The returned vector is a copy.
    pub async fn consumers(&self) -> Vec<Arc<Consumer>> {
        let state = self.inner.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.members.get(id).map(|m| m.consumer.clone()))
            .collect()
    }

    /// Consumer currently receiving entries on an exclusive or failover
    /// subscription; `None` for shared types.
    pub async fn active_consumer(&self) -> Option<Arc<Consumer>> {
        let state = self.inner.state.lock().await;
        let id = state.selector.active()?;
        state.members.get(&id).map(|m| m.consumer.clone())
    }

    /// True when `consumer_id` is the only consumer and nothing is left
    /// unacknowledged or waiting for redelivery.
    pub async fn can_unsubscribe(&self, consumer_id: ConsumerId) -> bool {
        let state = self.inner.state.lock().await;
        let sole = state.order.len() == 1 && state.order[0] == consumer_id;
        let active_ok =
            !self.inner.sub_type.is_single_active() || state.selector.active() == Some(consumer_id);
        sole && active_ok && state.total_unacked == 0 && state.redelivery.pending_len() == 0
    }

    /// Detach the consumers currently eligible to receive entries (the
    /// active one for exclusive and failover, every consumer otherwise).
    pub async fn disconnect_active_consumers(&self, reset_cursor: bool) -> Result<()> {
        self.disconnect_consumers(true, reset_cursor).await
    }

    /// Detach every consumer without closing the dispatcher.
    pub async fn disconnect_all_consumers(&self, reset_cursor: bool) -> Result<()> {
        self.disconnect_consumers(false, reset_cursor).await
    }

    async fn disconnect_consumers(&self, active_only: bool, reset_cursor: bool) -> Result<()> {
        let (detached, result) = {
            let mut state = self.inner.state.lock().await;
            let targets: Vec<ConsumerId> = if active_only && self.inner.sub_type.is_single_active() {
                state.selector.active().into_iter().collect()
            } else {
                state.order.clone()
            };

            let mut detached = Vec::with_capacity(targets.len());
            for id in targets {
                if let Some(consumer) = self.detach(&mut state, id, "disconnected").await {
                    detached.push(consumer);
                }
            }

            let result = if reset_cursor {
                self.rewind_locked(&mut state).await
            } else {
                Ok(())
            };
            if result.is_ok() {
                self.dispatch_logged(&mut state).await;
            }
            (detached, result)
        };

        for consumer in &detached {
            consumer.transport().disconnect().await;
        }
        info!(
            subscription = %self.inner.subscription,
            disconnected = detached.len(),
            active_only,
            reset_cursor,
            "Disconnected consumers"
        );
        result
    }

    async fn detach(
        &self,
        state: &mut DispatchState,
        consumer_id: ConsumerId,
        reason: &str,
    ) -> Option<Arc<Consumer>> {
        let mut member = state.members.remove(&consumer_id)?;
        state.order.retain(|id| *id != consumer_id);
        member.consumer.mark_disconnected();

        let pending = member.flow.take_pending();
        self.requeue(state, &pending, reason);

        if let Some(change) = state.selector.remove_consumer(consumer_id) {
            self.apply_active_change(state, change).await;
        }
        metrics::record_consumer_event(self.sub_label(), "removed");
        self.publish_gauges(state);
        Some(member.consumer)
    }

    async fn apply_active_change(&self, state: &mut DispatchState, change: ActiveChange) {
        if let Some(previous) = change.previous
            && let Some(member) = state.members.get_mut(&previous)
        {
            let pending = member.flow.take_pending();
            self.requeue(state, &pending, "active_changed");
        }

        let transports: Vec<_> = state
            .order
            .iter()
            .filter_map(|id| {
                state
                    .members
                    .get(id)
                    .map(|m| (*id, m.consumer.transport().clone()))
            })
            .collect();
        for (id, transport) in transports {
            transport
                .notify_active_consumer_change(Some(id) == change.current)
                .await;
        }

        info!(
            subscription = %self.inner.subscription,
            previous = ?change.previous.map(|id| id.value()),
            current = ?change.current.map(|id| id.value()),
            "Active consumer changed"
        );
        metrics::record_consumer_event(self.sub_label(), "active_changed");
    }

    /// Move in-flight positions back to the replay pool.
    fn requeue(&self, state: &mut DispatchState, positions: &[Position], reason: &str) -> usize {
        for position in positions {
            state.redelivery.mark_for_redelivery(*position);
        }
        state.release_unacked(positions.len());
        metrics::record_redelivery(&self.inner.subscription, reason, positions.len() as u64);
        positions.len()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close the dispatcher.
    ///
    /// Teardown disconnects every consumer, cancels timers, drops delayed
    /// state and flushes the cursor. It runs once; every caller awaits the
    /// same completion and observes the same result. A cursor flush that
    /// still fails after retries is reported as [`Error::Teardown`].
    pub async fn close(&self) -> Result<()> {
        let future = {
            let mut slot = self.inner.close_future.lock().await;
            match slot.as_ref() {
                Some(future) => future.clone(),
                None => {
                    self.inner.lifecycle.store(CLOSING, Ordering::Release);
                    metrics::STATE_TRANSITIONS
                        .with_label_values(&[self.sub_label(), "closing"])
                        .inc();
                    let generation = self.inner.close_generation.load(Ordering::Acquire);
                    let this = self.clone();
                    let future = async move { this.teardown(generation).await }
                        .boxed()
                        .shared();
                    // Drive teardown even if every caller drops its future.
                    drop(tokio::spawn(future.clone()));
                    *slot = Some(future.clone());
                    future
                }
            }
        };
        future.await
    }

    async fn teardown(self, generation: u64) -> Result<()> {
        let detached = {
            let mut state = self.inner.state.lock().await;
            state.cancel_timers();

            let ids = std::mem::take(&mut state.order);
            let mut detached = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(mut member) = state.members.remove(&id) {
                    member.consumer.mark_disconnected();
                    let pending = member.flow.take_pending();
                    self.requeue(&mut state, &pending, "closed");
                    state.selector.remove_consumer(id);
                    detached.push(member.consumer);
                }
            }
            if let Some(delayed) = state.delayed.as_mut() {
                delayed.clear();
            }
            self.publish_gauges(&state);
            detached
        };

        for consumer in &detached {
            consumer.transport().disconnect().await;
        }

        let cursor = self.inner.cursor.clone();
        let flushed = retry::with_cursor_policy(|| {
            let cursor = cursor.clone();
            async move { cursor.flush().await }
        })
        .await;

        if self.inner.close_generation.load(Ordering::Acquire) == generation {
            self.inner.lifecycle.store(CLOSED, Ordering::Release);
            metrics::STATE_TRANSITIONS
                .with_label_values(&[self.sub_label(), "closed"])
                .inc();
        }

        match flushed {
            Ok(()) => {
                info!(
                    subscription = %self.inner.subscription,
                    disconnected = detached.len(),
                    "Dispatcher closed"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    subscription = %self.inner.subscription,
                    error = %err,
                    "Dispatcher closed with cursor flush failure"
                );
                Err(Error::Teardown(err.to_string()))
            }
        }
    }

    /// Forget the cached close completion so the next `close()` starts a
    /// fresh teardown. The lifecycle flag is left as is.
    pub async fn reset_close_future(&self) {
        self.inner.close_future.lock().await.take();
    }

    /// Reopen the dispatcher.
    ///
    /// A teardown still in flight finishes its side effects but no longer
    /// marks the dispatcher closed.
    pub async fn reset(&self) {
        let mut slot = self.inner.close_future.lock().await;
        self.inner.close_generation.fetch_add(1, Ordering::AcqRel);
        self.inner.lifecycle.store(OPEN, Ordering::Release);
        slot.take();
        metrics::STATE_TRANSITIONS
            .with_label_values(&[self.sub_label(), "reset"])
            .inc();
        debug!(subscription = %self.inner.subscription, "Dispatcher reset");
    }

    // =========================================================================
    // Acknowledgment and redelivery
    // =========================================================================

    /// Individually acknowledge entries.
    ///
    /// Acks for positions the consumer does not hold, or from a consumer
    /// that already left, still reach the tracker and the cursor.
    ///
    /// Every position is applied even if the cursor rejects one of them;
    /// the first cursor error is returned after the dispatch cycle runs.
    pub async fn acknowledge(&self, consumer_id: ConsumerId, positions: &[Position]) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let mut first_error = None;
        for position in positions {
            if let Some(member) = state.members.get_mut(&consumer_id)
                && member.flow.record_ack(position)
            {
                state.release_unacked(1);
            }
            state.redelivery.mark_acknowledged(position);
            if let Err(err) = self.inner.cursor.mark_delete(*position).await {
                warn!(
                    subscription = %self.inner.subscription,
                    consumer_id = %consumer_id,
                    position = %position,
                    error = %err,
                    "Failed to mark entry deleted"
                );
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        self.publish_gauges(&state);
        self.dispatch_logged(&mut state).await;
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Redeliver everything the consumer has not acknowledged.
    ///
    /// `epoch` is the client's redelivery epoch; a request carrying an older
    /// epoch than one already seen is stale and redelivers nothing.
    /// Returns the number of entries put back.
    pub async fn redeliver_unacknowledged_messages(
        &self,
        consumer_id: ConsumerId,
        epoch: Epoch,
    ) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        let Some(member) = state.members.get_mut(&consumer_id) else {
            return Err(Error::ConsumerNotFound {
                subscription: self.inner.subscription.clone(),
                consumer_id,
            });
        };
        if !member.consumer.advance_epoch(epoch) {
            debug!(
                subscription = %self.inner.subscription,
                consumer_id = %consumer_id,
                epoch = %epoch,
                current = %member.consumer.epoch(),
                "Ignoring stale redelivery request"
            );
            return Ok(0);
        }
        let pending = member.flow.take_pending();
        let count = self.requeue(&mut state, &pending, "consumer_request");
        self.dispatch_logged(&mut state).await;
        Ok(count)
    }

    /// Redeliver specific positions held by the consumer.
    ///
    /// Positions the consumer does not hold are ignored, so a position is
    /// never queued twice.
    pub async fn redeliver_positions(
        &self,
        consumer_id: ConsumerId,
        positions: &[Position],
    ) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        let Some(member) = state.members.get_mut(&consumer_id) else {
            return Err(Error::ConsumerNotFound {
                subscription: self.inner.subscription.clone(),
                consumer_id,
            });
        };
        let held: Vec<Position> = positions
            .iter()
            .copied()
            .filter(|position| member.flow.record_ack(position))
            .collect();
        let count = self.requeue(&mut state, &held, "negative_ack");
        self.dispatch_logged(&mut state).await;
        Ok(count)
    }

    /// Adjust the subscription's unacked counter by `delta`.
    ///
    /// Dispatch stops once the counter reaches the configured ceiling and
    /// resumes as soon as it drops below it.
    pub async fn add_unacked_messages(&self, delta: i64) {
        let mut state = self.inner.state.lock().await;
        let was_blocked = self.blocked_on_unacked(&state);
        state.total_unacked = if delta >= 0 {
            state.total_unacked.saturating_add(delta as u64)
        } else {
            state.total_unacked.saturating_sub(delta.unsigned_abs())
        };
        let blocked = self.blocked_on_unacked(&state);
        if was_blocked != blocked {
            info!(
                subscription = %self.inner.subscription,
                unacked = state.total_unacked,
                blocked,
                "Unacked ceiling state changed"
            );
        }
        self.publish_gauges(&state);
        if was_blocked && !blocked {
            self.dispatch_logged(&mut state).await;
        }
    }

    /// Snapshot of the redelivery tracker.
    pub async fn redelivery_tracker(&self) -> RedeliveryTracker {
        self.inner.state.lock().await.redelivery.clone()
    }

    // =========================================================================
    // Rate limiting
    // =========================================================================

    pub async fn rate_limiter(&self) -> Option<Arc<DispatchRateLimiter>> {
        self.inner.rate_limiter.read().await.clone()
    }

    /// Apply a new dispatch rate. A rate with no limited dimension removes
    /// the limiter.
    pub async fn update_rate_limiter(&self, rate: DispatchRate) {
        {
            let mut limiter = self.inner.rate_limiter.write().await;
            if !rate.is_enabled() {
                *limiter = None;
            } else if let Some(existing) = limiter.as_ref() {
                existing.update(rate).await;
            } else {
                *limiter = Some(Arc::new(DispatchRateLimiter::new(rate)));
            }
        }
        info!(
            subscription = %self.inner.subscription,
            msgs_per_period = rate.msgs_per_period,
            bytes_per_period = rate.bytes_per_period,
            "Updated dispatch rate"
        );
        let mut state = self.inner.state.lock().await;
        self.dispatch_logged(&mut state).await;
    }

    /// Create the limiter from configuration if none exists yet.
    ///
    /// Returns true when a limiter is in place afterwards.
    pub async fn initialize_dispatch_rate_limiter_if_needed(&self) -> bool {
        let mut limiter = self.inner.rate_limiter.write().await;
        if limiter.is_none()
            && let Some(rate) = self.inner.config.dispatch_rate.filter(|r| r.is_enabled())
        {
            *limiter = Some(Arc::new(DispatchRateLimiter::new(rate)));
        }
        limiter.is_some()
    }

    // =========================================================================
    // Delayed delivery
    // =========================================================================

    /// Hold `position` back if its metadata asks for later delivery.
    ///
    /// Always false when delayed delivery is disabled or the subscription
    /// type does not support it.
    pub async fn track_delayed_delivery(
        &self,
        position: Position,
        metadata: &MessageMetadata,
    ) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(deliver_at) = metadata.deliver_at_time_ms else {
            return false;
        };
        let Some(delayed) = state.delayed.as_mut() else {
            return false;
        };
        let tracked = delayed.add_message(position, deliver_at, now_millis());
        if tracked {
            self.schedule_delayed_wakeup(&mut state);
            self.publish_gauges(&state);
        }
        tracked
    }

    pub async fn number_of_delayed_messages(&self) -> usize {
        let state = self.inner.state.lock().await;
        state
            .delayed
            .as_ref()
            .map_or(0, |d| d.number_of_delayed_messages())
    }

    pub async fn clear_delayed_messages(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(delayed) = state.delayed.as_mut() {
            delayed.clear();
        }
        if let Some(timer) = state.wakeup.take() {
            timer.handle.abort();
        }
        self.publish_gauges(&state);
    }

    // =========================================================================
    // Cursor hooks
    // =========================================================================

    /// The cursor's read position was moved externally. The replay pool and
    /// delayed state are dropped and the cursor is rewound before the next
    /// read.
    pub async fn cursor_is_reset(&self) {
        let mut state = self.inner.state.lock().await;
        state.should_rewind = true;
        debug!(subscription = %self.inner.subscription, "Cursor reset, rewind scheduled");
        self.dispatch_logged(&mut state).await;
    }

    /// The cursor's mark-delete position advanced externally. Everything at
    /// or below it counts as acknowledged.
    pub async fn mark_delete_position_move_forward(&self) {
        let mark_delete = self.inner.cursor.mark_delete_position().await;
        let mut state = self.inner.state.lock().await;
        let mut released = 0;
        for member in state.members.values_mut() {
            released += member.flow.remove_up_to(mark_delete);
        }
        state.release_unacked(released);
        let removed = state.redelivery.remove_up_to(mark_delete);
        debug!(
            subscription = %self.inner.subscription,
            mark_delete = %mark_delete,
            released,
            removed,
            "Mark-delete position moved forward"
        );
        self.publish_gauges(&state);
        self.dispatch_logged(&mut state).await;
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Run a dispatch cycle now. Returns how many entries were sent.
    pub async fn read_more_entries(&self) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        self.dispatch(&mut state).await
    }

    /// Reconcile and retry when nothing was dispatched since the last check
    /// although consumers have credit and entries are waiting.
    ///
    /// Returns true when corrective action was taken.
    pub async fn check_and_unblock_if_stuck(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        let mut state = self.inner.state.lock().await;

        let dispatched = self.inner.total_dispatched.load(Ordering::Acquire);
        let last = self.inner.progress_mark.swap(dispatched, Ordering::AcqRel);
        if dispatched != last {
            return false;
        }

        let empty = HashMap::new();
        let has_credit = state
            .order
            .iter()
            .any(|id| has_room(&state.members, &empty, *id));
        if !has_credit {
            return false;
        }

        let recomputed = state.recomputed_unacked();
        if recomputed != state.total_unacked {
            warn!(
                subscription = %self.inner.subscription,
                counted = state.total_unacked,
                recomputed,
                "Reconciled unacked counter"
            );
            state.total_unacked = recomputed;
        }
        if self.blocked_on_unacked(&state) {
            metrics::STUCK_CHECKS
                .with_label_values(&[&self.inner.subscription, "blocked"])
                .inc();
            return false;
        }

        let now = now_millis();
        let has_work = state.redelivery.pending_len() > 0
            || state
                .delayed
                .as_ref()
                .is_some_and(|d| d.has_message_available(now))
            || self.inner.cursor.has_more_entries().await;
        if !has_work {
            return false;
        }

        // A timer that should have fired may have been lost; re-arm from scratch.
        if let Some(timer) = state.wakeup.take() {
            timer.handle.abort();
        }

        let sent = self.dispatch_logged(&mut state).await;
        let outcome = if sent == 0 {
            warn!(
                subscription = %self.inner.subscription,
                pending = state.redelivery.pending_len(),
                unacked = state.total_unacked,
                "Dispatcher still stuck after reconciliation"
            );
            "still_stuck"
        } else {
            info!(
                subscription = %self.inner.subscription,
                sent,
                "Unblocked stuck dispatcher"
            );
            "unblocked"
        };
        metrics::STUCK_CHECKS
            .with_label_values(&[&self.inner.subscription, outcome])
            .inc();
        self.inner
            .progress_mark
            .store(self.inner.total_dispatched.load(Ordering::Acquire), Ordering::Release);
        true
    }

    fn blocked_on_unacked(&self, state: &DispatchState) -> bool {
        let ceiling = self.inner.config.max_unacked_messages_per_subscription;
        ceiling > 0 && state.total_unacked >= ceiling
    }

    fn round_budget(&self, state: &DispatchState) -> usize {
        let empty = HashMap::new();
        let credit: u64 = if self.inner.sub_type.is_single_active() {
            state
                .selector
                .active()
                .filter(|id| has_room(&state.members, &empty, *id))
                .and_then(|id| state.members.get(&id))
                .map_or(0, |m| m.flow.available())
        } else {
            state
                .members
                .values()
                .filter(|m| m.consumer.is_writable())
                .map(|m| m.flow.available())
                .sum()
        };
        let ceiling = self.inner.config.max_unacked_messages_per_subscription;
        let headroom = if ceiling == 0 {
            u64::MAX
        } else {
            ceiling.saturating_sub(state.total_unacked)
        };
        credit
            .min(headroom)
            .min(self.inner.config.max_read_batch_size as u64) as usize
    }

    async fn dispatch_logged(&self, state: &mut DispatchState) -> usize {
        match self.dispatch(state).await {
            Ok(sent) => sent,
            Err(err) => {
                warn!(
                    subscription = %self.inner.subscription,
                    error = %err,
                    "Dispatch cycle failed"
                );
                0
            }
        }
    }

    async fn dispatch(&self, state: &mut DispatchState) -> Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        let started = Instant::now();

        if state.should_rewind {
            self.rewind_locked(state).await?;
        }

        let mut attempted = HashSet::new();
        let mut skipped_new = 0usize;
        let mut total_sent = 0usize;
        loop {
            let outcome = self
                .dispatch_round(state, &mut attempted, &mut skipped_new)
                .await?;
            total_sent += outcome.sent;
            if outcome.throttled {
                self.schedule_throttle_retry(state).await;
                break;
            }
            let progressed = outcome.sent > 0
                || outcome.parked_replays > 0
                || (outcome.new_read > 0 && skipped_new < self.inner.config.max_read_batch_size);
            if !progressed {
                break;
            }
        }

        self.schedule_delayed_wakeup(state);
        self.publish_gauges(state);
        metrics::DISPATCH_ROUND_DURATION
            .with_label_values(&[self.sub_label()])
            .observe(started.elapsed().as_secs_f64());
        if total_sent > 0 {
            debug!(
                subscription = %self.inner.subscription,
                sent = total_sent,
                unacked = state.total_unacked,
                "Dispatch cycle"
            );
        }
        Ok(total_sent)
    }

    async fn rewind_locked(&self, state: &mut DispatchState) -> Result<()> {
        self.inner.cursor.rewind().await?;
        state.should_rewind = false;
        let dropped = state.redelivery.clear_pending();
        if let Some(delayed) = state.delayed.as_mut() {
            delayed.clear();
        }
        if let Some(timer) = state.wakeup.take() {
            timer.handle.abort();
        }
        debug!(
            subscription = %self.inner.subscription,
            dropped,
            "Rewound cursor to mark-delete position"
        );
        Ok(())
    }

    async fn dispatch_round(
        &self,
        state: &mut DispatchState,
        attempted: &mut HashSet<Position>,
        skipped_new: &mut usize,
    ) -> Result<RoundOutcome> {
        let mut outcome = RoundOutcome::default();
        let budget = self.round_budget(state);
        if budget == 0 {
            return Ok(outcome);
        }
        let now = now_millis();

        if let Some(delayed) = state.delayed.as_mut() {
            for position in delayed.scheduled_messages(now, budget) {
                state.redelivery.defer(position, None);
            }
        }

        let mut candidates = Vec::with_capacity(budget);

        let replay: Vec<(Position, Epoch)> = state
            .redelivery
            .pending()
            .filter(|position| !attempted.contains(position))
            .take(budget)
            .map(|position| {
                let epoch = state.redelivery.epoch(&position).unwrap_or(Epoch::ZERO);
                (position, epoch)
            })
            .collect();
        if !replay.is_empty() {
            let positions: Vec<Position> = replay.iter().map(|(p, _)| *p).collect();
            let entries = self.inner.cursor.replay_entries(&positions).await?;

            let found: HashSet<Position> = entries.iter().map(|e| e.position).collect();
            for position in &positions {
                if !found.contains(position) {
                    // Deleted from the log in the meantime.
                    state.redelivery.mark_acknowledged(position);
                }
            }

            let epochs: HashMap<Position, Epoch> = replay.into_iter().collect();
            for entry in entries {
                let Some(epoch) = epochs.get(&entry.position).copied() else {
                    continue;
                };
                let key_hash = sticky_key_hash(entry.metadata.sticky_key());
                candidates.push(Candidate {
                    entry,
                    replay_epoch: Some(epoch),
                    key_hash,
                });
            }
        }

        let remaining = budget.saturating_sub(candidates.len());
        if remaining > 0 && *skipped_new < self.inner.config.max_read_batch_size {
            let entries = self.inner.cursor.read_entries(remaining).await?;
            outcome.new_read = entries.len();
            for entry in entries {
                let key_hash = sticky_key_hash(entry.metadata.sticky_key());
                candidates.push(Candidate {
                    entry,
                    replay_epoch: None,
                    key_hash,
                });
            }
        }
        if candidates.is_empty() {
            return Ok(outcome);
        }

        let limiter = self.inner.rate_limiter.read().await.clone();
        let attempted_before = attempted.len();
        let mut reserved: HashMap<ConsumerId, u64> = HashMap::new();
        let mut assignments: Vec<(ConsumerId, Vec<Candidate>)> = Vec::new();

        for candidate in candidates {
            let position = candidate.entry.position;
            let key_hash = candidate.key_hash;
            let is_new = candidate.replay_epoch.is_none();

            if is_new {
                match self.apply_filters(&candidate.entry) {
                    FilterResult::Accept => {}
                    FilterResult::Reject => {
                        *skipped_new += 1;
                        self.inner.cursor.mark_delete(position).await?;
                        continue;
                    }
                    FilterResult::Reschedule => {
                        *skipped_new += 1;
                        state.redelivery.defer(position, Some(key_hash));
                        continue;
                    }
                }

                if let Some(delayed) = state.delayed.as_mut()
                    && let Some(deliver_at) = candidate.entry.metadata.deliver_at_time_ms
                    && delayed.add_message(position, deliver_at, now)
                {
                    *skipped_new += 1;
                    continue;
                }
            }

            if outcome.throttled {
                Self::park(state, &candidate, skipped_new, attempted);
                continue;
            }

            if is_new
                && self.inner.sub_type == SubType::KeyShared
                && state.redelivery.is_key_pending(key_hash)
                && !self.owner_allows_out_of_order(state, key_hash)
            {
                Self::park(state, &candidate, skipped_new, attempted);
                continue;
            }

            let selected = {
                let members = &state.members;
                let reserved = &reserved;
                state
                    .selector
                    .select(key_hash, &|id| has_room(members, reserved, id))
            };
            let Some(consumer_id) = selected else {
                Self::park(state, &candidate, skipped_new, attempted);
                continue;
            };

            // The key moved to a new owner while an older entry for it is
            // still unacked elsewhere.
            if self.inner.sub_type == SubType::KeyShared
                && Self::key_held_elsewhere(state, consumer_id, key_hash)
            {
                Self::park(state, &candidate, skipped_new, attempted);
                continue;
            }

            if let Some(limiter) = &limiter
                && !limiter.try_acquire(1, candidate.entry.size()).await
            {
                outcome.throttled = true;
                metrics::DISPATCH_THROTTLED
                    .with_label_values(&[&self.inner.subscription])
                    .inc();
                Self::park(state, &candidate, skipped_new, attempted);
                continue;
            }

            match candidate.replay_epoch {
                Some(epoch) => {
                    if !state.redelivery.claim(position, epoch) {
                        attempted.insert(position);
                        continue;
                    }
                }
                None => state.redelivery.mark_dispatched(position, Some(key_hash)),
            }

            *reserved.entry(consumer_id).or_insert(0) += 1;
            match assignments.iter_mut().find(|(id, _)| *id == consumer_id) {
                Some((_, batch)) => batch.push(candidate),
                None => assignments.push((consumer_id, vec![candidate])),
            }
        }

        outcome.parked_replays = attempted.len() - attempted_before;
        for (consumer_id, batch) in assignments {
            outcome.sent += self.send_batch(state, consumer_id, batch).await;
        }
        Ok(outcome)
    }

    /// Leave an entry for a later trigger. Replayed entries are still
    /// pending and are skipped for the rest of this cycle.
    fn park(
        state: &mut DispatchState,
        candidate: &Candidate,
        skipped_new: &mut usize,
        attempted: &mut HashSet<Position>,
    ) {
        let position = candidate.entry.position;
        if candidate.replay_epoch.is_none() {
            *skipped_new += 1;
            state.redelivery.defer(position, Some(candidate.key_hash));
        } else {
            attempted.insert(position);
        }
    }

    fn key_held_elsewhere(state: &DispatchState, owner: ConsumerId, key_hash: u32) -> bool {
        let allows_out_of_order = state
            .members
            .get(&owner)
            .is_some_and(|m| m.consumer.allows_out_of_order_delivery());
        !allows_out_of_order
            && state
                .members
                .iter()
                .any(|(id, m)| *id != owner && m.flow.holds_key(key_hash))
    }

    fn owner_allows_out_of_order(&self, state: &DispatchState, key_hash: u32) -> bool {
        state
            .selector
            .key_owner(key_hash)
            .and_then(|id| state.members.get(&id))
            .is_some_and(|m| m.consumer.allows_out_of_order_delivery())
    }

    fn apply_filters(&self, entry: &Entry) -> FilterResult {
        if self.inner.filters.is_empty() {
            return FilterResult::Accept;
        }
        let ctx = FilterContext {
            subscription: &self.inner.subscription,
            sub_type: self.inner.sub_type,
        };
        let result = apply_filters(&self.inner.filters, entry, &ctx);
        self.inner.filter_counters.record(result);
        let label = match result {
            FilterResult::Accept => "accepted",
            FilterResult::Reject => "rejected",
            FilterResult::Reschedule => "rescheduled",
        };
        metrics::FILTER_RESULTS
            .with_label_values(&[&self.inner.subscription, label])
            .inc();
        result
    }

    async fn send_batch(
        &self,
        state: &mut DispatchState,
        consumer_id: ConsumerId,
        batch: Vec<Candidate>,
    ) -> usize {
        let transport = match state.members.get(&consumer_id) {
            Some(member) => member.consumer.transport().clone(),
            None => {
                for candidate in &batch {
                    state
                        .redelivery
                        .defer(candidate.entry.position, Some(candidate.key_hash));
                }
                return 0;
            }
        };

        let entries: Vec<Entry> = batch.iter().map(|c| c.entry.clone()).collect();
        let offered = entries.len();
        let accepted = match transport.send_messages(entries).await {
            Ok(accepted) => accepted.min(offered),
            Err(err) => {
                warn!(
                    subscription = %self.inner.subscription,
                    consumer_id = %consumer_id,
                    error = %err,
                    "Send to consumer failed"
                );
                0
            }
        };

        let mut bytes = 0;
        for (index, candidate) in batch.into_iter().enumerate() {
            let position = candidate.entry.position;
            if index < accepted {
                let held_key = (self.inner.sub_type == SubType::KeyShared)
                    .then_some(candidate.key_hash);
                if let Some(member) = state.members.get_mut(&consumer_id) {
                    member.flow.record_sent(position, held_key);
                }
                bytes += candidate.entry.size();
            } else {
                state.redelivery.defer(position, Some(candidate.key_hash));
            }
        }
        state.total_unacked += accepted as u64;

        if accepted < offered {
            debug!(
                subscription = %self.inner.subscription,
                consumer_id = %consumer_id,
                offered,
                accepted,
                "Consumer refused part of a batch"
            );
            metrics::record_redelivery(
                &self.inner.subscription,
                "send_refused",
                (offered - accepted) as u64,
            );
        }
        if accepted > 0 {
            self.inner
                .total_dispatched
                .fetch_add(accepted as u64, Ordering::AcqRel);
            metrics::record_dispatch(
                &self.inner.subscription,
                self.sub_label(),
                accepted as u64,
                bytes,
            );
        }
        accepted
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn schedule_delayed_wakeup(&self, state: &mut DispatchState) {
        let next = state.delayed.as_ref().and_then(|d| d.next_wakeup_time());
        let Some(deadline_ms) = next else {
            if let Some(timer) = state.wakeup.take() {
                timer.handle.abort();
            }
            return;
        };
        if state
            .wakeup
            .as_ref()
            .is_some_and(|t| t.deadline_ms == deadline_ms && !t.handle.is_finished())
        {
            return;
        }
        if let Some(timer) = state.wakeup.take() {
            timer.handle.abort();
        }
        let delay = Duration::from_millis(deadline_ms.saturating_sub(now_millis()));
        let timer = self.spawn_timer(state, TimerKind::DelayedWakeup, delay, deadline_ms);
        state.wakeup = Some(timer);
    }

    async fn schedule_throttle_retry(&self, state: &mut DispatchState) {
        if state
            .throttle_retry
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
        {
            return;
        }
        let Some(limiter) = self.inner.rate_limiter.read().await.clone() else {
            return;
        };
        let delay = limiter.retry_delay().await;
        let deadline_ms = now_millis() + delay.as_millis() as u64;
        let timer = self.spawn_timer(state, TimerKind::ThrottleRetry, delay, deadline_ms);
        state.throttle_retry = Some(timer);
    }

    fn spawn_timer(
        &self,
        state: &mut DispatchState,
        kind: TimerKind,
        delay: Duration,
        deadline_ms: u64,
    ) -> Timer {
        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let handle = tokio::spawn(Self::timer_task(
            Arc::downgrade(&self.inner),
            kind,
            id,
            delay,
        ));
        Timer {
            id,
            deadline_ms,
            handle,
        }
    }

    fn timer_task(
        inner: Weak<Inner>,
        kind: TimerKind,
        id: u64,
        delay: Duration,
    ) -> BoxFuture<'static, ()> {
        async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let dispatcher = Dispatcher { inner };
            let mut state = dispatcher.inner.state.lock().await;
            let slot = match kind {
                TimerKind::DelayedWakeup => &mut state.wakeup,
                TimerKind::ThrottleRetry => &mut state.throttle_retry,
            };
            // Clear our own slot so the cycle below can arm a new timer
            // without aborting this task.
            if slot.as_ref().is_some_and(|t| t.id == id) {
                *slot = None;
            }
            dispatcher.dispatch_logged(&mut state).await;
        }
        .boxed()
    }

    // =========================================================================
    // Observability
    // =========================================================================

    fn publish_gauges(&self, state: &DispatchState) {
        let subscription = self.inner.subscription.as_str();
        metrics::CONNECTED_CONSUMERS
            .with_label_values(&[subscription])
            .set(state.order.len() as i64);
        metrics::UNACKED_MESSAGES
            .with_label_values(&[subscription])
            .set(state.total_unacked as i64);
        metrics::DELAYED_MESSAGES
            .with_label_values(&[subscription])
            .set(
                state
                    .delayed
                    .as_ref()
                    .map_or(0, |d| d.number_of_delayed_messages()) as i64,
            );
    }

    pub fn filter_processed_msg_count(&self) -> u64 {
        self.inner.filter_counters.processed()
    }

    pub fn filter_accepted_msg_count(&self) -> u64 {
        self.inner.filter_counters.accepted()
    }

    pub fn filter_rejected_msg_count(&self) -> u64 {
        self.inner.filter_counters.rejected()
    }

    pub fn filter_rescheduled_msg_count(&self) -> u64 {
        self.inner.filter_counters.rescheduled()
    }

    pub async fn stats(&self) -> DispatcherStats {
        let state = self.inner.state.lock().await;
        let active = state.selector.active();
        let consumers = state
            .order
            .iter()
            .filter_map(|id| state.members.get(id))
            .map(|m| ConsumerStats {
                consumer_id: m.consumer.id(),
                name: m.consumer.name().to_string(),
                permits: m.flow.permits(),
                unacked: m.flow.unacked(),
                blocked: m.flow.is_blocked(),
                active: active == Some(m.consumer.id()),
            })
            .collect();
        DispatcherStats {
            subscription: self.inner.subscription.clone(),
            sub_type: self.inner.sub_type,
            state: self.state(),
            consumers,
            total_unacked: state.total_unacked,
            pending_redeliveries: state.redelivery.pending_len(),
            delayed_messages: state
                .delayed
                .as_ref()
                .map_or(0, |d| d.number_of_delayed_messages()),
            blocked_on_unacked: self.blocked_on_unacked(&state),
            msgs_dispatched: self.inner.total_dispatched.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscription", &self.inner.subscription)
            .field("sub_type", &self.inner.sub_type)
            .field("state", &self.state())
            .finish()
    }
}
