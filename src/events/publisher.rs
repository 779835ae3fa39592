//! Fan-out of server-pushed events to subscribers.
//!
//! Each subscriber gets its own backlog and at most one drain job on the
//! worker pool at a time, which keeps its events in arrival order while
//! distinct subscribers run in parallel. Delivery follows the subscriber's
//! requested demand.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::subscription_id::SubscriptionId;
use crate::error::ClientError;

/// How often expired events are purged.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// One server-pushed event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    id: SubscriptionId,
    params: Value,
    received_at: DateTime<Utc>,
}

impl Event {
    pub fn new(id: SubscriptionId, params: Value) -> Self {
        Self::at(id, params, Utc::now())
    }

    pub fn at(id: SubscriptionId, params: Value, received_at: DateTime<Utc>) -> Self {
        Self {
            id,
            params,
            received_at,
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

/// Receiver of events for one subscription id.
///
/// `on_next` runs on the worker pool. A panic there is reported through
/// `on_error` and ends the subscription.
pub trait EventSubscriber: Send + Sync {
    /// Called once at registration. Nothing is delivered until
    /// [`Subscription::request`] grants demand.
    fn on_subscribe(&self, subscription: Subscription);
    fn on_next(&self, event: Event);
    fn on_error(&self, error: ClientError);
    fn on_complete(&self);
}

#[derive(Default)]
struct HolderState {
    backlog: VecDeque<Event>,
    demand: u64,
    draining: bool,
    cancelled: bool,
    /// `on_error` or `on_complete` has been called.
    terminated: bool,
}

struct Holder {
    id: SubscriptionId,
    subscriber: Arc<dyn EventSubscriber>,
    state: Mutex<HolderState>,
    runtime: Handle,
}

impl Holder {
    fn lock(&self) -> MutexGuard<'_, HolderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn offer(self: &Arc<Self>, event: Event) {
        {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.backlog.push_back(event);
        }
        self.schedule();
    }

    /// Start a drain job unless one is running or there is nothing to do.
    fn schedule(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            if state.draining || state.cancelled || state.demand == 0 || state.backlog.is_empty() {
                return;
            }
            state.draining = true;
        }
        let holder = Arc::clone(self);
        self.runtime.spawn(async move { holder.drain() });
    }

    fn drain(&self) {
        loop {
            let event = {
                let mut state = self.lock();
                if state.cancelled || state.demand == 0 || state.backlog.is_empty() {
                    state.draining = false;
                    return;
                }
                if state.demand != u64::MAX {
                    state.demand -= 1;
                }
                match state.backlog.pop_front() {
                    Some(event) => event,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };

            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.subscriber.on_next(event))) {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                warn!("Subscriber {} failed: {}", self.id, reason);
                self.fail(ClientError::SubscriberFailed(reason));
                return;
            }
        }
    }

    fn fail(&self, error: ClientError) {
        let first = {
            let mut state = self.lock();
            state.cancelled = true;
            state.draining = false;
            state.backlog.clear();
            !std::mem::replace(&mut state.terminated, true)
        };
        if first {
            self.subscriber.on_error(error);
        }
    }

    fn complete(&self) {
        let first = {
            let mut state = self.lock();
            state.cancelled = true;
            state.backlog.clear();
            !std::mem::replace(&mut state.terminated, true)
        };
        if first {
            self.subscriber.on_complete();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }
}

/// Flow-control handle given to a subscriber.
#[derive(Clone)]
pub struct Subscription {
    holder: Weak<Holder>,
    publisher: Weak<EventPublisher>,
}

impl Subscription {
    /// Allow `n` more events. `u64::MAX` means unbounded.
    pub fn request(&self, n: u64) {
        let Some(holder) = self.holder.upgrade() else {
            return;
        };
        if n == 0 {
            warn!("Ignoring request(0) on subscription {}", holder.id);
            return;
        }
        {
            let mut state = holder.lock();
            state.demand = state.demand.saturating_add(n);
        }
        holder.schedule();
    }

    /// Stop deliveries and forget the subscription.
    pub fn cancel(&self) {
        let Some(holder) = self.holder.upgrade() else {
            return;
        };
        {
            let mut state = holder.lock();
            state.cancelled = true;
            state.backlog.clear();
        }
        if let Some(publisher) = self.publisher.upgrade() {
            publisher.remove(&holder);
        }
        debug!("Subscription {} cancelled", holder.id);
    }

    pub fn is_cancelled(&self) -> bool {
        self.holder.upgrade().map_or(true, |holder| holder.is_cancelled())
    }
}

/// Registry of event subscribers.
pub struct EventPublisher {
    runtime: Handle,
    retention: chrono::Duration,
    holders: Mutex<HashMap<String, Arc<Holder>>>,
    /// Events that arrived before anyone subscribed to them.
    unclaimed: Mutex<VecDeque<Event>>,
    closed: AtomicBool,
}

impl EventPublisher {
    /// `runtime` is the pool deliveries run on; undelivered events older
    /// than `retention` are purged.
    pub fn new(runtime: Handle, retention: Duration) -> Arc<Self> {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        Arc::new(Self {
            runtime,
            retention,
            holders: Mutex::new(HashMap::new()),
            unclaimed: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn holders(&self) -> MutexGuard<'_, HashMap<String, Arc<Holder>>> {
        self.holders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unclaimed(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.unclaimed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `subscriber` for events matching `subscription_id`.
    ///
    /// Previously unclaimed events that match are handed over in arrival order.
    pub fn subscribe(
        self: &Arc<Self>,
        subscription_id: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Result<Subscription, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let id = SubscriptionId::parse(subscription_id)?;
        let holder = Arc::new(Holder {
            id: id.clone(),
            subscriber: Arc::clone(&subscriber),
            state: Mutex::new(HolderState::default()),
            runtime: self.runtime.clone(),
        });
        {
            // Claimed events enter the backlog before the holder becomes
            // visible to `publish`, so they stay ahead of newer events.
            let mut holders = self.holders();
            if holders.contains_key(id.as_str()) {
                return Err(ClientError::Misuse(format!(
                    "Already subscribed to {}",
                    id
                )));
            }
            let mut unclaimed = self.unclaimed();
            let (mine, rest): (VecDeque<Event>, VecDeque<Event>) =
                unclaimed.drain(..).partition(|event| id.matches(event.id()));
            *unclaimed = rest;
            if !mine.is_empty() {
                debug!("Handing {} unclaimed events to {}", mine.len(), id);
            }
            holder.lock().backlog = mine;
            holders.insert(id.as_str().to_string(), Arc::clone(&holder));
        }

        let subscription = Subscription {
            holder: Arc::downgrade(&holder),
            publisher: Arc::downgrade(self),
        };
        subscriber.on_subscribe(subscription.clone());
        holder.schedule();
        Ok(subscription)
    }

    /// Deliver `event` to every matching subscriber.
    pub fn publish(&self, event: Event) {
        let targets: Vec<Arc<Holder>> = {
            let holders = self.holders();
            let targets: Vec<Arc<Holder>> = holders
                .values()
                .filter(|holder| holder.id.matches(event.id()))
                .cloned()
                .collect();
            if targets.is_empty() {
                if self.closed.load(Ordering::Acquire) {
                    debug!("Dropping event {} after close", event.id());
                    return;
                }
                // Parked under the holders lock so a concurrent subscribe
                // cannot miss it.
                self.unclaimed().push_back(event);
                return;
            }
            targets
        };
        for holder in targets {
            holder.offer(event.clone());
        }
    }

    /// Drop undelivered events received before `now - retention` and forget
    /// cancelled subscriptions. Returns the number of events dropped.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now.checked_sub_signed(self.retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut purged = 0;
        {
            let mut unclaimed = self.unclaimed();
            let before = unclaimed.len();
            unclaimed.retain(|event| event.received_at() >= cutoff);
            purged += before - unclaimed.len();
        }
        let mut holders = self.holders();
        holders.retain(|_, holder| !holder.is_cancelled());
        for holder in holders.values() {
            let mut state = holder.lock();
            let before = state.backlog.len();
            state.backlog.retain(|event| event.received_at() >= cutoff);
            purged += before - state.backlog.len();
        }
        if purged > 0 {
            debug!("Purged {} expired events", purged);
        }
        purged
    }

    pub fn subscriber_count(&self) -> usize {
        self.holders().len()
    }

    pub fn unclaimed_count(&self) -> usize {
        self.unclaimed().len()
    }

    /// Complete every subscriber and refuse new ones.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let holders: Vec<Arc<Holder>> = self.holders().drain().map(|(_, holder)| holder).collect();
        self.unclaimed().clear();
        for holder in holders {
            holder.complete();
        }
    }

    /// Run [`purge_expired`](Self::purge_expired) periodically until the
    /// publisher is dropped or closed.
    pub fn spawn_purger(self: &Arc<Self>, every: Duration) {
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(publisher) = weak.upgrade() else {
                    break;
                };
                if publisher.closed.load(Ordering::Acquire) {
                    break;
                }
                publisher.purge_expired(Utc::now());
            }
        });
    }

    fn remove(&self, holder: &Arc<Holder>) {
        let mut holders = self.holders();
        if holders
            .get(holder.id.as_str())
            .is_some_and(|current| Arc::ptr_eq(current, holder))
        {
            holders.remove(holder.id.as_str());
        }
    }
}
