// =============================================================================
// Broadcast Hub — in-process fan-out of bucket flushes and event relays
// =============================================================================
//
// Subscribers register a filter and get a handle with a bounded queue. The
// registry lock is held only for O(1) register/deregister and a brief clone
// of the subscriber list; delivery never holds it across a queue push. A full
// queue triggers the configured slow-consumer policy: close the subscriber
// (default) or evict its oldest message. Either way the hub never blocks the
// flusher.
//
// Dropping a handle deregisters it, so resources reclaim deterministically.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregation::bucket::BucketKey;
use crate::market_data::events::SubscriptionEvent;
use crate::runtime_config::SlowConsumerPolicy;
use crate::store::rows::{ExpiryMetricsRow, StrikeBarRow};
use crate::types::{Indicator, StrikeRange, Timeframe};

/// Hub-local mirror of the configured slow-consumer policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowPolicy {
    DropSubscriber,
    DropOldest,
}

impl From<SlowConsumerPolicy> for SlowPolicy {
    fn from(p: SlowConsumerPolicy) -> Self {
        match p {
            SlowConsumerPolicy::DropSubscriber => Self::DropSubscriber,
            SlowConsumerPolicy::DropOldest => Self::DropOldest,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// What the hub fans out.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    /// A flushed bucket with its strike rows and derived metrics.
    Bucket {
        symbol: String,
        expiry: NaiveDate,
        timeframe: Timeframe,
        bucket_start: i64,
        strikes: Vec<StrikeBarRow>,
        #[serde(skip_serializing_if = "Option::is_none")]
        expiry_metrics: Option<ExpiryMetricsRow>,
    },
    /// A relayed subscription lifecycle event, for auditing consumers.
    Event { event: SubscriptionEvent },
}

impl HubMessage {
    pub fn bucket(
        key: &BucketKey,
        rows: &[StrikeBarRow],
        metrics: Option<&ExpiryMetricsRow>,
    ) -> Self {
        Self::Bucket {
            symbol: key.symbol.clone(),
            expiry: key.expiry,
            timeframe: key.timeframe,
            bucket_start: key.bucket_start,
            strikes: rows.to_vec(),
            expiry_metrics: metrics.cloned(),
        }
    }

    pub fn event(event: &SubscriptionEvent) -> Self {
        Self::Event { event: event.clone() }
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Per-subscriber filter, applied hub-side to cut bandwidth.
///
/// `None` fields match everything. The strike range trims the `strikes`
/// payload; an indicator set keeps only rows that actually carry one of the
/// requested indicators.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub symbols: Option<HashSet<String>>,
    pub expiries: Option<HashSet<NaiveDate>>,
    pub strike_range: Option<StrikeRange>,
    pub indicators: Option<HashSet<Indicator>>,
}

impl SubscriptionFilter {
    /// Apply the filter, returning the (possibly trimmed) message to deliver,
    /// or `None` when nothing survives.
    fn apply(&self, msg: &Arc<HubMessage>) -> Option<Arc<HubMessage>> {
        match msg.as_ref() {
            HubMessage::Event { event } => {
                if let Some(symbols) = &self.symbols {
                    if !symbols.contains(&event.underlying_symbol()) {
                        return None;
                    }
                }
                Some(msg.clone())
            }
            HubMessage::Bucket {
                symbol,
                expiry,
                timeframe,
                bucket_start,
                strikes,
                expiry_metrics,
            } => {
                if let Some(symbols) = &self.symbols {
                    if !symbols.contains(symbol) {
                        return None;
                    }
                }
                if let Some(expiries) = &self.expiries {
                    if !expiries.contains(expiry) {
                        return None;
                    }
                }
                if self.strike_range.is_none() && self.indicators.is_none() {
                    return Some(msg.clone());
                }

                let trimmed: Vec<StrikeBarRow> = strikes
                    .iter()
                    .filter(|r| {
                        self.strike_range
                            .map_or(true, |range| range.contains(r.strike))
                    })
                    .filter(|r| self.row_carries_indicator(r))
                    .cloned()
                    .collect();
                if trimmed.is_empty() {
                    return None;
                }
                Some(Arc::new(HubMessage::Bucket {
                    symbol: symbol.clone(),
                    expiry: *expiry,
                    timeframe: *timeframe,
                    bucket_start: *bucket_start,
                    strikes: trimmed,
                    expiry_metrics: expiry_metrics.clone(),
                }))
            }
        }
    }

    fn row_carries_indicator(&self, row: &StrikeBarRow) -> bool {
        let Some(indicators) = &self.indicators else {
            return true;
        };
        indicators.iter().any(|ind| match ind {
            Indicator::Iv => row.call_iv_avg.is_some() || row.put_iv_avg.is_some(),
            Indicator::Delta => row.call_delta_avg.is_some() || row.put_delta_avg.is_some(),
            Indicator::Gamma => row.call_gamma_avg.is_some() || row.put_gamma_avg.is_some(),
            Indicator::Theta => row.call_theta_avg.is_some() || row.put_theta_avg.is_some(),
            Indicator::Vega => row.call_vega_avg.is_some() || row.put_vega_avg.is_some(),
            Indicator::Volume => row.call_volume > 0.0 || row.put_volume > 0.0,
            Indicator::Oi => row.call_oi_sum.is_some() || row.put_oi_sum.is_some(),
        })
    }
}

// ---------------------------------------------------------------------------
// Subscriber queue + handle
// ---------------------------------------------------------------------------

struct SubscriberQueue {
    messages: Mutex<VecDeque<Arc<HubMessage>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        self.messages.lock().clear();
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn notified_wait(&self) {
        self.notify.notified().await;
    }
}

/// Receiving end handed to a subscriber. Dropping it deregisters.
pub struct SubscriberHandle {
    id: Uuid,
    queue: Arc<SubscriberQueue>,
    hub: Arc<BroadcastHub>,
}

impl SubscriberHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next message, or `None` once the hub closed this subscriber.
    pub async fn recv(&self) -> Option<Arc<HubMessage>> {
        loop {
            if let Some(msg) = self.queue.messages.lock().pop_front() {
                return Some(msg);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.queue.notified_wait().await;
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.hub.deregister(self.id);
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

struct Slot {
    queue: Arc<SubscriberQueue>,
    filter: SubscriptionFilter,
}

pub struct BroadcastHub {
    capacity: usize,
    policy: SlowPolicy,
    subscribers: Mutex<HashMap<Uuid, Slot>>,
    broadcast_dropped_total: AtomicU64,
    subscribers_dropped_total: AtomicU64,
}

impl BroadcastHub {
    pub fn new(capacity: usize, policy: SlowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            subscribers: Mutex::new(HashMap::new()),
            broadcast_dropped_total: AtomicU64::new(0),
            subscribers_dropped_total: AtomicU64::new(0),
        }
    }

    /// Register a subscriber; O(1) under the registry lock.
    pub fn subscribe(self: &Arc<Self>, filter: SubscriptionFilter) -> SubscriberHandle {
        let id = Uuid::new_v4();
        let queue = Arc::new(SubscriberQueue::new());
        self.subscribers.lock().insert(
            id,
            Slot {
                queue: queue.clone(),
                filter,
            },
        );
        debug!(subscriber = %id, "hub subscriber registered");
        SubscriberHandle {
            id,
            queue,
            hub: self.clone(),
        }
    }

    /// Deliver to every live subscriber whose filter matches.
    pub fn broadcast(&self, msg: HubMessage) {
        let msg = Arc::new(msg);

        // Brief lock to snapshot the subscriber list; pushes happen outside.
        let targets: Vec<(Uuid, Arc<SubscriberQueue>, SubscriptionFilter)> = {
            let subs = self.subscribers.lock();
            subs.iter()
                .map(|(id, slot)| (*id, slot.queue.clone(), slot.filter.clone()))
                .collect()
        };

        let mut to_remove = Vec::new();
        for (id, queue, filter) in targets {
            let Some(delivery) = filter.apply(&msg) else {
                continue;
            };
            let mut q = queue.messages.lock();
            if q.len() >= self.capacity {
                match self.policy {
                    SlowPolicy::DropOldest => {
                        q.pop_front();
                        self.broadcast_dropped_total.fetch_add(1, Ordering::Relaxed);
                        q.push_back(delivery);
                        drop(q);
                        queue.notify.notify_one();
                    }
                    SlowPolicy::DropSubscriber => {
                        drop(q);
                        self.broadcast_dropped_total.fetch_add(1, Ordering::Relaxed);
                        warn!(subscriber = %id, "slow subscriber dropped");
                        queue.close();
                        to_remove.push(id);
                    }
                }
            } else {
                q.push_back(delivery);
                drop(q);
                queue.notify.notify_one();
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscribers.lock();
            for id in to_remove {
                subs.remove(&id);
                self.subscribers_dropped_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn deregister(&self, id: Uuid) {
        if self.subscribers.lock().remove(&id).is_some() {
            info!(subscriber = %id, "hub subscriber deregistered");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn broadcast_dropped_total(&self) -> u64 {
        self.broadcast_dropped_total.load(Ordering::Relaxed)
    }

    pub fn subscribers_dropped_total(&self) -> u64 {
        self.subscribers_dropped_total.load(Ordering::Relaxed)
    }
}
