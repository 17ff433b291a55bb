// =============================================================================
// Pub/Sub Bus Consumer — options / underlying / events channels
// =============================================================================
//
// Connects to the ticker bus over WebSocket, subscribes to the three logical
// channels, decodes each JSON payload into its typed form, and dispatches:
//
//   options    → aggregation workers, sharded by (symbol, expiry, strike)
//   underlying → spot tracker + underlying-bar persistence
//   events     → backfill engine + hub relay
//
// Each channel owns a bounded drop-oldest buffer between the socket reader
// and its dispatcher, so a stalled downstream can never block the reader;
// overflow drops the oldest message and increments a loss counter. Messages
// for the same instrument stay in publish order end to end: one reader, one
// FIFO buffer per channel, one dispatcher, one FIFO shard queue per worker.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::aggregation::engine::shard_for;
use crate::app_state::HealthCounters;
use crate::backfill::engine::BackfillRequest;
use crate::hub::{BroadcastHub, HubMessage};
use crate::market_data::events::parse_subscription_event;
use crate::market_data::tick::{parse_option_tick, parse_underlying_bar, OptionTick};
use crate::market_data::underlying::UnderlyingTracker;
use crate::store::bars::OptionStore;

// ---------------------------------------------------------------------------
// Channel buffer
// ---------------------------------------------------------------------------

/// Bounded FIFO between the socket reader and a channel dispatcher.
///
/// `push` never blocks: at capacity the oldest entry is evicted and the drop
/// counter incremented. `pop` awaits the next entry.
pub struct ChannelBuffer {
    inner: Mutex<VecDeque<serde_json::Value>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl ChannelBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a payload. Returns `true` if an older payload was evicted.
    pub fn push(&self, value: serde_json::Value) -> bool {
        let evicted = {
            let mut q = self.inner.lock();
            let evicted = if q.len() >= self.capacity {
                q.pop_front();
                true
            } else {
                false
            };
            q.push_back(value);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Await the next payload.
    pub async fn pop(&self) -> serde_json::Value {
        loop {
            if let Some(v) = self.inner.lock().pop_front() {
                return v;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

/// Outer envelope the bus wraps every published payload in.
#[derive(Debug, Deserialize)]
struct BusEnvelope {
    channel: String,
    data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Socket reader plus the three channel buffers.
pub struct BusConsumer {
    bus_url: String,
    options_channel: String,
    underlying_channel: String,
    events_channel: String,
    pub options_buf: Arc<ChannelBuffer>,
    pub underlying_buf: Arc<ChannelBuffer>,
    pub events_buf: Arc<ChannelBuffer>,
    counters: Arc<HealthCounters>,
}

impl BusConsumer {
    pub fn new(
        bus_url: String,
        options_channel: String,
        underlying_channel: String,
        events_channel: String,
        buffer_capacity: usize,
        counters: Arc<HealthCounters>,
    ) -> Self {
        Self {
            bus_url,
            options_channel,
            underlying_channel,
            events_channel,
            options_buf: Arc::new(ChannelBuffer::new(buffer_capacity)),
            underlying_buf: Arc::new(ChannelBuffer::new(buffer_capacity)),
            events_buf: Arc::new(ChannelBuffer::new(buffer_capacity)),
            counters,
        }
    }

    /// Run the reader with its own reconnect loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.run_session(&mut shutdown).await {
                Ok(()) => {
                    info!("bus session ended");
                }
                Err(e) => {
                    error!(error = %e, "bus session error — reconnecting in 5s");
                }
            }
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(5)) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One connect-subscribe-read cycle.
    async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        info!(url = %self.bus_url, "connecting to ticker bus");
        let (ws_stream, _response) = connect_async(&self.bus_url)
            .await
            .context("failed to connect to ticker bus")?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = serde_json::json!({
            "op": "subscribe",
            "channels": [
                self.options_channel,
                self.underlying_channel,
                self.events_channel,
            ],
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("failed to send subscribe frame")?;
        info!(
            options = %self.options_channel,
            underlying = %self.underlying_channel,
            events = %self.events_channel,
            "bus channels subscribed"
        );

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.route(&text),
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("bus sent close frame");
                            return Ok(());
                        }
                        Some(Ok(_)) => {
                            // Pong / Binary / Frame — nothing to do.
                        }
                        Some(Err(e)) => {
                            return Err(e).context("bus read error");
                        }
                        None => {
                            warn!("bus stream ended");
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown — closing bus connection");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    /// Decode the envelope and push into the matching channel buffer.
    fn route(&self, text: &str) {
        self.counters.bus_messages_total.fetch_add(1, Ordering::Relaxed);

        let envelope: BusEnvelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                self.counters.decode_errors_total.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "unparseable bus frame dropped");
                return;
            }
        };

        let evicted = if envelope.channel == self.options_channel {
            self.options_buf.push(envelope.data)
        } else if envelope.channel == self.underlying_channel {
            self.underlying_buf.push(envelope.data)
        } else if envelope.channel == self.events_channel {
            self.events_buf.push(envelope.data)
        } else {
            debug!(channel = %envelope.channel, "message for unsubscribed channel dropped");
            return;
        };

        if evicted {
            self.counters
                .channel_dropped_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatchers
// ---------------------------------------------------------------------------

/// Drain the options buffer into the sharded aggregation workers.
///
/// Sharding by (symbol, expiry, strike) keeps both sides of a strike on the
/// same single-threaded worker, which is what makes the one-writer-per-bucket
/// contract hold.
pub async fn run_options_dispatcher(
    buffer: Arc<ChannelBuffer>,
    shards: Vec<mpsc::Sender<OptionTick>>,
    counters: Arc<HealthCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let n = shards.len();
    loop {
        let payload = tokio::select! {
            p = buffer.pop() => p,
            _ = shutdown.changed() => {
                info!("options dispatcher stopping");
                return;
            }
        };

        let tick = match parse_option_tick(&payload) {
            Ok(t) => t,
            Err(e) => {
                // Decode failures are silent; validation failures warrant a warn.
                if payload.get("symbol").is_some() {
                    counters
                        .validation_errors_total
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "option tick failed validation");
                } else {
                    counters.decode_errors_total.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }
        };

        if tick.is_mock {
            counters.mock_dropped_total.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let shard = shard_for(&tick.symbol, tick.expiry, tick.strike, n);
        // Awaiting here applies backpressure toward the channel buffer, which
        // absorbs the burst and sheds oldest-first; the socket reader is never
        // blocked.
        if shards[shard].send(tick).await.is_err() {
            warn!("aggregation shard closed — stopping options dispatcher");
            return;
        }
        counters.ticks_ingested_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Drain the underlying buffer: update the spot tracker and persist bars.
pub async fn run_underlying_dispatcher(
    buffer: Arc<ChannelBuffer>,
    tracker: Arc<UnderlyingTracker>,
    store: Arc<OptionStore>,
    counters: Arc<HealthCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let payload = tokio::select! {
            p = buffer.pop() => p,
            _ = shutdown.changed() => {
                info!("underlying dispatcher stopping");
                return;
            }
        };

        let bar = match parse_underlying_bar(&payload) {
            Ok(b) => b,
            Err(e) => {
                if payload.get("symbol").is_some() {
                    counters
                        .validation_errors_total
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "underlying bar failed validation");
                } else {
                    counters.decode_errors_total.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }
        };

        if bar.is_mock {
            counters.mock_dropped_total.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        tracker.update(&bar);

        if let Err(e) = store.upsert_underlying_bars(std::slice::from_ref(&bar)).await {
            counters.store_errors_total.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = %bar.symbol, error = %e, "underlying bar upsert failed");
        }
    }
}

/// Drain the events buffer: relay to the hub and hand off to backfill.
pub async fn run_events_dispatcher(
    buffer: Arc<ChannelBuffer>,
    backfill_tx: mpsc::Sender<BackfillRequest>,
    hub: Arc<BroadcastHub>,
    enable_backfill: bool,
    counters: Arc<HealthCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let payload = tokio::select! {
            p = buffer.pop() => p,
            _ = shutdown.changed() => {
                info!("events dispatcher stopping");
                return;
            }
        };

        let event = match parse_subscription_event(&payload) {
            Ok(ev) => ev,
            Err(e) => {
                counters.decode_errors_total.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "unparseable subscription event dropped");
                continue;
            }
        };

        counters.events_total.fetch_add(1, Ordering::Relaxed);
        info!(
            event_type = %event.event_type,
            tradingsymbol = %event.metadata.tradingsymbol,
            token = event.instrument_token,
            "subscription event received"
        );

        // Relay for auditing consumers regardless of backfill handling.
        hub.broadcast(HubMessage::event(&event));

        if enable_backfill {
            if let Some(req) = BackfillRequest::from_event(&event) {
                // Fire-and-forget toward the dispatcher; a full queue only
                // delays the immediate backfill, the scheduled scan covers it.
                if let Err(e) = backfill_tx.try_send(req) {
                    warn!(error = %e, "backfill queue full — deferring to scheduled scan");
                }
            }
        }
    }
}
