//! Publish/subscribe fan-out
//!
//! Registry from (symbol, timeframe) to subscriber queues. `publish` pushes
//! a copy of the snapshot into every registered queue (drop-oldest when a
//! subscriber lags) and offers it to the cross-process relay. Neither path
//! ever waits.
//!
//! Delivery is best effort and at most once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use types::candle::CandleSnapshot;
use types::ids::{Symbol, SubscriberId};
use types::timeframe::Timeframe;

use crate::backpressure::{PushOutcome, SubscriberQueue};
use crate::metrics::EngineMetrics;
use crate::relay::{RelayMessage, RelaySender};

type Key = (Symbol, Timeframe);

#[derive(Default)]
struct Registry {
    by_key: BTreeMap<Key, BTreeMap<SubscriberId, Arc<SubscriberQueue>>>,
    by_id: BTreeMap<SubscriberId, Key>,
}

/// Subscriber registry and delivery.
pub struct FanOut {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    capacity: usize,
    relay: Mutex<Option<RelaySender>>,
    relay_prefix: String,
    metrics: Arc<EngineMetrics>,
    closed: AtomicBool,
}

impl FanOut {
    pub fn new(
        capacity: usize,
        relay: Option<RelaySender>,
        relay_prefix: impl Into<String>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            relay: Mutex::new(relay),
            relay_prefix: relay_prefix.into(),
            metrics,
            closed: AtomicBool::new(false),
        })
    }

    /// Register a subscriber for (symbol, timeframe).
    pub fn subscribe(self: &Arc<Self>, symbol: Symbol, timeframe: Timeframe) -> Subscription {
        let id = SubscriberId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(SubscriberQueue::new(self.capacity));

        if self.closed.load(Ordering::SeqCst) {
            queue.close();
        } else if let Ok(mut registry) = self.registry.lock() {
            registry
                .by_key
                .entry((symbol.clone(), timeframe))
                .or_default()
                .insert(id, queue.clone());
            registry.by_id.insert(id, (symbol.clone(), timeframe));
        }
        debug!(subscriber = %id, symbol = %symbol, timeframe = %timeframe, "Subscriber registered");

        Subscription {
            id,
            symbol,
            timeframe,
            queue,
            fanout: Arc::downgrade(self),
        }
    }

    /// Remove a subscriber. Unknown or already-removed ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let Ok(mut registry) = self.registry.lock() else {
            return false;
        };
        let Some(key) = registry.by_id.remove(&id) else {
            return false;
        };
        let mut removed = None;
        if let Some(subscribers) = registry.by_key.get_mut(&key) {
            removed = subscribers.remove(&id);
            if subscribers.is_empty() {
                registry.by_key.remove(&key);
            }
        }
        drop(registry);
        if let Some(queue) = removed {
            queue.close();
        }
        debug!(subscriber = %id, "Subscriber removed");
        true
    }

    /// Deliver a snapshot to local subscribers and the relay.
    ///
    /// Returns the number of local subscribers it was queued for.
    pub fn publish(&self, timeframe: Timeframe, snapshot: CandleSnapshot) -> usize {
        let symbol = snapshot.document.ticker_id.clone();
        let queues: Vec<Arc<SubscriberQueue>> = self
            .registry
            .lock()
            .map(|registry| {
                registry
                    .by_key
                    .get(&(symbol.clone(), timeframe))
                    .map(|subscribers| subscribers.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        for queue in &queues {
            match queue.push(snapshot.clone()) {
                PushOutcome::Queued => delivered += 1,
                PushOutcome::DroppedOldest => {
                    delivered += 1;
                    self.metrics.record_subscriber_drop();
                }
                PushOutcome::Closed => {}
            }
        }

        self.relay_snapshot(&symbol, timeframe, &snapshot);
        self.metrics.record_published();
        delivered
    }

    /// Subscribers currently registered for a key.
    pub fn subscriber_count(&self, symbol: &Symbol, timeframe: Timeframe) -> usize {
        self.registry
            .lock()
            .map(|registry| {
                registry
                    .by_key
                    .get(&(symbol.clone(), timeframe))
                    .map_or(0, BTreeMap::len)
            })
            .unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.registry
            .lock()
            .map(|registry| registry.by_id.len())
            .unwrap_or(0)
    }

    /// Close every subscriber queue and release the relay sender so the
    /// relay worker can drain and stop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let queues: Vec<Arc<SubscriberQueue>> = match self.registry.lock() {
            Ok(mut registry) => {
                registry.by_id.clear();
                std::mem::take(&mut registry.by_key)
                    .into_values()
                    .flat_map(BTreeMap::into_values)
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        for queue in &queues {
            queue.close();
        }
        if let Ok(mut relay) = self.relay.lock() {
            relay.take();
        }
        info!(subscribers = queues.len(), "Fan-out closed");
    }

    fn relay_snapshot(&self, symbol: &Symbol, timeframe: Timeframe, snapshot: &CandleSnapshot) {
        let Ok(relay) = self.relay.lock() else {
            return;
        };
        let Some(sender) = relay.as_ref() else {
            return;
        };
        match RelayMessage::new(&self.relay_prefix, symbol, timeframe, snapshot) {
            Ok(message) => sender.offer(message),
            Err(err) => {
                self.metrics.record_relay_failure();
                warn!(symbol = %symbol, timeframe = %timeframe, error = %err, "Snapshot serialization failed");
            }
        }
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    symbol: Symbol,
    timeframe: Timeframe,
    queue: Arc<SubscriberQueue>,
    fanout: Weak<FanOut>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Next snapshot; `None` once the subscription is closed and drained.
    pub async fn recv(&self) -> Option<CandleSnapshot> {
        self.queue.pop().await
    }

    pub fn try_recv(&self) -> Option<CandleSnapshot> {
        self.queue.try_pop()
    }

    /// Snapshots lost to the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.unsubscribe(self.id);
        }
    }
}

/// Rate limit for in-progress snapshots per (symbol, timeframe).
///
/// Final snapshots always pass and clear the key, so the first update of
/// the next bucket is delivered straight away.
#[derive(Debug)]
pub struct PublishThrottle {
    interval: Duration,
    last_sent: BTreeMap<Key, Instant>,
}

impl PublishThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: BTreeMap::new(),
        }
    }

    /// Whether a snapshot for `key` may go out at `now`.
    pub fn admit(&mut self, symbol: &Symbol, timeframe: Timeframe, is_final: bool, now: Instant) -> bool {
        let key = (symbol.clone(), timeframe);
        if is_final {
            self.last_sent.remove(&key);
            return true;
        }
        match self.last_sent.get(&key) {
            Some(last) if now.saturating_duration_since(*last) < self.interval => false,
            _ => {
                self.last_sent.insert(key, now);
                true
            }
        }
    }

    /// Forget keys idle for longer than the interval.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.last_sent.len();
        let interval = self.interval;
        self.last_sent
            .retain(|_, last| now.saturating_duration_since(*last) < interval);
        before - self.last_sent.len()
    }

    pub fn tracked(&self) -> usize {
        self.last_sent.len()
    }
}
