//! Cross-process relay
//!
//! Snapshots are offered to a bounded queue with `try_send` so the
//! publisher never waits. A worker republishes them on a per-timeframe
//! channel (`{prefix}{timeframe}`) and refreshes a "last known" key
//! (`{prefix}last:{timeframe}:{symbol}`). Relay failures are logged and
//! counted only.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use types::candle::CandleSnapshot;
use types::ids::Symbol;
use types::timeframe::Timeframe;

use crate::error::RelayError;
use crate::metrics::EngineMetrics;

/// External pub/sub used to reach other processes.
#[async_trait]
pub trait RelayPublisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), RelayError>;

    async fn set_last(&self, key: &str, payload: &str) -> Result<(), RelayError>;
}

/// One snapshot ready for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub channel: String,
    pub last_key: String,
    pub payload: String,
}

impl RelayMessage {
    pub fn new(
        prefix: &str,
        symbol: &Symbol,
        timeframe: Timeframe,
        snapshot: &CandleSnapshot,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            channel: format!("{prefix}{timeframe}"),
            last_key: format!("{prefix}last:{timeframe}:{symbol}"),
            payload: serde_json::to_string(snapshot)?,
        })
    }
}

/// Non-blocking producer side of the relay queue.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::Sender<RelayMessage>,
    metrics: Arc<EngineMetrics>,
}

impl RelaySender {
    /// Bounded relay queue plus its receiver.
    pub fn bounded(capacity: usize, metrics: Arc<EngineMetrics>) -> (Self, mpsc::Receiver<RelayMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, metrics }, rx)
    }

    /// Offer a message; a full queue drops it.
    pub fn offer(&self, message: RelayMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                self.metrics.record_relay_dropped();
                debug!(channel = %message.channel, "Relay queue full, dropping snapshot");
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_relay_dropped();
            }
        }
    }
}

/// Drains the relay queue into a `RelayPublisher`.
pub struct RelayWorker {
    receiver: tokio::sync::Mutex<mpsc::Receiver<RelayMessage>>,
    publisher: Arc<dyn RelayPublisher>,
    metrics: Arc<EngineMetrics>,
}

impl RelayWorker {
    pub fn new(
        receiver: mpsc::Receiver<RelayMessage>,
        publisher: Arc<dyn RelayPublisher>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            receiver: tokio::sync::Mutex::new(receiver),
            publisher,
            metrics,
        })
    }

    /// Runs until every sender is gone and the queue is empty.
    pub async fn run(self: Arc<Self>) {
        info!("Relay worker started");
        loop {
            let next = self.receiver.lock().await.recv().await;
            let Some(message) = next else {
                break;
            };
            self.forward(&message).await;
        }
        info!("Relay worker stopped");
    }

    async fn forward(&self, message: &RelayMessage) {
        if let Err(err) = self.publisher.publish(&message.channel, &message.payload).await {
            self.metrics.record_relay_failure();
            warn!(channel = %message.channel, error = %err, "Relay publish failed");
            return;
        }
        if let Err(err) = self.publisher.set_last(&message.last_key, &message.payload).await {
            self.metrics.record_relay_failure();
            warn!(key = %message.last_key, error = %err, "Relay last-value update failed");
            return;
        }
        self.metrics.record_relay_sent();
    }
}

/// In-process relay that records everything it is given.
#[derive(Debug, Default)]
pub struct InMemoryRelay {
    published: Mutex<Vec<(String, String)>>,
    last: Mutex<BTreeMap<String, String>>,
    failing: AtomicBool,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// `(channel, payload)` pairs in publish order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn last(&self, key: &str) -> Option<String> {
        self.last.lock().ok().and_then(|last| last.get(key).cloned())
    }

    fn check(&self, channel: &str) -> Result<(), RelayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::PublishFailed {
                channel: channel.to_string(),
                reason: "relay marked failing".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RelayPublisher for InMemoryRelay {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), RelayError> {
        self.check(channel)?;
        let mut published = self
            .published
            .lock()
            .map_err(|_| RelayError::Unavailable("lock poisoned".to_string()))?;
        published.push((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn set_last(&self, key: &str, payload: &str) -> Result<(), RelayError> {
        self.check(key)?;
        let mut last = self
            .last
            .lock()
            .map_err(|_| RelayError::Unavailable("lock poisoned".to_string()))?;
        last.insert(key.to_string(), payload.to_string());
        Ok(())
    }
}
