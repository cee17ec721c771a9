//! Process wiring
//!
//! `Engine::start` checks the store, builds the channels and spawns the
//! core loop, the writer pool, the relay worker and the timer loops.
//! `EngineHandle` is the only way in from outside: feed raw ticks,
//! subscribe, read the latest candle, shut down.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use types::candle::Candle;
use types::ids::Symbol;
use types::timeframe::Timeframe;

use crate::candles::CandleState;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::Control;
use crate::fanout::{FanOut, PublishThrottle, Subscription};
use crate::ingestion::TickDecoder;
use crate::metrics::EngineMetrics;
use crate::processor::{CoreReport, Retention, TickProcessor};
use crate::relay::{RelayPublisher, RelaySender, RelayWorker};
use crate::scheduler::{supervise, Scheduler};
use crate::store::CandleStore;
use crate::writer::{BatchWriter, WriteQueue, WriterPool};

/// Final accounting returned by `EngineHandle::shutdown`.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Candles force-finalized by the shutdown flush.
    pub flushed: usize,
    pub drained_ticks: usize,
    pub metrics: BTreeMap<String, u64>,
}

/// Entry point for starting the aggregation engine.
pub struct Engine;

impl Engine {
    /// Start every engine task. Fails only if the store is unreachable.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn CandleStore>,
        relay: Option<Arc<dyn RelayPublisher>>,
    ) -> Result<EngineHandle, EngineError> {
        store.ping().await.map_err(EngineError::StoreUnreachable)?;

        let metrics = Arc::new(EngineMetrics::new());
        let cancel = CancellationToken::new();

        // Durable writes
        let (write_queue, write_rx) = WriteQueue::bounded(config.write.queue_capacity);
        let writer = BatchWriter::new(store, &config.write, metrics.clone());
        let pool = WriterPool::new(write_rx, writer, &config.write);
        let writers = (0..config.write.workers.max(1))
            .map(|worker| {
                let pool = pool.clone();
                let shutdown = cancel.clone();
                tokio::spawn(supervise(
                    format!("writer-{worker}"),
                    cancel.clone(),
                    metrics.clone(),
                    move || pool.clone().run_worker(worker, shutdown.clone()),
                ))
            })
            .collect();

        // Relay
        let (relay_sender, relay_task) = match relay {
            Some(publisher) => {
                let (sender, rx) = RelaySender::bounded(config.relay_capacity, metrics.clone());
                let worker = RelayWorker::new(rx, publisher, metrics.clone());
                let task = tokio::spawn(supervise(
                    "relay".to_string(),
                    cancel.clone(),
                    metrics.clone(),
                    move || worker.clone().run(),
                ));
                (Some(sender), Some(task))
            }
            None => (None, None),
        };

        let fanout = FanOut::new(
            config.subscriber_capacity,
            relay_sender,
            config.relay_prefix.clone(),
            metrics.clone(),
        );

        // Core loop
        let (tick_tx, tick_rx) = mpsc::channel(config.tick_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(config.control_capacity.max(1));
        let processor = TickProcessor::new(
            CandleState::new(config.calendar),
            TickDecoder::new(config.source_service.clone()),
            fanout.clone(),
            PublishThrottle::new(config.throttle_interval),
            write_queue,
            metrics.clone(),
            Retention {
                minute_candles: config.minute_retention,
                recent_ttl: config.recent_ttl,
            },
        );
        let core = tokio::spawn(processor.run(tick_rx, control_rx, cancel.clone()));

        // Timers
        let scheduler = Scheduler::new(
            control_tx.clone(),
            config.calendar,
            config.sweep_interval,
            config.eviction_interval,
        );
        let timers = vec![
            spawn_timer("sweep", &scheduler, &cancel, &metrics, Scheduler::sweep_loop),
            spawn_timer("market-close", &scheduler, &cancel, &metrics, Scheduler::market_close_loop),
            spawn_timer("evict", &scheduler, &cancel, &metrics, Scheduler::eviction_loop),
        ];

        info!(
            source = %config.source_service,
            timezone = %config.calendar.timezone(),
            close_time = %config.calendar.close_time(),
            writers = config.write.workers,
            relay = relay_task.is_some(),
            "Candle engine started"
        );

        Ok(EngineHandle {
            ticks: tick_tx,
            control: control_tx,
            fanout,
            metrics,
            cancel,
            core,
            writers,
            relay: relay_task,
            timers,
        })
    }
}

fn spawn_timer<F, Fut>(
    name: &str,
    scheduler: &Arc<Scheduler>,
    cancel: &CancellationToken,
    metrics: &Arc<EngineMetrics>,
    timer: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Scheduler>, CancellationToken) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let scheduler = scheduler.clone();
    let token = cancel.clone();
    tokio::spawn(supervise(
        name.to_string(),
        cancel.clone(),
        metrics.clone(),
        move || timer(scheduler.clone(), token.clone()),
    ))
}

/// Handle to a running engine.
pub struct EngineHandle {
    ticks: mpsc::Sender<String>,
    control: mpsc::Sender<Control>,
    fanout: Arc<FanOut>,
    metrics: Arc<EngineMetrics>,
    cancel: CancellationToken,
    core: JoinHandle<CoreReport>,
    writers: Vec<JoinHandle<()>>,
    relay: Option<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Queue one raw feed message, waiting if the inbound queue is full.
    pub async fn ingest(&self, raw: impl Into<String>) -> Result<(), EngineError> {
        self.ticks
            .send(raw.into())
            .await
            .map_err(|_| EngineError::Stopped)
    }

    /// Extra producer for the inbound tick queue.
    pub fn tick_sender(&self) -> mpsc::Sender<String> {
        self.ticks.clone()
    }

    pub fn subscribe(&self, symbol: Symbol, timeframe: Timeframe) -> Subscription {
        self.fanout.subscribe(symbol, timeframe)
    }

    /// Copy of the open candle, or the most recently finalized one.
    pub async fn latest(
        &self,
        symbol: Symbol,
        timeframe: Timeframe,
    ) -> Result<Option<Candle>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Latest {
                symbol,
                timeframe,
                reply,
            })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Flush and stop everything. Open candles (weekly included) are
    /// finalized, published and written before this returns.
    pub async fn shutdown(self) -> Result<ShutdownReport, EngineError> {
        info!("Candle engine shutting down");
        self.cancel.cancel();

        let mut first_error = None;
        let core = match self.core.await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "Core loop failed during shutdown");
                first_error.get_or_insert(EngineError::Join {
                    name: "core",
                    reason: err.to_string(),
                });
                CoreReport::default()
            }
        };

        join_all("writer", self.writers, &mut first_error).await;
        self.fanout.close();
        join_all("relay", self.relay, &mut first_error).await;
        join_all("timer", self.timers, &mut first_error).await;

        if let Some(err) = first_error {
            return Err(err);
        }

        let report = ShutdownReport {
            flushed: core.flushed,
            drained_ticks: core.drained_ticks,
            metrics: self.metrics.export(),
        };
        info!(
            flushed = report.flushed,
            drained_ticks = report.drained_ticks,
            "Candle engine stopped"
        );
        Ok(report)
    }
}

async fn join_all(
    name: &'static str,
    handles: impl IntoIterator<Item = JoinHandle<()>>,
    first_error: &mut Option<EngineError>,
) {
    for handle in handles {
        if let Err(err) = handle.await {
            error!(task = name, error = %err, "Task failed to join");
            first_error.get_or_insert(EngineError::Join {
                name,
                reason: err.to_string(),
            });
        }
    }
}
