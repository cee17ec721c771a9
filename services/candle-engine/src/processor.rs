//! Tick processor: the single core loop
//!
//! Owns the candle state and is its only mutator. Each raw message is
//! decoded, applied to every timeframe, and only then published: finals
//! first (unthrottled, also enqueued for durable write), then in-progress
//! snapshots through the throttle. Control messages from the scheduler and
//! readers are interleaved between ticks, never in the middle of one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use types::candle::Candle;
use types::tick::Tick;

use crate::candles::{CandleState, FlushScope};
use crate::events::Control;
use crate::fanout::{FanOut, PublishThrottle};
use crate::ingestion::TickDecoder;
use crate::metrics::EngineMetrics;
use crate::writer::{PendingWrite, WriteQueue, WriteReport};

/// Retention settings applied on `Control::Evict`.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub minute_candles: Duration,
    pub recent_ttl: Duration,
}

/// What the core loop did on its way out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreReport {
    /// Candles force-finalized by the shutdown flush.
    pub flushed: usize,
    /// Ticks drained from the inbound queue after cancellation.
    pub drained_ticks: usize,
}

pub struct TickProcessor {
    state: CandleState,
    decoder: TickDecoder,
    fanout: Arc<FanOut>,
    throttle: PublishThrottle,
    writes: WriteQueue,
    metrics: Arc<EngineMetrics>,
    retention: Retention,
}

impl TickProcessor {
    pub fn new(
        state: CandleState,
        decoder: TickDecoder,
        fanout: Arc<FanOut>,
        throttle: PublishThrottle,
        writes: WriteQueue,
        metrics: Arc<EngineMetrics>,
        retention: Retention,
    ) -> Self {
        Self {
            state,
            decoder,
            fanout,
            throttle,
            writes,
            metrics,
            retention,
        }
    }

    pub fn state(&self) -> &CandleState {
        &self.state
    }

    /// Main loop. Returns after `cancel` fires and the shutdown flush has
    /// been handed to the write queue. Dropping `self` at the end closes
    /// this loop's side of the write queue.
    pub async fn run(
        mut self,
        mut ticks: mpsc::Receiver<String>,
        mut control: mpsc::Receiver<Control>,
        cancel: CancellationToken,
    ) -> CoreReport {
        info!(source = self.decoder.source_service(), "Core loop started");
        let mut ticks_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = control.recv() => {
                    self.handle_control(command, Utc::now()).await;
                }
                raw = ticks.recv(), if ticks_open => match raw {
                    Some(raw) => self.handle_raw(&raw, Utc::now()).await,
                    None => {
                        info!("Tick source closed");
                        ticks_open = false;
                    }
                },
            }
        }

        let mut report = CoreReport::default();
        while let Ok(raw) = ticks.try_recv() {
            self.handle_raw(&raw, Utc::now()).await;
            report.drained_ticks += 1;
        }
        report.flushed = self.flush_all(Utc::now()).await;
        info!(
            flushed = report.flushed,
            drained_ticks = report.drained_ticks,
            "Core loop stopped"
        );
        report
    }

    /// Decode and apply one raw feed message.
    pub async fn handle_raw(&mut self, raw: &str, now: DateTime<Utc>) {
        match self.decoder.decode(raw) {
            Ok(tick) => self.process_tick(&tick, now).await,
            Err(_) => self.metrics.record_tick_dropped(),
        }
    }

    /// Apply a decoded tick, then publish and enqueue.
    pub async fn process_tick(&mut self, tick: &Tick, now: DateTime<Utc>) {
        let started = std::time::Instant::now();
        let outcome = self.state.apply_tick(tick, now);

        if !outcome.late.is_empty() {
            self.metrics.record_late(outcome.late.len() as u64);
        }
        self.emit_finalized(outcome.finalized).await;

        let instant = tokio::time::Instant::now();
        for candle in outcome.updated {
            if self
                .throttle
                .admit(candle.symbol(), candle.timeframe(), false, instant)
            {
                self.fanout.publish(candle.timeframe(), candle.snapshot());
            } else {
                self.metrics.record_throttled();
            }
        }

        self.metrics
            .record_tick(started.elapsed().as_nanos().min(u64::MAX as u128) as u64);
    }

    /// Act on one control message.
    pub async fn handle_control(&mut self, command: Control, now: DateTime<Utc>) {
        debug!(command = command.label(), "Control message");
        match command {
            Control::Sweep => {
                let finalized = self.state.sweep_stale(now);
                if !finalized.is_empty() {
                    debug!(count = finalized.len(), "Stale 1m buckets finalized");
                }
                self.emit_finalized(finalized).await;
            }
            Control::MarketClose { close_at } => {
                let finalized = self
                    .state
                    .force_finalize(FlushScope::MarketClose { close_at }, now);
                info!(close_at = %close_at, finalized = finalized.len(), "Market-close flush");
                self.emit_finalized(finalized).await;
            }
            Control::Evict => {
                let report = self.state.evict(
                    now,
                    self.retention.minute_candles,
                    self.retention.recent_ttl,
                );
                let pruned = self.throttle.prune(tokio::time::Instant::now());
                self.metrics.record_evicted(report.minute_candles as u64);
                debug!(
                    minute_candles = report.minute_candles,
                    recent_entries = report.recent_entries,
                    throttle_keys = pruned,
                    remaining = self.state.minute_count(),
                    "Eviction pass"
                );
            }
            Control::Latest {
                symbol,
                timeframe,
                reply,
            } => {
                // Reader may have gone away; nothing to do then.
                let _ = reply.send(self.state.latest(&symbol, timeframe));
            }
        }
    }

    /// Finalize everything still open, weekly included.
    pub async fn flush_all(&mut self, now: DateTime<Utc>) -> usize {
        let finalized = self.state.force_finalize(FlushScope::Shutdown, now);
        let count = finalized.len();
        self.emit_finalized(finalized).await;
        count
    }

    async fn emit_finalized(&mut self, finalized: Vec<Candle>) {
        if finalized.is_empty() {
            return;
        }
        self.metrics.record_finalized(finalized.len() as u64);
        let instant = tokio::time::Instant::now();

        for candle in &finalized {
            self.throttle
                .admit(candle.symbol(), candle.timeframe(), true, instant);
            self.fanout.publish(candle.timeframe(), candle.snapshot());
        }

        for candle in &finalized {
            if self.writes.enqueue(PendingWrite::from_candle(candle)).await.is_err() {
                self.metrics.record_write(&WriteReport {
                    total: 1,
                    failed: 1,
                    ..WriteReport::default()
                });
                error!(
                    symbol = %candle.symbol(),
                    timeframe = %candle.timeframe(),
                    bucket_start = %candle.bucket_start(),
                    "Write queue closed, finalized candle not persisted"
                );
            }
        }
    }
}
