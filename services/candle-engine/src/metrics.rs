//! Observability counters for the candle engine
//!
//! Plain atomics shared behind an `Arc` by the core loop, writer workers,
//! fan-out and relay. `export()` gives a stable, sorted view for logging
//! or a scrape endpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::writer::WriteReport;

/// Core metrics for the engine.
#[derive(Debug)]
pub struct EngineMetrics {
    // Ingestion
    pub ticks_processed: AtomicU64,
    pub ticks_dropped: AtomicU64,
    pub ticks_late: AtomicU64,
    pub tick_processing_ns: Mutex<LatencyTracker>,

    // Candle lifecycle
    pub candles_finalized: AtomicU64,
    pub minute_candles_evicted: AtomicU64,

    // Fan-out
    pub snapshots_published: AtomicU64,
    pub snapshots_throttled: AtomicU64,
    pub subscriber_drops: AtomicU64,

    // Relay
    pub relay_sent: AtomicU64,
    pub relay_dropped: AtomicU64,
    pub relay_failures: AtomicU64,

    // Durable writes
    pub writes_success: AtomicU64,
    pub writes_failed: AtomicU64,
    pub writes_invalid: AtomicU64,
    pub writes_duplicate: AtomicU64,
    pub write_retries: AtomicU64,

    // Scheduler
    pub scheduler_errors: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            ticks_processed: AtomicU64::new(0),
            ticks_dropped: AtomicU64::new(0),
            ticks_late: AtomicU64::new(0),
            tick_processing_ns: Mutex::new(LatencyTracker::new(1000)),
            candles_finalized: AtomicU64::new(0),
            minute_candles_evicted: AtomicU64::new(0),
            snapshots_published: AtomicU64::new(0),
            snapshots_throttled: AtomicU64::new(0),
            subscriber_drops: AtomicU64::new(0),
            relay_sent: AtomicU64::new(0),
            relay_dropped: AtomicU64::new(0),
            relay_failures: AtomicU64::new(0),
            writes_success: AtomicU64::new(0),
            writes_failed: AtomicU64::new(0),
            writes_invalid: AtomicU64::new(0),
            writes_duplicate: AtomicU64::new(0),
            write_retries: AtomicU64::new(0),
            scheduler_errors: AtomicU64::new(0),
        }
    }

    /// Record a tick that reached the candle state.
    pub fn record_tick(&self, latency_ns: u64) {
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.tick_processing_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    /// Record a malformed tick dropped at decode time.
    pub fn record_tick_dropped(&self) {
        self.ticks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record (symbol, timeframe) updates skipped because the bucket was
    /// already finalized.
    pub fn record_late(&self, count: u64) {
        self.ticks_late.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_finalized(&self, count: u64) {
        self.candles_finalized.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: u64) {
        self.minute_candles_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.snapshots_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttled(&self) {
        self.snapshots_throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record snapshots discarded by a full subscriber queue.
    pub fn record_subscriber_drop(&self) {
        self.subscriber_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_sent(&self) {
        self.relay_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_dropped(&self) {
        self.relay_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_failure(&self) {
        self.relay_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one `write_batch` outcome into the totals.
    pub fn record_write(&self, report: &WriteReport) {
        self.writes_success
            .fetch_add(report.success as u64, Ordering::Relaxed);
        self.writes_failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        self.writes_invalid
            .fetch_add(report.invalid as u64, Ordering::Relaxed);
        self.writes_duplicate
            .fetch_add(report.duplicates as u64, Ordering::Relaxed);
    }

    pub fn record_write_retry(&self) {
        self.write_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scheduler_error(&self) {
        self.scheduler_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// p99 tick processing latency in nanoseconds.
    pub fn tick_latency_p99(&self) -> Option<u64> {
        self.tick_processing_ns
            .lock()
            .ok()
            .and_then(|tracker| tracker.percentile(99))
    }

    /// Export counters as a sorted map.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters: [(&str, &AtomicU64); 17] = [
            ("ticks_processed", &self.ticks_processed),
            ("ticks_dropped", &self.ticks_dropped),
            ("ticks_late", &self.ticks_late),
            ("candles_finalized", &self.candles_finalized),
            ("minute_candles_evicted", &self.minute_candles_evicted),
            ("snapshots_published", &self.snapshots_published),
            ("snapshots_throttled", &self.snapshots_throttled),
            ("subscriber_drops", &self.subscriber_drops),
            ("relay_sent", &self.relay_sent),
            ("relay_dropped", &self.relay_dropped),
            ("relay_failures", &self.relay_failures),
            ("writes_success", &self.writes_success),
            ("writes_failed", &self.writes_failed),
            ("writes_invalid", &self.writes_invalid),
            ("writes_duplicate", &self.writes_duplicate),
            ("write_retries", &self.write_retries),
            ("scheduler_errors", &self.scheduler_errors),
        ];
        let mut m: BTreeMap<String, u64> = counters
            .iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect();
        if let Some(p99) = self.tick_latency_p99() {
            m.insert("tick_processing_p99_ns".to_string(), p99);
        }
        m
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding window of latency samples for percentile calculation.
#[derive(Debug)]
pub struct LatencyTracker {
    samples: Vec<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a latency sample, evicting the oldest once full.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counters() {
        let metrics = EngineMetrics::new();
        metrics.record_tick(500);
        metrics.record_tick(1500);
        metrics.record_tick_dropped();
        metrics.record_late(2);

        let exported = metrics.export();
        assert_eq!(exported["ticks_processed"], 2);
        assert_eq!(exported["ticks_dropped"], 1);
        assert_eq!(exported["ticks_late"], 2);
        assert!(exported.contains_key("tick_processing_p99_ns"));
    }

    #[test]
    fn test_write_report_folding() {
        let metrics = EngineMetrics::new();
        metrics.record_write(&WriteReport {
            total: 10,
            success: 6,
            failed: 1,
            invalid: 2,
            duplicates: 1,
        });
        let exported = metrics.export();
        assert_eq!(exported["writes_success"], 6);
        assert_eq!(exported["writes_failed"], 1);
        assert_eq!(exported["writes_invalid"], 2);
        assert_eq!(exported["writes_duplicate"], 1);
    }

    #[test]
    fn test_export_has_every_counter() {
        let exported = EngineMetrics::new().export();
        assert_eq!(exported.len(), 17);
        assert!(exported.values().all(|v| *v == 0));
    }

    #[test]
    fn test_latency_tracker_percentile() {
        let mut tracker = LatencyTracker::new(100);
        for i in 1..=100 {
            tracker.record(i);
        }
        let p99 = tracker.percentile(99).unwrap();
        assert!((98..=100).contains(&p99));
    }

    #[test]
    fn test_latency_tracker_window_eviction() {
        let mut tracker = LatencyTracker::new(3);
        for v in [10, 20, 30, 40] {
            tracker.record(v);
        }
        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.percentile(0), Some(20));
    }
}
