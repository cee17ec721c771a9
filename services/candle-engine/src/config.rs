//! Engine configuration
//!
//! Every tunable is read from an `AGGR_*` environment variable with a
//! default. Only the calendar settings can fail validation; malformed
//! numeric values fall back to their defaults.

use std::env;
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::bucket::MarketCalendar;
use crate::error::ConfigError;

/// Tunables for the aggregation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `service` value expected on inbound tick messages.
    pub source_service: String,
    /// Exchange calendar used for daily buckets and the close flush.
    pub calendar: MarketCalendar,

    // ── Scheduler ───────────────────────────────────────────────────
    pub sweep_interval: Duration,
    pub eviction_interval: Duration,
    /// How long finalized 1-minute candles stay in live memory.
    pub minute_retention: Duration,
    /// TTL of the recently-finalized cache.
    pub recent_ttl: Duration,

    // ── Fan-out ─────────────────────────────────────────────────────
    pub throttle_interval: Duration,
    pub subscriber_capacity: usize,
    pub relay_capacity: usize,
    pub relay_prefix: String,

    // ── Durable writes ──────────────────────────────────────────────
    pub write: WriteConfig,

    /// Capacity of the inbound raw tick channel.
    pub tick_capacity: usize,
    /// Capacity of the inbound control channel (scheduler → core loop).
    pub control_capacity: usize,
}

/// Durable write pipeline settings.
#[derive(Debug, Clone)]
pub struct WriteConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    /// Max candles a worker takes from the queue per batch.
    pub max_batch: usize,
    /// Max documents per store call.
    pub chunk_size: usize,
    pub max_retries: u32,
    /// Retry budget used while draining at shutdown.
    pub shutdown_max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            workers: 4,
            max_batch: 500,
            chunk_size: 500,
            max_retries: 3,
            shutdown_max_retries: 8,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(5),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_service: "live_price".to_string(),
            calendar: MarketCalendar::default(),
            sweep_interval: Duration::from_secs(1),
            eviction_interval: Duration::from_secs(300),
            minute_retention: Duration::from_secs(6 * 3600),
            recent_ttl: Duration::from_secs(10),
            throttle_interval: Duration::from_millis(500),
            subscriber_capacity: 256,
            relay_capacity: 4096,
            relay_prefix: "aggr:".to_string(),
            write: WriteConfig::default(),
            tick_capacity: 10_000,
            control_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Build configuration from `AGGR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let write_defaults = WriteConfig::default();

        let timezone_name = env_str("AGGR_MARKET_TZ", "America/New_York");
        let timezone: Tz = timezone_name
            .parse()
            .map_err(|_| ConfigError::InvalidTimezone(timezone_name.clone()))?;

        let close_raw = env_str("AGGR_MARKET_CLOSE", "16:00");
        let close_time = NaiveTime::parse_from_str(&close_raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&close_raw, "%H:%M:%S"))
            .map_err(|_| ConfigError::InvalidCloseTime(close_raw.clone()))?;

        Ok(Self {
            source_service: env_str("AGGR_SOURCE_SERVICE", &defaults.source_service),
            calendar: MarketCalendar::new(timezone, close_time),
            sweep_interval: Duration::from_millis(env_u64(
                "AGGR_SWEEP_INTERVAL_MS",
                defaults.sweep_interval.as_millis() as u64,
            )),
            eviction_interval: Duration::from_secs(env_u64(
                "AGGR_EVICTION_INTERVAL_SECS",
                defaults.eviction_interval.as_secs(),
            )),
            minute_retention: Duration::from_secs(env_u64(
                "AGGR_MINUTE_RETENTION_SECS",
                defaults.minute_retention.as_secs(),
            )),
            recent_ttl: Duration::from_secs(env_u64(
                "AGGR_RECENT_TTL_SECS",
                defaults.recent_ttl.as_secs(),
            )),
            throttle_interval: Duration::from_millis(env_u64(
                "AGGR_THROTTLE_MS",
                defaults.throttle_interval.as_millis() as u64,
            )),
            subscriber_capacity: env_usize("AGGR_SUBSCRIBER_CAPACITY", defaults.subscriber_capacity),
            relay_capacity: env_usize("AGGR_RELAY_CAPACITY", defaults.relay_capacity),
            relay_prefix: env_str("AGGR_RELAY_PREFIX", &defaults.relay_prefix),
            write: WriteConfig {
                queue_capacity: env_usize("AGGR_WRITE_QUEUE_CAPACITY", write_defaults.queue_capacity),
                workers: env_usize("AGGR_WRITER_WORKERS", write_defaults.workers).max(1),
                max_batch: env_usize("AGGR_WRITE_MAX_BATCH", write_defaults.max_batch).max(1),
                chunk_size: env_usize("AGGR_WRITE_CHUNK_SIZE", write_defaults.chunk_size).max(1),
                max_retries: env_u64("AGGR_WRITE_MAX_RETRIES", write_defaults.max_retries as u64)
                    as u32,
                shutdown_max_retries: env_u64(
                    "AGGR_SHUTDOWN_MAX_RETRIES",
                    write_defaults.shutdown_max_retries as u64,
                ) as u32,
                backoff_base: Duration::from_millis(env_u64(
                    "AGGR_WRITE_BACKOFF_MS",
                    write_defaults.backoff_base.as_millis() as u64,
                )),
                backoff_cap: write_defaults.backoff_cap,
            },
            tick_capacity: env_usize("AGGR_TICK_CAPACITY", defaults.tick_capacity).max(1),
            control_capacity: defaults.control_capacity,
        })
    }
}

fn env_str(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
