//! Candle Aggregation Engine
//!
//! Consumes a live trade-tick feed and produces:
//! - OHLCV candles for 1m, 5m, 15m, 30m, 1hr, daily and weekly timeframes
//! - Durable candle documents, written in validated batches with retries
//! - Live candle snapshots for local subscribers, throttled per key
//! - A cross-process relay of the same snapshots
//! - Day rebuilds from 1-minute durable records after an outage
//!
//! # Architecture
//!
//! ```text
//!   raw ticks           scheduler timers
//!       │             (sweep, close, evict)
//!   ┌───▼────┐               │ Control
//!   │ Decode │               │
//!   └───┬────┘               │
//!   ┌───▼────────────────────▼───┐
//!   │ Core loop (TickProcessor)  │  ← sole owner of CandleState
//!   └───┬────────────────────┬───┘
//!       │ finals             │ snapshots
//!   ┌───▼────────┐      ┌────▼─────┐
//!   │ WriteQueue │      │  FanOut  │──► subscriber queues
//!   └───┬────────┘      └────┬─────┘
//!   ┌───▼────────┐      ┌────▼─────┐
//!   │ WriterPool │      │  Relay   │
//!   └───┬────────┘      └──────────┘
//!       ▼
//!   CandleStore  ◄──── Recovery (rebuild_day)
//! ```

pub mod backpressure;
pub mod bucket;
pub mod candles;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fanout;
pub mod ingestion;
pub mod metrics;
pub mod processor;
pub mod recovery;
pub mod relay;
pub mod scheduler;
pub mod store;
pub mod writer;

pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle, ShutdownReport};
pub use error::EngineError;

// Service version
pub const SERVICE_VERSION: &str = "0.1.0";
