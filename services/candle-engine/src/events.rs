//! Messages into the core loop
//!
//! Timers and readers never touch candle state directly; they send a
//! `Control` message and the core loop acts on it between ticks.

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use types::candle::Candle;
use types::ids::Symbol;
use types::timeframe::Timeframe;

/// Requests handled by the core loop.
#[derive(Debug)]
pub enum Control {
    /// Finalize 1-minute candles whose bucket has ended.
    Sweep,
    /// Market close reached at `close_at`.
    MarketClose { close_at: DateTime<Utc> },
    /// Drop old 1-minute candles and expired cache entries.
    Evict,
    /// Copy of the latest candle for a key.
    Latest {
        symbol: Symbol,
        timeframe: Timeframe,
        reply: oneshot::Sender<Option<Candle>>,
    },
}

impl Control {
    /// Short label for structured logging.
    pub fn label(&self) -> &'static str {
        match self {
            Control::Sweep => "sweep",
            Control::MarketClose { .. } => "market_close",
            Control::Evict => "evict",
            Control::Latest { .. } => "latest",
        }
    }
}
