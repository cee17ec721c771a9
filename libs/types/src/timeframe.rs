//! Candle timeframes
//!
//! Fixed-minute timeframes align to the hour; daily and weekly buckets are
//! calendar based and computed by the engine's bucket calculator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::TimeframeError;

/// Supported candle timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    /// 1 minute
    #[serde(rename = "1m")]
    M1,
    /// 5 minutes
    #[serde(rename = "5m")]
    M5,
    /// 15 minutes
    #[serde(rename = "15m")]
    M15,
    /// 30 minutes
    #[serde(rename = "30m")]
    M30,
    /// 1 hour
    #[serde(rename = "1hr")]
    H1,
    /// Trading day, closing at the market close
    #[serde(rename = "1d")]
    D1,
    /// ISO week anchored at Monday 00:00 UTC
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    /// All timeframes, finest first.
    pub fn all() -> &'static [Timeframe] {
        &[
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::D1,
            Timeframe::W1,
        ]
    }

    /// Every timeframe tracked with a single open candle per symbol.
    pub fn higher() -> &'static [Timeframe] {
        &Self::all()[1..]
    }

    /// Bucket width in minutes for fixed timeframes, None for calendar ones.
    pub fn fixed_minutes(&self) -> Option<u32> {
        match self {
            Timeframe::M1 => Some(1),
            Timeframe::M5 => Some(5),
            Timeframe::M15 => Some(15),
            Timeframe::M30 => Some(30),
            Timeframe::H1 => Some(60),
            Timeframe::D1 | Timeframe::W1 => None,
        }
    }

    /// Intraday timeframes are finalized at every market close.
    pub fn is_intraday(&self) -> bool {
        self.fixed_minutes().is_some()
    }

    /// Wire name, also used for relay channel names.
    pub fn name(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1hr",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    /// Durable collection holding finalized candles of this timeframe.
    pub fn collection(&self) -> &'static str {
        match self {
            Timeframe::M1 => "candles_1m",
            Timeframe::M5 => "candles_5m",
            Timeframe::M15 => "candles_15m",
            Timeframe::M30 => "candles_30m",
            Timeframe::H1 => "candles_1hr",
            Timeframe::D1 => "candles_1d",
            Timeframe::W1 => "candles_1w",
        }
    }

    /// Reverse lookup from a collection name.
    pub fn from_collection(collection: &str) -> Option<Timeframe> {
        Self::all()
            .iter()
            .copied()
            .find(|tf| tf.collection() == collection)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Timeframe {
    type Err = TimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|tf| tf.name() == s)
            .ok_or_else(|| TimeframeError::Unknown(s.to_string()))
    }
}
