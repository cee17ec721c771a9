//! Trade ticks and timestamp normalization
//!
//! Feed timestamps arrive either as epoch milliseconds or as ISO-8601
//! strings with or without an offset. Everything is normalized to UTC
//! before a tick reaches the candle state.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::TimestampError;
use crate::ids::Symbol;
use crate::numeric::Price;

/// Naive ISO layouts accepted without an offset (interpreted as UTC).
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// A raw timestamp as supplied by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimestampInput {
    /// Epoch milliseconds
    Millis(i64),
    /// ISO-8601 text, or all-digit epoch milliseconds
    Text(String),
}

impl TimestampInput {
    /// Normalize to a UTC instant.
    pub fn to_utc(&self) -> Result<DateTime<Utc>, TimestampError> {
        match self {
            TimestampInput::Millis(ms) => millis_to_utc(*ms),
            TimestampInput::Text(text) => parse_timestamp_text(text),
        }
    }
}

impl From<i64> for TimestampInput {
    fn from(ms: i64) -> Self {
        TimestampInput::Millis(ms)
    }
}

impl From<&str> for TimestampInput {
    fn from(text: &str) -> Self {
        TimestampInput::Text(text.to_string())
    }
}

/// Convert epoch milliseconds to a UTC instant.
pub fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, TimestampError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| TimestampError::OutOfRange(ms.to_string()))
}

/// Convert float epoch milliseconds, truncating sub-millisecond precision.
pub fn float_millis_to_utc(ms: f64) -> Result<DateTime<Utc>, TimestampError> {
    if !ms.is_finite() || ms.abs() > i64::MAX as f64 {
        return Err(TimestampError::OutOfRange(ms.to_string()));
    }
    millis_to_utc(ms.trunc() as i64)
}

/// Parse an ISO-8601 string (with or without offset) or all-digit epoch millis.
pub fn parse_timestamp_text(text: &str) -> Result<DateTime<Utc>, TimestampError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(TimestampError::Unparseable(text.to_string()));
    }

    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let ms: i64 = trimmed
            .parse()
            .map_err(|_| TimestampError::OutOfRange(trimmed.to_string()))?;
        return millis_to_utc(ms);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    // RFC 3339 requires 'T'; accept a space separator with an offset as well.
    if let Ok(dt) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }

    Err(TimestampError::Unparseable(text.to_string()))
}

/// A validated trade tick. Ephemeral: only its effect on candles is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub price: Price,
    pub timestamp: DateTime<Utc>,
    /// Raw volume if the feed supplied one; zero otherwise.
    pub volume: Decimal,
}

impl Tick {
    pub fn new(symbol: Symbol, price: Price, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol,
            price,
            timestamp,
            volume: Decimal::ZERO,
        }
    }

    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = volume;
        self
    }
}
