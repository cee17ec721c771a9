//! Error types for the candle domain
//!
//! Error taxonomy using thiserror. None of these are fatal to the engine:
//! they describe a single rejected input or a single rejected candle.

use thiserror::Error;

use crate::timeframe::Timeframe;

/// Price conversion errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PriceError {
    #[error("price must be positive, got {0}")]
    NotPositive(String),

    #[error("price is not a finite number")]
    NotFinite,

    #[error("price out of decimal range: {0}")]
    OutOfRange(String),

    #[error("unparseable price: {0}")]
    Unparseable(String),
}

/// Symbol validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SymbolError {
    #[error("symbol must not be empty")]
    Empty,
}

/// Timeframe lookup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeframeError {
    #[error("unknown timeframe: {0}")]
    Unknown(String),
}

/// Timestamp normalization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("unparseable timestamp: {0}")]
    Unparseable(String),

    #[error("timestamp out of range: {0}")]
    OutOfRange(String),
}

/// Raw tick message rejections
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TickError {
    #[error("malformed message: {0}")]
    MalformedJson(String),

    #[error("unexpected service: {service}")]
    UnexpectedService { service: String },

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("payload too short: {len} elements")]
    ShortPayload { len: usize },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(#[from] TimestampError),

    #[error("invalid price: {0}")]
    InvalidPrice(#[from] PriceError),

    #[error("invalid volume: {0}")]
    InvalidVolume(String),

    #[error("empty symbol")]
    EmptySymbol,
}

impl TickError {
    /// Short label for structured logging and counters.
    pub fn label(&self) -> &'static str {
        match self {
            TickError::MalformedJson(_) => "malformed_json",
            TickError::UnexpectedService { .. } => "unexpected_service",
            TickError::MissingField(_) => "missing_field",
            TickError::ShortPayload { .. } => "short_payload",
            TickError::InvalidTimestamp(_) => "invalid_timestamp",
            TickError::InvalidPrice(_) => "invalid_price",
            TickError::InvalidVolume(_) => "invalid_volume",
            TickError::EmptySymbol => "empty_symbol",
        }
    }
}

/// Candle state and document validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CandleError {
    #[error("candle {symbol}/{timeframe} at {bucket_start} is already final")]
    AlreadyFinal {
        symbol: String,
        timeframe: Timeframe,
        bucket_start: String,
    },

    #[error("OHLC invariant violated for {symbol} at {timestamp}: {reason}")]
    InvariantViolation {
        symbol: String,
        timestamp: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_error_display() {
        let err = TickError::ShortPayload { len: 2 };
        assert_eq!(err.to_string(), "payload too short: 2 elements");
        assert_eq!(err.label(), "short_payload");
    }

    #[test]
    fn test_tick_error_from_price_error() {
        let err: TickError = PriceError::NotFinite.into();
        assert!(matches!(err, TickError::InvalidPrice(_)));
        assert_eq!(err.label(), "invalid_price");
    }

    #[test]
    fn test_invariant_violation_display() {
        let err = CandleError::InvariantViolation {
            symbol: "AAPL".to_string(),
            timestamp: "2024-03-15T13:30:00Z".to_string(),
            reason: "low > close".to_string(),
        };
        assert!(err.to_string().contains("AAPL"));
        assert!(err.to_string().contains("low > close"));
    }
}
