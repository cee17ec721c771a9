//! OHLCV candle state and its durable/live representations
//!
//! A `Candle` is the mutable in-memory state for one (symbol, timeframe,
//! bucket). It only changes through methods that keep the OHLC invariant:
//! `high >= max(open, close)`, `low <= min(open, close)`, `open` fixed
//! after the first tick, `final` set at most once.
//!
//! `CandleDocument` is the durable shape (one per finalized candle) and
//! `CandleSnapshot` is the live shape (document plus `final` flag).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::CandleError;
use crate::ids::Symbol;
use crate::numeric::Price;
use crate::timeframe::Timeframe;

/// Half-open time interval `[start, end)` covered by one candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Bucket {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Whether `ts` falls inside `[start, end)`.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// A single OHLCV candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    symbol: Symbol,
    timeframe: Timeframe,
    bucket: Bucket,
    open: Price,
    high: Price,
    low: Price,
    close: Price,
    volume: Decimal,
    is_final: bool,
}

impl Candle {
    /// Create a new candle from the first tick in its bucket.
    pub fn open(
        symbol: Symbol,
        timeframe: Timeframe,
        bucket: Bucket,
        price: Price,
        volume: Decimal,
    ) -> Self {
        Self {
            symbol,
            timeframe,
            bucket,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: volume.max(Decimal::ZERO),
            is_final: false,
        }
    }

    /// Update the candle with a new tick in the same bucket.
    pub fn apply(&mut self, price: Price, volume: Decimal) -> Result<(), CandleError> {
        self.ensure_open()?;
        self.widen(price);
        self.close = price;
        if volume > Decimal::ZERO {
            self.volume += volume;
        }
        Ok(())
    }

    /// Overwrite the close (market-close synchronization), widening the
    /// range if the synchronized price falls outside it.
    pub fn sync_close(&mut self, price: Price) -> Result<(), CandleError> {
        self.ensure_open()?;
        self.widen(price);
        self.close = price;
        Ok(())
    }

    /// Mark final. Returns true on the false → true transition, false if
    /// the candle was already final.
    pub fn finalize(&mut self) -> bool {
        if self.is_final {
            return false;
        }
        self.is_final = true;
        true
    }

    /// Validate candle integrity (OHLC invariants).
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= Decimal::ZERO
            && self.bucket.end > self.bucket.start
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn bucket(&self) -> Bucket {
        self.bucket
    }

    pub fn bucket_start(&self) -> DateTime<Utc> {
        self.bucket.start
    }

    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket.end
    }

    pub fn open_price(&self) -> Price {
        self.open
    }

    pub fn high(&self) -> Price {
        self.high
    }

    pub fn low(&self) -> Price {
        self.low
    }

    pub fn close(&self) -> Price {
        self.close
    }

    pub fn volume(&self) -> Decimal {
        self.volume
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Durable document for this candle.
    pub fn to_document(&self) -> CandleDocument {
        CandleDocument {
            ticker_id: self.symbol.clone(),
            timestamp: self.bucket.start,
            open: self.open.as_decimal(),
            high: self.high.as_decimal(),
            low: self.low.as_decimal(),
            close: self.close.as_decimal(),
            volume: self.volume,
        }
    }

    /// Live snapshot (a copy; never a reference into engine state).
    pub fn snapshot(&self) -> CandleSnapshot {
        CandleSnapshot {
            document: self.to_document(),
            is_final: self.is_final,
        }
    }

    fn ensure_open(&self) -> Result<(), CandleError> {
        if self.is_final {
            return Err(CandleError::AlreadyFinal {
                symbol: self.symbol.to_string(),
                timeframe: self.timeframe,
                bucket_start: self.bucket.start.to_rfc3339(),
            });
        }
        Ok(())
    }

    fn widen(&mut self, price: Price) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
    }
}

/// Durable candle document: one per finalized candle per collection.
///
/// Uniquely keyed by `(tickerID, timestamp)` where `timestamp` is the
/// bucket start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleDocument {
    #[serde(rename = "tickerID")]
    pub ticker_id: Symbol,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,
}

impl CandleDocument {
    /// Pre-write validation gate.
    pub fn validate(&self) -> Result<(), CandleError> {
        let reason = if self.ticker_id.as_str().is_empty() {
            Some("empty tickerID")
        } else if self.open <= Decimal::ZERO
            || self.high <= Decimal::ZERO
            || self.low <= Decimal::ZERO
            || self.close <= Decimal::ZERO
        {
            Some("non-positive price")
        } else if self.high < self.open || self.high < self.close {
            Some("high < max(open, close)")
        } else if self.low > self.open || self.low > self.close {
            Some("low > min(open, close)")
        } else if self.volume < Decimal::ZERO {
            Some("negative volume")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(CandleError::InvariantViolation {
                symbol: self.ticker_id.to_string(),
                timestamp: self.timestamp.to_rfc3339(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Uniqueness key in a collection.
    pub fn key(&self) -> (Symbol, DateTime<Utc>) {
        (self.ticker_id.clone(), self.timestamp)
    }
}

/// Live candle snapshot: the durable document shape plus `final`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleSnapshot {
    #[serde(flatten)]
    pub document: CandleDocument,
    #[serde(rename = "final")]
    pub is_final: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn px(s: &str) -> Price {
        Price::from_str(s).unwrap()
    }

    fn minute_bucket() -> Bucket {
        let start = Utc.with_ymd_and_hms(2024, 3, 15, 13, 30, 0).unwrap();
        Bucket::new(start, start + chrono::Duration::minutes(1))
    }

    fn new_candle(price: &str) -> Candle {
        Candle::open(
            Symbol::new("AAPL"),
            Timeframe::M1,
            minute_bucket(),
            px(price),
            Decimal::ZERO,
        )
    }

    #[test]
    fn test_candle_creation() {
        let candle = new_candle("150.00");
        assert_eq!(candle.open_price(), px("150"));
        assert_eq!(candle.high(), px("150"));
        assert_eq!(candle.low(), px("150"));
        assert_eq!(candle.close(), px("150"));
        assert_eq!(candle.volume(), Decimal::ZERO);
        assert!(!candle.is_final());
        assert!(candle.is_valid());
    }

    #[test]
    fn test_candle_update() {
        let mut candle = new_candle("150.00");
        candle.apply(px("151.00"), Decimal::ZERO).unwrap(); // New high
        candle.apply(px("149.50"), Decimal::from(3)).unwrap(); // New low

        assert_eq!(candle.open_price(), px("150"));
        assert_eq!(candle.high(), px("151"));
        assert_eq!(candle.low(), px("149.5"));
        assert_eq!(candle.close(), px("149.5"));
        assert_eq!(candle.volume(), Decimal::from(3));
        assert!(candle.is_valid());
    }

    #[test]
    fn test_finalize_once() {
        let mut candle = new_candle("150.00");
        assert!(candle.finalize());
        assert!(!candle.finalize());
        assert!(candle.is_final());
    }

    #[test]
    fn test_final_candle_rejects_updates() {
        let mut candle = new_candle("150.00");
        candle.finalize();
        let err = candle.apply(px("152"), Decimal::ZERO).unwrap_err();
        assert!(matches!(err, CandleError::AlreadyFinal { .. }));
        assert_eq!(candle.close(), px("150"));
    }

    #[test]
    fn test_sync_close_widens_range() {
        let mut candle = new_candle("300");
        candle.apply(px("302"), Decimal::ZERO).unwrap();
        candle.sync_close(px("303.5")).unwrap();
        assert_eq!(candle.close(), px("303.5"));
        assert_eq!(candle.high(), px("303.5"));
        assert!(candle.is_valid());
    }

    #[test]
    fn test_document_validation() {
        let doc = new_candle("150").to_document();
        assert!(doc.validate().is_ok());

        let invalid = CandleDocument {
            low: Decimal::from(160),
            ..doc
        };
        assert!(matches!(
            invalid.validate(),
            Err(CandleError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_snapshot_shape() {
        let mut candle = new_candle("150.5");
        candle.finalize();
        let json = serde_json::to_value(candle.snapshot()).unwrap();
        assert_eq!(json["tickerID"], "AAPL");
        assert_eq!(json["open"], 150.5);
        assert_eq!(json["final"], true);
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_document_serialization() {
        let doc = new_candle("150.25").to_document();
        let json = serde_json::to_string(&doc).unwrap();
        let back: CandleDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn test_bucket_contains() {
        let bucket = minute_bucket();
        assert!(bucket.contains(bucket.start));
        assert!(!bucket.contains(bucket.end));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn ohlc_invariant_holds_after_every_tick(
                first in 1u64..100_000,
                rest in proptest::collection::vec(1u64..100_000, 0..64),
            ) {
                let mut candle = Candle::open(
                    Symbol::new("AAPL"),
                    Timeframe::M1,
                    minute_bucket(),
                    Price::from_u64(first),
                    Decimal::ZERO,
                );
                for cents in rest {
                    let price = Price::new(Decimal::new(cents as i64, 2)).unwrap();
                    candle.apply(price, Decimal::ZERO).unwrap();
                    prop_assert!(candle.is_valid());
                    prop_assert_eq!(candle.open_price(), Price::from_u64(first));
                    prop_assert_eq!(candle.close(), price);
                }
            }
        }
    }
}
