//! Fixed-point decimal price type
//!
//! Uses rust_decimal so OHLC comparisons and volume accumulation are exact.
//! Feed prices arrive as JSON floats; they are converted once at the
//! ingestion boundary and never round-trip through `f64` again.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::PriceError;

/// A strictly positive trade price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(#[serde(with = "rust_decimal::serde::float")] Decimal);

impl Price {
    /// Wrap a decimal, rejecting zero and negative values.
    pub fn new(value: Decimal) -> Result<Self, PriceError> {
        if value <= Decimal::ZERO {
            return Err(PriceError::NotPositive(value.to_string()));
        }
        Ok(Self(value.normalize()))
    }

    /// Convert a feed float. NaN, infinities and non-positive values are rejected.
    pub fn try_from_f64(value: f64) -> Result<Self, PriceError> {
        if !value.is_finite() {
            return Err(PriceError::NotFinite);
        }
        let decimal =
            Decimal::try_from(value).map_err(|_| PriceError::OutOfRange(value.to_string()))?;
        Self::new(decimal)
    }

    /// Whole-unit price, mostly for tests and fixtures.
    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value.max(1)))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl FromStr for Price {
    type Err = PriceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let decimal = Decimal::from_str(trimmed)
            .or_else(|_| Decimal::from_scientific(trimmed))
            .map_err(|_| PriceError::Unparseable(s.to_string()))?;
        Self::new(decimal)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Price> for Decimal {
    fn from(price: Price) -> Self {
        price.0
    }
}
