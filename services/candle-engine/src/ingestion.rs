//! Tick ingestion layer
//!
//! Decodes raw feed messages of the form
//! `{"service": "<source>", "data": [timestamp, symbol, price, volume?]}`
//! into validated `Tick`s. Anything that does not decode is rejected with a
//! typed `TickError`; the caller counts and drops it, the loop never stops.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use types::errors::{TickError, TimestampError};
use types::ids::Symbol;
use types::numeric::Price;
use types::tick::{float_millis_to_utc, millis_to_utc, parse_timestamp_text, Tick};

/// Minimum `data` length: timestamp, symbol, price.
const MIN_PAYLOAD_LEN: usize = 3;

/// Stateless decoder for one feed's raw messages.
#[derive(Debug, Clone)]
pub struct TickDecoder {
    /// Expected `service` value.
    source_service: String,
    /// Total messages decoded into ticks.
    accepted: u64,
    /// Total messages rejected.
    rejected: u64,
}

impl TickDecoder {
    pub fn new(source_service: impl Into<String>) -> Self {
        Self {
            source_service: source_service.into(),
            accepted: 0,
            rejected: 0,
        }
    }

    pub fn source_service(&self) -> &str {
        &self.source_service
    }

    /// Decode a raw message and keep acceptance stats.
    pub fn decode(&mut self, raw: &str) -> Result<Tick, TickError> {
        match self.decode_message(raw) {
            Ok(tick) => {
                self.accepted += 1;
                debug!(
                    symbol = %tick.symbol,
                    price = %tick.price,
                    timestamp = %tick.timestamp,
                    "Tick decoded"
                );
                Ok(tick)
            }
            Err(err) => {
                self.rejected += 1;
                match &err {
                    // Other feeds share the queue; not an anomaly worth a warning.
                    TickError::UnexpectedService { .. } => {
                        debug!(reason = err.label(), error = %err, "Message skipped")
                    }
                    _ => warn!(reason = err.label(), error = %err, "Dropping malformed tick"),
                }
                Err(err)
            }
        }
    }

    /// Pure decoding, no bookkeeping.
    pub fn decode_message(&self, raw: &str) -> Result<Tick, TickError> {
        let message: Value =
            serde_json::from_str(raw).map_err(|e| TickError::MalformedJson(e.to_string()))?;
        let object = message
            .as_object()
            .ok_or_else(|| TickError::MalformedJson("message is not an object".to_string()))?;

        let service = object
            .get("service")
            .and_then(Value::as_str)
            .ok_or(TickError::MissingField("service"))?;
        if service != self.source_service {
            return Err(TickError::UnexpectedService {
                service: service.to_string(),
            });
        }

        let data = object
            .get("data")
            .and_then(Value::as_array)
            .ok_or(TickError::MissingField("data"))?;
        if data.len() < MIN_PAYLOAD_LEN {
            return Err(TickError::ShortPayload { len: data.len() });
        }

        let timestamp = match &data[0] {
            Value::Number(n) => match n.as_i64() {
                Some(ms) => millis_to_utc(ms)?,
                None => float_millis_to_utc(n.as_f64().unwrap_or(f64::NAN))?,
            },
            Value::String(s) => parse_timestamp_text(s)?,
            Value::Null => return Err(TickError::MissingField("timestamp")),
            other => return Err(TimestampError::Unparseable(other.to_string()).into()),
        };

        let symbol = match &data[1] {
            Value::String(s) => Symbol::try_new(s).ok_or(TickError::EmptySymbol)?,
            Value::Null => return Err(TickError::MissingField("symbol")),
            _ => return Err(TickError::EmptySymbol),
        };

        let price = match &data[2] {
            // Parse the literal to avoid a float round trip.
            Value::Number(n) => Price::from_str(&n.to_string())?,
            Value::String(s) => Price::from_str(s)?,
            Value::Null => return Err(TickError::MissingField("price")),
            other => Price::from_str(&other.to_string())?,
        };

        let volume = match data.get(3) {
            None | Some(Value::Null) => Decimal::ZERO,
            Some(Value::Number(n)) => parse_volume(&n.to_string())?,
            Some(Value::String(s)) => parse_volume(s)?,
            Some(other) => return Err(TickError::InvalidVolume(other.to_string())),
        };

        Ok(Tick::new(symbol, price, timestamp).with_volume(volume))
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

fn parse_volume(raw: &str) -> Result<Decimal, TickError> {
    let trimmed = raw.trim();
    let volume = Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| TickError::InvalidVolume(raw.to_string()))?;
    if volume < Decimal::ZERO {
        return Err(TickError::InvalidVolume(raw.to_string()));
    }
    Ok(volume)
}
