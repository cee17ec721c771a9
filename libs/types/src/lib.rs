//! Types library for the candle aggregation engine
//!
//! This library provides the core type definitions shared by the engine
//! and by anything that consumes its output (durable documents, live
//! snapshots), keeping the wire shapes in one place.
//!
//! # Modules
//! - `ids`: Instrument symbols and subscriber identifiers
//! - `numeric`: Fixed-point decimal price type
//! - `timeframe`: The fixed set of candle timeframes
//! - `tick`: Trade ticks and timestamp normalization
//! - `candle`: Candle state, durable documents and live snapshots
//! - `errors`: Error taxonomy

pub mod candle;
pub mod errors;
pub mod ids;
pub mod numeric;
pub mod tick;
pub mod timeframe;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::candle::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::tick::*;
    pub use crate::timeframe::*;
}
