//! Engine error taxonomy
//!
//! Only `EngineError` at startup is fatal. Everything else is logged,
//! counted, and recovered where it happens.

use thiserror::Error;

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown market timezone: {0}")]
    InvalidTimezone(String),

    #[error("invalid market close time (expected HH:MM): {0}")]
    InvalidCloseTime(String),
}

/// Durable store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network blip or timeout; worth retrying
    #[error("transient store failure: {0}")]
    Transient(String),

    /// The store refused the request outright
    #[error("store rejected request: {0}")]
    Rejected(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Cross-process relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("relay publish failed on {channel}: {reason}")]
    PublishFailed { channel: String, reason: String },
}

/// Engine lifecycle errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("durable store unreachable at startup: {0}")]
    StoreUnreachable(#[source] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("engine core loop is not running")]
    Stopped,

    #[error("task {name} failed to join: {reason}")]
    Join { name: &'static str, reason: String },
}

/// Recovery/backfill errors
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("store error during recovery: {0}")]
    Store(#[from] StoreError),

    #[error("date out of supported range: {0}")]
    DateOutOfRange(String),
}
