//! Identifier types for instruments and live subscribers
//!
//! Symbols are normalized once at the boundary (trimmed, upper-cased) so
//! every map keyed by symbol downstream compares canonical strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::SymbolError;

/// Normalized instrument symbol (e.g. `AAPL`, `BRK.B`).
///
/// Serialized as the bare string, which is also the `tickerID` field of
/// durable candle documents. Deserialization normalizes and rejects empty
/// symbols.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol, trimming whitespace and upper-casing.
    ///
    /// Meant for literals. Untrusted input goes through [`Symbol::try_new`]
    /// or `str::parse`.
    ///
    /// # Panics
    /// Panics if the symbol is empty after trimming.
    pub fn new(symbol: impl AsRef<str>) -> Self {
        Self::try_new(symbol).expect("Symbol must not be empty")
    }

    /// Try to create a symbol, returning None if it is empty after trimming.
    pub fn try_new(symbol: impl AsRef<str>) -> Option<Self> {
        let normalized = symbol.as_ref().trim().to_uppercase();
        if normalized.is_empty() {
            None
        } else {
            Some(Self(normalized))
        }
    }

    /// Get the symbol string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Symbol {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_new(s).ok_or(SymbolError::Empty)
    }
}

impl TryFrom<String> for Symbol {
    type Error = SymbolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

/// Identifier of a live subscriber registered with the fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_normalization() {
        assert_eq!(Symbol::new("  aapl ").as_str(), "AAPL");
        assert_eq!(Symbol::new("brk.b"), Symbol::new("BRK.B"));
    }

    #[test]
    fn test_symbol_rejects_empty() {
        assert!(Symbol::try_new("   ").is_none());
        assert!(Symbol::try_new("").is_none());
    }

    #[test]
    fn test_symbol_parse_is_fallible() {
        assert_eq!("tsla".parse::<Symbol>(), Ok(Symbol::new("TSLA")));
        assert_eq!(" ".parse::<Symbol>(), Err(SymbolError::Empty));
    }

    #[test]
    fn test_symbol_deserialization_normalizes_and_rejects_empty() {
        let symbol: Symbol = serde_json::from_str("\" goog \"").unwrap();
        assert_eq!(symbol.as_str(), "GOOG");
        assert!(serde_json::from_str::<Symbol>("\"  \"").is_err());
    }

    #[test]
    fn test_symbol_serialization() {
        let symbol = Symbol::new("msft");
        let json = serde_json::to_string(&symbol).unwrap();
        assert_eq!(json, "\"MSFT\"");
        let deserialized: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(symbol, deserialized);
    }

    #[test]
    fn test_subscriber_id_display() {
        assert_eq!(SubscriberId::new(7).to_string(), "sub-7");
    }
}
