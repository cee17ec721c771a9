//! Durable store collaborator
//!
//! The engine only needs batch insert, delete-many and a sorted find over
//! per-timeframe collections. `InMemoryCandleStore` backs the tests and the
//! demo binary and can inject transient failures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use types::candle::CandleDocument;
use types::ids::Symbol;

use crate::error::StoreError;

/// Result of a batch insert. Duplicate-key rejections are not errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Document selector: optional ticker, half-open `[from, to)` on `timestamp`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    pub ticker_id: Option<Symbol>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DocumentFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn range(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            ticker_id: None,
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn with_ticker(mut self, ticker_id: Symbol) -> Self {
        self.ticker_id = Some(ticker_id);
        self
    }

    pub fn matches(&self, doc: &CandleDocument) -> bool {
        self.ticker_id
            .as_ref()
            .map_or(true, |ticker| &doc.ticker_id == ticker)
            && self.from.map_or(true, |from| doc.timestamp >= from)
            && self.to.map_or(true, |to| doc.timestamp < to)
    }
}

/// Document database operations used by the engine.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Insert documents, skipping (and counting) duplicate keys.
    async fn insert_many(
        &self,
        collection: &str,
        docs: &[CandleDocument],
    ) -> Result<InsertOutcome, StoreError>;

    /// Delete matching documents, returning how many went.
    async fn delete_many(&self, collection: &str, filter: &DocumentFilter)
        -> Result<u64, StoreError>;

    /// Matching documents sorted by `(tickerID, timestamp)`.
    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> Result<Vec<CandleDocument>, StoreError>;

    /// Connectivity check.
    async fn ping(&self) -> Result<(), StoreError>;
}

type Collection = BTreeMap<(Symbol, DateTime<Utc>), CandleDocument>;

/// In-process store keyed by `(tickerID, timestamp)` per collection.
#[derive(Debug, Default)]
pub struct InMemoryCandleStore {
    collections: Mutex<BTreeMap<String, Collection>>,
    /// Remaining insert calls that fail with `Transient`.
    transient_failures: AtomicU32,
    unavailable: AtomicBool,
    insert_calls: AtomicU64,
}

impl InMemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` insert calls with a transient error.
    pub fn fail_next_inserts(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Make every call fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Document count for one collection.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .map(|collections| collections.get(collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Document counts for every non-empty collection.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.collections
            .lock()
            .map(|collections| {
                collections
                    .iter()
                    .filter(|(_, docs)| !docs.is_empty())
                    .map(|(name, docs)| (name.clone(), docs.len()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every document in a collection, sorted.
    pub fn documents(&self, collection: &str) -> Vec<CandleDocument> {
        self.collections
            .lock()
            .map(|collections| {
                collections
                    .get(collection)
                    .map(|docs| docs.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Collection>>, StoreError> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CandleStore for InMemoryCandleStore {
    async fn insert_many(
        &self,
        collection: &str,
        docs: &[CandleDocument],
    ) -> Result<InsertOutcome, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transient("injected timeout".to_string()));
        }

        let mut collections = self.lock()?;
        let target = collections.entry(collection.to_string()).or_default();
        let mut outcome = InsertOutcome::default();
        for doc in docs {
            let key = doc.key();
            if target.contains_key(&key) {
                outcome.duplicates += 1;
            } else {
                target.insert(key, doc.clone());
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut collections = self.lock()?;
        let Some(target) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = target.len();
        target.retain(|_, doc| !filter.matches(doc));
        Ok((before - target.len()) as u64)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> Result<Vec<CandleDocument>, StoreError> {
        self.check_available()?;
        let collections = self.lock()?;
        Ok(collections
            .get(collection)
            .map(|docs| docs.values().filter(|doc| filter.matches(doc)).cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn doc(symbol: &str, ts: &str) -> CandleDocument {
        CandleDocument {
            ticker_id: Symbol::new(symbol),
            timestamp: DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc),
            open: Decimal::from(10),
            high: Decimal::from(12),
            low: Decimal::from(9),
            close: Decimal::from(11),
            volume: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn test_duplicate_keys_counted_not_stored() {
        let store = InMemoryCandleStore::new();
        let docs = vec![doc("AAPL", "2024-03-15T13:30:00Z"), doc("MSFT", "2024-03-15T13:30:00Z")];
        let first = store.insert_many("candles_1m", &docs).await.unwrap();
        assert_eq!(first, InsertOutcome { inserted: 2, duplicates: 0 });

        let second = store.insert_many("candles_1m", &docs[..1]).await.unwrap();
        assert_eq!(second, InsertOutcome { inserted: 0, duplicates: 1 });
        assert_eq!(store.count("candles_1m"), 2);
    }

    #[tokio::test]
    async fn test_find_sorted_and_filtered() {
        let store = InMemoryCandleStore::new();
        let docs = vec![
            doc("MSFT", "2024-03-15T13:31:00Z"),
            doc("AAPL", "2024-03-15T13:31:00Z"),
            doc("AAPL", "2024-03-15T13:30:00Z"),
        ];
        store.insert_many("candles_1m", &docs).await.unwrap();

        let all = store.find("candles_1m", &DocumentFilter::all()).await.unwrap();
        let keys: Vec<_> = all.iter().map(|d| (d.ticker_id.to_string(), d.timestamp.to_rfc3339())).collect();
        assert_eq!(keys[0].0, "AAPL");
        assert!(keys[0].1 < keys[1].1);
        assert_eq!(keys[2].0, "MSFT");

        let filter = DocumentFilter::range(
            DateTime::parse_from_rfc3339("2024-03-15T13:31:00Z").unwrap().with_timezone(&Utc),
            DateTime::parse_from_rfc3339("2024-03-15T13:32:00Z").unwrap().with_timezone(&Utc),
        )
        .with_ticker(Symbol::new("AAPL"));
        assert_eq!(store.find("candles_1m", &filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_many() {
        let store = InMemoryCandleStore::new();
        store
            .insert_many("candles_1d", &[doc("AAPL", "2024-03-15T00:00:00Z"), doc("AAPL", "2024-03-16T00:00:00Z")])
            .await
            .unwrap();
        let from = DateTime::parse_from_rfc3339("2024-03-15T00:00:00Z").unwrap().with_timezone(&Utc);
        let deleted = store
            .delete_many("candles_1d", &DocumentFilter::range(from, from + chrono::Duration::days(1)))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count("candles_1d"), 1);
        assert_eq!(store.delete_many("missing", &DocumentFilter::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = InMemoryCandleStore::new();
        store.fail_next_inserts(1);
        let docs = [doc("AAPL", "2024-03-15T13:30:00Z")];
        assert!(matches!(
            store.insert_many("candles_1m", &docs).await,
            Err(StoreError::Transient(_))
        ));
        assert!(store.insert_many("candles_1m", &docs).await.is_ok());

        store.set_unavailable(true);
        assert!(store.ping().await.is_err());
        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
        assert_eq!(store.insert_calls(), 2);
    }
}
