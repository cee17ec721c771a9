//! Durable write pipeline: retries, backoff, duplicates and shutdown drain.

use std::sync::Arc;
use std::time::Duration;

use candle_engine::config::WriteConfig;
use candle_engine::metrics::EngineMetrics;
use candle_engine::store::InMemoryCandleStore;
use candle_engine::writer::{BatchWriter, PendingWrite, WriteQueue, WriterPool};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use types::candle::CandleDocument;
use types::ids::Symbol;

fn doc(symbol: &str, minute: i64) -> CandleDocument {
    let base = DateTime::parse_from_rfc3339("2024-03-15T13:30:00Z")
        .unwrap()
        .with_timezone(&Utc);
    CandleDocument {
        ticker_id: Symbol::new(symbol),
        timestamp: base + ChronoDuration::minutes(minute),
        open: Decimal::from(10),
        high: Decimal::from(12),
        low: Decimal::from(9),
        close: Decimal::from(11),
        volume: Decimal::from(3),
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retried_with_backoff() {
    let store = Arc::new(InMemoryCandleStore::new());
    let metrics = Arc::new(EngineMetrics::new());
    let writer = BatchWriter::new(store.clone(), &WriteConfig::default(), metrics.clone());
    store.fail_next_inserts(2);

    let started = tokio::time::Instant::now();
    let report = writer.write_batch("candles_1m", vec![doc("AAPL", 0), doc("AAPL", 1)]).await;

    assert_eq!(report.success, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(store.insert_calls(), 3);
    assert_eq!(metrics.export()["write_retries"], 2);
    // 100 ms then 200 ms
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_count_failed_and_continue() {
    let store = Arc::new(InMemoryCandleStore::new());
    let metrics = Arc::new(EngineMetrics::new());
    let config = WriteConfig {
        chunk_size: 2,
        ..WriteConfig::default()
    };
    let writer = BatchWriter::new(store.clone(), &config, metrics.clone());
    // First chunk burns its initial attempt and 3 retries.
    store.fail_next_inserts(4);

    let report = writer
        .write_batch("candles_1m", (0..4).map(|m| doc("AAPL", m)).collect())
        .await;

    assert_eq!(report.total, 4);
    assert_eq!(report.failed, 2);
    assert_eq!(report.success, 2);
    assert_eq!(store.count("candles_1m"), 2);
    let exported = metrics.export();
    assert_eq!(exported["writes_failed"], 2);
    assert_eq!(exported["write_retries"], 3);
}

#[tokio::test]
async fn test_unavailable_store_is_not_retried() {
    let store = Arc::new(InMemoryCandleStore::new());
    let metrics = Arc::new(EngineMetrics::new());
    let writer = BatchWriter::new(store.clone(), &WriteConfig::default(), metrics.clone());
    store.set_unavailable(true);

    let report = writer.write_batch("candles_1m", vec![doc("AAPL", 0)]).await;
    assert_eq!(report.failed, 1);
    assert_eq!(store.insert_calls(), 1);
    assert_eq!(metrics.export()["write_retries"], 0);
}

#[tokio::test]
async fn test_writing_same_candle_twice_keeps_one_document() {
    let store = Arc::new(InMemoryCandleStore::new());
    let metrics = Arc::new(EngineMetrics::new());
    let writer = BatchWriter::new(store.clone(), &WriteConfig::default(), metrics.clone());

    let first = writer.write_batch("candles_5m", vec![doc("MSFT", 0)]).await;
    let second = writer.write_batch("candles_5m", vec![doc("MSFT", 0)]).await;

    assert_eq!(first.success, 1);
    assert_eq!(second.success, 0);
    assert_eq!(second.duplicates, 1);
    assert_eq!(second.failed, 0);
    assert_eq!(store.count("candles_5m"), 1);
    assert_eq!(metrics.export()["writes_duplicate"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drain_uses_elevated_retry_budget() {
    let store = Arc::new(InMemoryCandleStore::new());
    let config = WriteConfig::default();
    let writer = BatchWriter::new(store.clone(), &config, Arc::new(EngineMetrics::new()));
    let (queue, rx) = WriteQueue::bounded(32);
    let pool = WriterPool::new(rx, writer, &config);

    for minute in 0..3 {
        queue
            .enqueue(PendingWrite {
                collection: "candles_1m",
                document: doc("AAPL", minute),
            })
            .await
            .unwrap();
    }
    drop(queue);

    // More failures than the normal budget allows, fewer than the drain's.
    store.fail_next_inserts(config.max_retries + 2);
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    pool.run_worker(0, shutdown).await;

    assert_eq!(store.count("candles_1m"), 3);
}

#[tokio::test]
async fn test_workers_share_queue_and_group_collections() {
    let store = Arc::new(InMemoryCandleStore::new());
    let config = WriteConfig {
        max_batch: 3,
        ..WriteConfig::default()
    };
    let writer = BatchWriter::new(store.clone(), &config, Arc::new(EngineMetrics::new()));
    let (queue, rx) = WriteQueue::bounded(64);
    let pool = WriterPool::new(rx, writer, &config);

    for minute in 0..10 {
        for collection in ["candles_1m", "candles_5m"] {
            queue
                .enqueue(PendingWrite {
                    collection,
                    document: doc("AAPL", minute),
                })
                .await
                .unwrap();
        }
    }
    drop(queue);

    let workers: Vec<_> = (0..3)
        .map(|worker| tokio::spawn(pool.clone().run_worker(worker, CancellationToken::new())))
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(store.count("candles_1m"), 10);
    assert_eq!(store.count("candles_5m"), 10);
}
