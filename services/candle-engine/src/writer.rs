//! Durable write pipeline
//!
//! Finalized candles go onto a bounded queue (enqueue waits when it is
//! full) and a small pool of workers drains it in batches. Each batch is
//! validated, chunked and inserted with bounded exponential backoff on
//! transient failures. Duplicate-key rejections count as benign.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use types::candle::{Candle, CandleDocument};

use crate::config::WriteConfig;
use crate::metrics::EngineMetrics;
use crate::store::CandleStore;

/// Outcome of one `write_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub invalid: usize,
    pub duplicates: usize,
}

impl WriteReport {
    pub fn merge(&mut self, other: &WriteReport) {
        self.total += other.total;
        self.success += other.success;
        self.failed += other.failed;
        self.invalid += other.invalid;
        self.duplicates += other.duplicates;
    }
}

/// Exponential backoff: `base * 2^attempt`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}

/// Validates, chunks and inserts documents into one collection.
#[derive(Clone)]
pub struct BatchWriter {
    store: Arc<dyn CandleStore>,
    chunk_size: usize,
    retry: RetryPolicy,
    metrics: Arc<EngineMetrics>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn CandleStore>, config: &WriteConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            store,
            chunk_size: config.chunk_size.max(1),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                backoff_base: config.backoff_base,
                backoff_cap: config.backoff_cap,
            },
            metrics,
        }
    }

    /// Same writer with a different retry budget (shutdown drain).
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        let mut writer = self.clone();
        writer.retry.max_retries = max_retries;
        writer
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Write a batch of documents to `collection`.
    ///
    /// Invalid documents are dropped and counted; a chunk that exhausts its
    /// retries is counted as failed while later chunks still go through.
    pub async fn write_batch(&self, collection: &str, docs: Vec<CandleDocument>) -> WriteReport {
        let mut report = WriteReport {
            total: docs.len(),
            ..WriteReport::default()
        };

        let mut valid = Vec::with_capacity(docs.len());
        for doc in docs {
            match doc.validate() {
                Ok(()) => valid.push(doc),
                Err(err) => {
                    report.invalid += 1;
                    warn!(collection, error = %err, "Rejecting invalid candle document");
                }
            }
        }

        for chunk in valid.chunks(self.chunk_size) {
            self.write_chunk(collection, chunk, &mut report).await;
        }

        self.metrics.record_write(&report);
        debug!(
            collection,
            total = report.total,
            success = report.success,
            failed = report.failed,
            invalid = report.invalid,
            duplicates = report.duplicates,
            "Batch written"
        );
        report
    }

    async fn write_chunk(&self, collection: &str, chunk: &[CandleDocument], report: &mut WriteReport) {
        let mut attempt = 0u32;
        loop {
            match self.store.insert_many(collection, chunk).await {
                Ok(outcome) => {
                    report.success += outcome.inserted;
                    report.duplicates += outcome.duplicates;
                    if outcome.duplicates > 0 {
                        debug!(
                            collection,
                            duplicates = outcome.duplicates,
                            "Duplicate keys skipped"
                        );
                    }
                    return;
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    attempt += 1;
                    self.metrics.record_write_retry();
                    warn!(
                        collection,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient write failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    report.failed += chunk.len();
                    error!(
                        collection,
                        documents = chunk.len(),
                        attempts = attempt + 1,
                        error = %err,
                        "Write failed, giving up on chunk"
                    );
                    return;
                }
            }
        }
    }
}

/// A finalized candle waiting for its durable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub collection: &'static str,
    pub document: CandleDocument,
}

impl PendingWrite {
    pub fn from_candle(candle: &Candle) -> Self {
        Self {
            collection: candle.timeframe().collection(),
            document: candle.to_document(),
        }
    }
}

/// The write queue was closed under the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("write queue closed")]
pub struct WriteQueueClosed;

/// Producer side of the bounded write queue.
#[derive(Debug, Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<PendingWrite>,
}

impl WriteQueue {
    /// Bounded queue plus the receiver the worker pool drains.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<PendingWrite>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue, waiting for capacity when the queue is full.
    pub async fn enqueue(&self, item: PendingWrite) -> Result<(), WriteQueueClosed> {
        self.tx.send(item).await.map_err(|_| WriteQueueClosed)
    }

    /// Free slots right now.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Shared state of the writer workers.
pub struct WriterPool {
    receiver: Mutex<mpsc::Receiver<PendingWrite>>,
    writer: BatchWriter,
    drain_writer: BatchWriter,
    max_batch: usize,
}

impl WriterPool {
    pub fn new(receiver: mpsc::Receiver<PendingWrite>, writer: BatchWriter, config: &WriteConfig) -> Arc<Self> {
        let drain_writer = writer.with_max_retries(config.shutdown_max_retries);
        Arc::new(Self {
            receiver: Mutex::new(receiver),
            writer,
            drain_writer,
            max_batch: config.max_batch.max(1),
        })
    }

    /// Worker loop. Runs until the queue is closed and empty; once
    /// `shutdown` fires, remaining batches use the drain retry budget.
    pub async fn run_worker(self: Arc<Self>, worker: usize, shutdown: CancellationToken) {
        info!(worker, "Writer worker started");
        while let Some(batch) = self.next_batch().await {
            let writer = if shutdown.is_cancelled() {
                &self.drain_writer
            } else {
                &self.writer
            };
            for (collection, docs) in group_by_collection(batch) {
                writer.write_batch(collection, docs).await;
            }
        }
        info!(worker, "Writer worker stopped");
    }

    async fn next_batch(&self) -> Option<Vec<PendingWrite>> {
        let mut receiver = self.receiver.lock().await;
        let first = receiver.recv().await?;
        let mut batch = vec![first];
        while batch.len() < self.max_batch {
            match receiver.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }
        Some(batch)
    }
}

fn group_by_collection(batch: Vec<PendingWrite>) -> BTreeMap<&'static str, Vec<CandleDocument>> {
    let mut grouped: BTreeMap<&'static str, Vec<CandleDocument>> = BTreeMap::new();
    for item in batch {
        grouped.entry(item.collection).or_default().push(item.document);
    }
    grouped
}
