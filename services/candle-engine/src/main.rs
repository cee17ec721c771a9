use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::NaiveDate;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use candle_engine::metrics::EngineMetrics;
use candle_engine::recovery::Recovery;
use candle_engine::relay::InMemoryRelay;
use candle_engine::store::{CandleStore, InMemoryCandleStore};
use candle_engine::writer::BatchWriter;
use candle_engine::{Engine, EngineConfig};
use types::candle::CandleDocument;
use types::timeframe::Timeframe;

const USAGE: &str = "usage: candle-engine [run | recover <YYYY-MM-DD>]";

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Logs go to stderr; stdout carries results.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None | Some("run") => run().await,
        Some("recover") => {
            let date = args.next().context(USAGE)?;
            recover(&date).await
        }
        Some(other) => bail!("unknown command `{other}`; {USAGE}"),
    }
}

/// Feed raw tick messages from stdin through the engine until EOF or Ctrl-C.
async fn run() -> Result<(), anyhow::Error> {
    let config = EngineConfig::from_env()?;
    let store = Arc::new(InMemoryCandleStore::new());
    let relay = Arc::new(InMemoryRelay::new());

    tracing::info!(version = candle_engine::SERVICE_VERSION, "Starting candle engine");
    let engine = Engine::start(config, store.clone(), Some(relay)).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => engine.ingest(line).await?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    let report = engine.shutdown().await?;
    let summary = serde_json::json!({
        "flushed": report.flushed,
        "collections": store.counts(),
        "metrics": report.metrics,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Rebuild one day from 1-minute documents given as JSON lines on stdin.
async fn recover(date: &str) -> Result<(), anyhow::Error> {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .with_context(|| format!("invalid date `{date}`; {USAGE}"))?;
    let config = EngineConfig::from_env()?;
    let store = Arc::new(InMemoryCandleStore::new());

    let mut minutes = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let doc: CandleDocument = serde_json::from_str(&line)
            .with_context(|| format!("line {line_no}: not a 1-minute candle document"))?;
        minutes.push(doc);
    }
    store
        .insert_many(Timeframe::M1.collection(), &minutes)
        .await?;

    let writer = BatchWriter::new(store.clone(), &config.write, Arc::new(EngineMetrics::new()));
    let recovery = Recovery::new(store, writer, config.calendar);
    let report = recovery.rebuild_day(date).await?;

    for (collection, docs) in &report.documents {
        for doc in docs {
            let line = serde_json::json!({ "collection": collection, "document": doc });
            println!("{line}");
        }
    }
    eprintln!(
        "{}",
        serde_json::json!({
            "date": report.date.to_string(),
            "source_minutes": report.source_minutes,
            "symbols": report.symbols,
            "deleted": report.deleted,
            "checksum": report.checksum,
        })
    );

    if report.failed() > 0 {
        bail!("{} rebuilt candles were not written", report.failed());
    }
    Ok(())
}
