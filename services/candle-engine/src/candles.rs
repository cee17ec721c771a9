//! Candle state store
//!
//! Holds every live candle across all timeframes for every symbol. Owned
//! exclusively by the core loop; every method here is synchronous and
//! runs to completion, so a bucket-boundary decision (read current bucket,
//! compare, create/update/finalize) is atomic by construction.
//!
//! Layout mirrors the per-symbol, per-timeframe builder split:
//! `CandleState` → `SymbolCandles` → `TimeframeSlot`. Each slot keeps at
//! most one open candle and a finalization watermark. The 1-minute slot
//! additionally retains its finalized candles until eviction.
//!
//! Wall-clock `now` is always passed in, never read here.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use types::candle::{Bucket, Candle};
use types::ids::Symbol;
use types::numeric::Price;
use types::tick::Tick;
use types::timeframe::Timeframe;

use crate::bucket::MarketCalendar;

/// What a single tick did to the state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Open candles after the update, one per timeframe that accepted the tick.
    pub updated: Vec<Candle>,
    /// Candles finalized by a bucket-boundary crossing.
    pub finalized: Vec<Candle>,
    /// Timeframes that dropped the tick as late.
    pub late: Vec<Timeframe>,
}

/// Which open candles a forced flush finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    /// Daily close at `close_at`. Closes are synchronized to the last
    /// 1-minute close before `close_at` first; weekly candles only flush on
    /// the week's final session.
    MarketClose { close_at: DateTime<Utc> },
    /// Process shutdown: everything, weekly included.
    Shutdown,
}

/// Counts from one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub minute_candles: usize,
    pub recent_entries: usize,
}

/// A finalized candle kept briefly so "latest" reads never see a gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentEntry {
    pub candle: Candle,
    pub finalized_at: DateTime<Utc>,
}

enum SlotUpdate {
    Opened,
    Updated,
    Rolled(Candle),
    Late,
}

/// State for one (symbol, timeframe).
#[derive(Debug, Clone)]
struct TimeframeSlot {
    timeframe: Timeframe,
    /// Currently building candle (never final).
    current: Option<Candle>,
    /// Finalized candles by bucket start; only the 1-minute slot keeps these.
    closed: BTreeMap<DateTime<Utc>, Candle>,
    /// Start of the newest finalized bucket.
    watermark: Option<DateTime<Utc>>,
}

impl TimeframeSlot {
    fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            current: None,
            closed: BTreeMap::new(),
            watermark: None,
        }
    }

    fn apply(&mut self, symbol: &Symbol, bucket: Bucket, price: Price, volume: Decimal) -> SlotUpdate {
        if self.watermark.is_some_and(|wm| bucket.start <= wm) {
            return SlotUpdate::Late;
        }

        match self.current.as_mut() {
            Some(candle) if candle.bucket() == bucket => {
                return match candle.apply(price, volume) {
                    Ok(()) => SlotUpdate::Updated,
                    Err(err) => {
                        warn!(error = %err, "Open candle refused update");
                        SlotUpdate::Late
                    }
                };
            }
            Some(candle) if bucket.start < candle.bucket_start() => return SlotUpdate::Late,
            _ => {}
        }

        // Boundary crossing (or first tick): close the previous bucket, open the new one.
        let finished = self.finalize_current();
        self.current = Some(Candle::open(
            symbol.clone(),
            self.timeframe,
            bucket,
            price,
            volume,
        ));
        match finished {
            Some(candle) => SlotUpdate::Rolled(candle),
            None => SlotUpdate::Opened,
        }
    }

    fn finalize_current(&mut self) -> Option<Candle> {
        let mut candle = self.current.take()?;
        if !candle.finalize() {
            return None;
        }
        let start = candle.bucket_start();
        self.watermark = Some(self.watermark.map_or(start, |wm| wm.max(start)));
        if self.timeframe == Timeframe::M1 {
            self.closed.insert(start, candle.clone());
        }
        Some(candle)
    }

    fn latest(&self) -> Option<&Candle> {
        self.current
            .as_ref()
            .or_else(|| self.closed.values().next_back())
    }
}

/// Every timeframe slot for one symbol.
#[derive(Debug, Clone)]
struct SymbolCandles {
    slots: BTreeMap<Timeframe, TimeframeSlot>,
}

impl SymbolCandles {
    fn new() -> Self {
        Self {
            slots: Timeframe::all()
                .iter()
                .map(|&tf| (tf, TimeframeSlot::new(tf)))
                .collect(),
        }
    }

    /// Close of the newest 1-minute candle that started before `cutoff`,
    /// the anchor for market-close sync.
    fn minute_close_before(&self, cutoff: DateTime<Utc>) -> Option<Price> {
        let slot = self.slot(Timeframe::M1)?;
        slot.current
            .as_ref()
            .filter(|candle| candle.bucket_start() < cutoff)
            .or_else(|| slot.closed.range(..cutoff).next_back().map(|(_, candle)| candle))
            .map(Candle::close)
    }

    fn slot(&self, timeframe: Timeframe) -> Option<&TimeframeSlot> {
        self.slots.get(&timeframe)
    }

    fn slot_mut(&mut self, timeframe: Timeframe) -> &mut TimeframeSlot {
        self.slots
            .entry(timeframe)
            .or_insert_with(|| TimeframeSlot::new(timeframe))
    }
}

/// In-memory candle state for all symbols and timeframes.
#[derive(Debug, Clone)]
pub struct CandleState {
    calendar: MarketCalendar,
    symbols: BTreeMap<Symbol, SymbolCandles>,
    /// Recently-finalized cache; entries per key in finalization order.
    recent: BTreeMap<(Symbol, Timeframe), Vec<RecentEntry>>,
}

impl CandleState {
    pub fn new(calendar: MarketCalendar) -> Self {
        Self {
            calendar,
            symbols: BTreeMap::new(),
            recent: BTreeMap::new(),
        }
    }

    pub fn calendar(&self) -> &MarketCalendar {
        &self.calendar
    }

    /// Apply one tick to every timeframe independently.
    ///
    /// All timeframe updates complete before this returns; the caller
    /// publishes from the returned copies.
    pub fn apply_tick(&mut self, tick: &Tick, now: DateTime<Utc>) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let calendar = &self.calendar;
        let entry = self
            .symbols
            .entry(tick.symbol.clone())
            .or_insert_with(SymbolCandles::new);

        for &timeframe in Timeframe::all() {
            let bucket = calendar.bucket_for(tick.timestamp, timeframe);
            let slot = entry.slot_mut(timeframe);
            match slot.apply(&tick.symbol, bucket, tick.price, tick.volume) {
                SlotUpdate::Late => {
                    debug!(
                        symbol = %tick.symbol,
                        timeframe = %timeframe,
                        bucket_start = %bucket.start,
                        "Late tick dropped for timeframe"
                    );
                    outcome.late.push(timeframe);
                    continue;
                }
                SlotUpdate::Rolled(finished) => outcome.finalized.push(finished),
                SlotUpdate::Opened | SlotUpdate::Updated => {}
            }
            if let Some(current) = slot.current.as_ref() {
                outcome.updated.push(current.clone());
            }
        }

        for candle in &outcome.finalized {
            self.remember(candle, now);
        }
        outcome
    }

    /// Finalize open 1-minute candles whose bucket end has passed.
    pub fn sweep_stale(&mut self, now: DateTime<Utc>) -> Vec<Candle> {
        let mut finalized = Vec::new();
        for candles in self.symbols.values_mut() {
            let slot = candles.slot_mut(Timeframe::M1);
            let expired = slot
                .current
                .as_ref()
                .is_some_and(|candle| candle.bucket_end() <= now);
            if expired {
                finalized.extend(slot.finalize_current());
            }
        }
        for candle in &finalized {
            self.remember(candle, now);
        }
        finalized
    }

    /// Force-finalize open candles regardless of bucket end.
    ///
    /// A market-close flush leaves alone candles that belong to the next
    /// session, i.e. those opened by ticks stamped at or after `close_at`.
    pub fn force_finalize(&mut self, scope: FlushScope, now: DateTime<Utc>) -> Vec<Candle> {
        let (cutoff, include_weekly) = match scope {
            FlushScope::MarketClose { close_at } => {
                (Some(close_at), self.calendar.is_week_final_session(close_at))
            }
            FlushScope::Shutdown => (None, true),
        };

        let mut finalized = Vec::new();
        for (symbol, candles) in self.symbols.iter_mut() {
            let anchor = cutoff.and_then(|close_at| candles.minute_close_before(close_at));
            for (timeframe, slot) in candles.slots.iter_mut() {
                if *timeframe == Timeframe::W1 && !include_weekly {
                    continue;
                }
                let Some(current) = slot.current.as_mut() else {
                    continue;
                };
                if cutoff.is_some_and(|close_at| current.bucket_start() >= close_at) {
                    debug!(
                        symbol = %symbol,
                        timeframe = %timeframe,
                        bucket_start = %current.bucket_start(),
                        "Next-session candle left open at market close"
                    );
                    continue;
                }
                if let Some(price) = anchor {
                    if current.close() != price {
                        debug!(
                            symbol = %symbol,
                            timeframe = %timeframe,
                            from = %current.close(),
                            to = %price,
                            "Synchronizing close to last 1m close"
                        );
                    }
                    if let Err(err) = current.sync_close(price) {
                        warn!(error = %err, "Close synchronization skipped");
                    }
                }
                finalized.extend(slot.finalize_current());
            }
        }
        for candle in &finalized {
            self.remember(candle, now);
        }
        finalized
    }

    /// Drop finalized 1-minute candles past `retention` and recently-finalized
    /// entries older than `ttl`.
    pub fn evict(&mut self, now: DateTime<Utc>, retention: Duration, ttl: Duration) -> EvictionReport {
        let mut report = EvictionReport::default();

        if let Some(cutoff) = cutoff(now, retention) {
            for candles in self.symbols.values_mut() {
                let slot = candles.slot_mut(Timeframe::M1);
                let before = slot.closed.len();
                slot.closed.retain(|_, candle| candle.bucket_end() > cutoff);
                report.minute_candles += before - slot.closed.len();
            }
        }

        if let Some(cutoff) = cutoff(now, ttl) {
            for entries in self.recent.values_mut() {
                let before = entries.len();
                entries.retain(|entry| entry.finalized_at > cutoff);
                report.recent_entries += before - entries.len();
            }
            self.recent.retain(|_, entries| !entries.is_empty());
        }

        report
    }

    /// Latest known candle: the open one, else the newest finalized one
    /// still held in memory.
    pub fn latest(&self, symbol: &Symbol, timeframe: Timeframe) -> Option<Candle> {
        let live = self
            .symbols
            .get(symbol)
            .and_then(|candles| candles.slot(timeframe))
            .and_then(TimeframeSlot::latest);
        if let Some(candle) = live {
            return Some(candle.clone());
        }
        self.recent
            .get(&(symbol.clone(), timeframe))
            .and_then(|entries| entries.last())
            .map(|entry| entry.candle.clone())
    }

    /// Number of open (non-final) candles across all keys.
    pub fn open_count(&self) -> usize {
        self.symbols
            .values()
            .flat_map(|candles| candles.slots.values())
            .filter(|slot| slot.current.is_some())
            .count()
    }

    /// 1-minute candles held in memory, open and finalized.
    pub fn minute_count(&self) -> usize {
        self.symbols
            .values()
            .filter_map(|candles| candles.slot(Timeframe::M1))
            .map(|slot| slot.closed.len() + usize::from(slot.current.is_some()))
            .sum()
    }

    pub fn recent_count(&self) -> usize {
        self.recent.values().map(Vec::len).sum()
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    fn remember(&mut self, candle: &Candle, now: DateTime<Utc>) {
        self.recent
            .entry((candle.symbol().clone(), candle.timeframe()))
            .or_default()
            .push(RecentEntry {
                candle: candle.clone(),
                finalized_at: now,
            });
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn px(s: &str) -> Price {
        Price::from_str(s).unwrap()
    }

    fn tick(symbol: &str, ts: &str, price: &str) -> Tick {
        Tick::new(Symbol::new(symbol), px(price), utc(ts))
    }

    fn state() -> CandleState {
        CandleState::new(MarketCalendar::default())
    }

    #[test]
    fn test_first_tick_opens_every_timeframe() {
        let mut state = state();
        let outcome = state.apply_tick(&tick("AAPL", "2024-03-15T13:30:00.100Z", "150"), utc("2024-03-15T13:30:00.200Z"));
        assert_eq!(outcome.updated.len(), Timeframe::all().len());
        assert!(outcome.finalized.is_empty());
        assert!(outcome.late.is_empty());
        assert_eq!(state.open_count(), 7);
    }

    #[test]
    fn test_minute_candle_built_then_swept() {
        let mut state = state();
        let now = utc("2024-03-15T13:31:00Z");
        state.apply_tick(&tick("AAPL", "2024-03-15T13:30:00.100Z", "150.00"), now);
        state.apply_tick(&tick("AAPL", "2024-03-15T13:30:15Z", "151.00"), now);
        state.apply_tick(&tick("AAPL", "2024-03-15T13:30:59.900Z", "149.50"), now);

        // Not yet past the bucket end
        assert!(state.sweep_stale(utc("2024-03-15T13:30:59.950Z")).is_empty());

        let swept = state.sweep_stale(utc("2024-03-15T13:31:00.500Z"));
        assert_eq!(swept.len(), 1);
        let candle = &swept[0];
        assert_eq!(candle.timeframe(), Timeframe::M1);
        assert_eq!(candle.bucket_start(), utc("2024-03-15T13:30:00Z"));
        assert_eq!(candle.open_price(), px("150"));
        assert_eq!(candle.high(), px("151"));
        assert_eq!(candle.low(), px("149.5"));
        assert_eq!(candle.close(), px("149.5"));
        assert!(candle.is_final());

        // Sweep is idempotent
        assert!(state.sweep_stale(utc("2024-03-15T13:32:00Z")).is_empty());
    }

    #[test]
    fn test_daily_crossing_at_close() {
        let mut state = state();
        let now = utc("2024-03-15T20:00:01Z");
        state.apply_tick(&tick("TSLA", "2024-03-15T19:59:59Z", "250.00"), now);
        let outcome = state.apply_tick(&tick("TSLA", "2024-03-15T20:00:01Z", "251.00"), now);

        let daily = outcome
            .finalized
            .iter()
            .find(|c| c.timeframe() == Timeframe::D1)
            .unwrap();
        assert_eq!(daily.close(), px("250"));
        assert_eq!(daily.bucket_end(), utc("2024-03-15T20:00:00Z"));

        let next = state.latest(&Symbol::new("TSLA"), Timeframe::D1).unwrap();
        assert!(!next.is_final());
        assert_eq!(next.open_price(), px("251"));

        // Same ISO week: weekly stays open and keeps updating
        assert!(!outcome.finalized.iter().any(|c| c.timeframe() == Timeframe::W1));
    }

    #[test]
    fn test_one_tick_can_finalize_several_timeframes() {
        let mut state = state();
        let now = utc("2024-03-18T13:30:00Z");
        state.apply_tick(&tick("AAPL", "2024-03-15T19:59:00Z", "10"), now);
        // Monday morning: crosses 1m..1hr, daily and weekly at once
        let outcome = state.apply_tick(&tick("AAPL", "2024-03-18T13:30:00Z", "11"), now);
        assert_eq!(outcome.finalized.len(), 7);
        assert_eq!(outcome.updated.len(), 7);
    }

    #[test]
    fn test_market_close_syncs_to_last_minute_close() {
        let mut state = state();
        let symbol = Symbol::new("MSFT");
        let bucket = state
            .calendar()
            .bucket_for(utc("2024-03-15T19:55:00Z"), Timeframe::M5);
        let mut five = Candle::open(symbol.clone(), Timeframe::M5, bucket, px("300"), Decimal::ZERO);
        five.apply(px("302"), Decimal::ZERO).unwrap();
        five.apply(px("299"), Decimal::ZERO).unwrap();
        five.apply(px("301"), Decimal::ZERO).unwrap();

        let minute_bucket = state
            .calendar()
            .bucket_for(utc("2024-03-15T19:59:00Z"), Timeframe::M1);
        let mut last_minute = Candle::open(symbol.clone(), Timeframe::M1, minute_bucket, px("301"), Decimal::ZERO);
        last_minute.apply(px("301.50"), Decimal::ZERO).unwrap();
        last_minute.finalize();

        let mut candles = SymbolCandles::new();
        candles.slot_mut(Timeframe::M5).current = Some(five);
        candles
            .slot_mut(Timeframe::M1)
            .closed
            .insert(minute_bucket.start, last_minute);
        state.symbols.insert(symbol.clone(), candles);

        let close_at = utc("2024-03-15T20:00:00Z");
        let flushed = state.force_finalize(FlushScope::MarketClose { close_at }, close_at);
        assert_eq!(flushed.len(), 1);
        let candle = &flushed[0];
        assert_eq!(candle.open_price(), px("300"));
        assert_eq!(candle.high(), px("302"));
        assert_eq!(candle.low(), px("299"));
        assert_eq!(candle.close(), px("301.50"));
        assert!(candle.is_final());
        assert!(candle.is_valid());
    }

    #[test]
    fn test_market_close_leaves_next_session_candles_open() {
        let mut state = state();
        let symbol = Symbol::new("AAPL");
        state.apply_tick(&tick("AAPL", "2024-03-14T19:59:30Z", "100"), utc("2024-03-14T19:59:30Z"));
        // Closing print stamped just after the close reaches the loop first.
        state.apply_tick(&tick("AAPL", "2024-03-14T20:00:00.200Z", "101"), utc("2024-03-14T20:00:00.300Z"));

        let close_at = utc("2024-03-14T20:00:00Z");
        let flushed = state.force_finalize(FlushScope::MarketClose { close_at }, close_at);
        assert!(flushed.iter().all(|c| c.bucket_start() < close_at));
        assert!(!flushed.iter().any(|c| c.timeframe() == Timeframe::D1));

        // Friday's daily candle is still open and takes the regular session.
        let friday = state.apply_tick(&tick("AAPL", "2024-03-15T14:00:00Z", "105"), utc("2024-03-15T14:00:00Z"));
        assert!(friday.late.is_empty());
        let daily = state.latest(&symbol, Timeframe::D1).unwrap();
        assert!(!daily.is_final());
        assert_eq!(daily.bucket_start(), utc("2024-03-15T00:00:00Z"));
        assert_eq!(daily.open_price(), px("101"));
        assert_eq!(daily.close(), px("105"));
    }

    #[test]
    fn test_market_close_sync_ignores_after_close_minute() {
        let mut state = state();
        state.apply_tick(&tick("AAPL", "2024-03-15T19:59:30Z", "102"), utc("2024-03-15T19:59:30Z"));
        state.apply_tick(&tick("AAPL", "2024-03-15T20:00:00.200Z", "110"), utc("2024-03-15T20:00:00.300Z"));

        // Friday: the weekly candle is flushed and synced to the 19:59 minute.
        let close_at = utc("2024-03-15T20:00:00Z");
        let flushed = state.force_finalize(FlushScope::MarketClose { close_at }, close_at);
        assert_eq!(flushed.len(), 1);
        let weekly = &flushed[0];
        assert_eq!(weekly.timeframe(), Timeframe::W1);
        assert_eq!(weekly.close(), px("102"));
        assert_eq!(weekly.high(), px("110"));
        assert!(weekly.is_valid());

        // Minute and daily candles opened by the 20:00 print stay open.
        assert_eq!(state.open_count(), 6);
    }

    #[test]
    fn test_midweek_close_keeps_weekly_open() {
        let mut state = state();
        let now = utc("2024-03-14T19:00:00Z");
        state.apply_tick(&tick("AAPL", "2024-03-14T19:00:00Z", "100"), now);
        let close_at = utc("2024-03-14T20:00:00Z"); // Thursday
        let flushed = state.force_finalize(FlushScope::MarketClose { close_at }, close_at);
        assert_eq!(flushed.len(), 6);
        assert!(!flushed.iter().any(|c| c.timeframe() == Timeframe::W1));
        assert_eq!(state.open_count(), 1);

        let friday_close = utc("2024-03-15T20:00:00Z");
        state.apply_tick(&tick("AAPL", "2024-03-15T19:00:00Z", "101"), friday_close);
        let flushed = state.force_finalize(FlushScope::MarketClose { close_at: friday_close }, friday_close);
        assert!(flushed.iter().any(|c| c.timeframe() == Timeframe::W1));
        assert_eq!(state.open_count(), 0);
    }

    #[test]
    fn test_shutdown_flush_finalizes_everything() {
        let mut state = state();
        let now = utc("2024-03-14T19:00:00Z");
        state.apply_tick(&tick("AAPL", "2024-03-14T19:00:00Z", "100"), now);
        state.apply_tick(&tick("MSFT", "2024-03-14T19:00:00Z", "200"), now);
        let flushed = state.force_finalize(FlushScope::Shutdown, now);
        assert_eq!(flushed.len(), 14);
        assert_eq!(state.open_count(), 0);
        // Second flush has nothing to do
        assert!(state.force_finalize(FlushScope::Shutdown, now).is_empty());
    }

    #[test]
    fn test_late_tick_dropped_per_timeframe() {
        let mut state = state();
        let now = utc("2024-03-15T13:40:00Z");
        state.apply_tick(&tick("AAPL", "2024-03-15T13:30:10Z", "100"), now);
        state.apply_tick(&tick("AAPL", "2024-03-15T13:36:10Z", "101"), now);

        // 13:34 is behind the open 1m and 5m buckets but inside the open 15m bucket
        let outcome = state.apply_tick(&tick("AAPL", "2024-03-15T13:34:00Z", "99"), now);
        assert_eq!(outcome.late, vec![Timeframe::M1, Timeframe::M5]);
        assert!(outcome.finalized.is_empty());
        let m15 = state.latest(&Symbol::new("AAPL"), Timeframe::M15).unwrap();
        assert_eq!(m15.low(), px("99"));

        // The finalized 13:30 minute never reopens
        let m1 = state.latest(&Symbol::new("AAPL"), Timeframe::M1).unwrap();
        assert_eq!(m1.bucket_start(), utc("2024-03-15T13:36:00Z"));
    }

    #[test]
    fn test_tick_into_swept_minute_is_late() {
        let mut state = state();
        state.apply_tick(&tick("AAPL", "2024-03-15T13:30:10Z", "100"), utc("2024-03-15T13:30:10Z"));
        state.sweep_stale(utc("2024-03-15T13:31:01Z"));
        let outcome = state.apply_tick(&tick("AAPL", "2024-03-15T13:30:50Z", "105"), utc("2024-03-15T13:31:02Z"));
        assert!(outcome.late.contains(&Timeframe::M1));
        assert!(outcome.finalized.is_empty());
    }

    #[test]
    fn test_minute_crossing_finalizes_previous_minute() {
        let mut state = state();
        let now = utc("2024-03-15T13:31:05Z");
        state.apply_tick(&tick("AAPL", "2024-03-15T13:30:10Z", "100"), now);
        let outcome = state.apply_tick(&tick("AAPL", "2024-03-15T13:31:05Z", "101"), now);
        assert_eq!(outcome.finalized.len(), 1);
        assert_eq!(outcome.finalized[0].timeframe(), Timeframe::M1);
        assert_eq!(state.minute_count(), 2);
    }

    #[test]
    fn test_eviction_bounds_memory() {
        let mut state = state();
        let t0 = utc("2024-03-15T13:30:10Z");
        state.apply_tick(&tick("AAPL", "2024-03-15T13:30:10Z", "100"), t0);
        state.apply_tick(&tick("AAPL", "2024-03-15T13:31:10Z", "100"), t0);
        state.apply_tick(&tick("AAPL", "2024-03-15T13:32:10Z", "100"), t0);
        assert_eq!(state.minute_count(), 3);
        assert_eq!(state.recent_count(), 2);

        // Within retention and TTL: nothing goes
        let report = state.evict(utc("2024-03-15T13:30:15Z"), Duration::from_secs(3600), Duration::from_secs(10));
        assert_eq!(report, EvictionReport::default());

        let report = state.evict(utc("2024-03-15T15:00:00Z"), Duration::from_secs(3600), Duration::from_secs(10));
        assert_eq!(report.minute_candles, 2);
        assert_eq!(report.recent_entries, 2);
        // Open candle survives
        assert_eq!(state.minute_count(), 1);
        assert_eq!(state.recent_count(), 0);
    }

    #[test]
    fn test_latest_falls_back_to_recent_cache() {
        let mut state = state();
        let now = utc("2024-03-15T19:59:00Z");
        state.apply_tick(&tick("AAPL", "2024-03-15T19:59:00Z", "100"), now);
        let close_at = utc("2024-03-15T20:00:00Z");
        state.force_finalize(FlushScope::MarketClose { close_at }, close_at);

        let daily = state.latest(&Symbol::new("AAPL"), Timeframe::D1).unwrap();
        assert!(daily.is_final());
        assert_eq!(daily.close(), px("100"));

        state.evict(utc("2024-03-15T20:01:00Z"), Duration::from_secs(3600), Duration::from_secs(10));
        assert!(state.latest(&Symbol::new("AAPL"), Timeframe::D1).is_none());
        // 1m candle is still within retention
        assert!(state.latest(&Symbol::new("AAPL"), Timeframe::M1).is_some());
        assert!(state.latest(&Symbol::new("MSFT"), Timeframe::M1).is_none());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn at_most_one_open_candle_per_key(
                offsets in proptest::collection::vec(0i64..7 * 24 * 3600, 1..80),
                prices in proptest::collection::vec(1u64..1000, 80),
            ) {
                let mut state = CandleState::new(MarketCalendar::default());
                let base = utc("2024-03-11T00:00:00Z");
                let symbol = Symbol::new("AAPL");
                for (i, offset) in offsets.iter().enumerate() {
                    let ts = base + chrono::Duration::seconds(*offset);
                    let tick = Tick::new(symbol.clone(), Price::from_u64(prices[i]), ts);
                    let outcome = state.apply_tick(&tick, ts);
                    prop_assert!(state.open_count() <= Timeframe::all().len());
                    for candle in outcome.updated.iter().chain(outcome.finalized.iter()) {
                        prop_assert!(candle.is_valid());
                    }
                    for candle in &outcome.finalized {
                        prop_assert!(candle.is_final());
                    }
                }
            }
        }
    }
}
