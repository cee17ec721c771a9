//! Bucket calculator and market calendar
//!
//! Maps a tick timestamp and a timeframe to the aligned `[start, end)`
//! bucket. Fixed-minute buckets align to the hour. Daily buckets start at
//! midnight UTC and end at the exchange close, converted to UTC for that
//! specific date so daylight-saving shifts move the boundary automatically.
//! Weekly buckets start Monday 00:00 UTC.
//!
//! Everything here is a pure function of its inputs; no wall clock.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc,
    Weekday,
};
use chrono_tz::Tz;
use types::candle::Bucket;
use types::errors::TimestampError;
use types::tick::TimestampInput;
use types::timeframe::Timeframe;

/// Exchange close expressed as a wall-clock time in a named time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketCalendar {
    timezone: Tz,
    close_time: NaiveTime,
}

impl Default for MarketCalendar {
    /// US equities: 16:00 America/New_York.
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            close_time: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl MarketCalendar {
    pub fn new(timezone: Tz, close_time: NaiveTime) -> Self {
        Self {
            timezone,
            close_time,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn close_time(&self) -> NaiveTime {
        self.close_time
    }

    /// The close instant for a calendar date, in UTC.
    ///
    /// An ambiguous local time (DST fall-back) resolves to the earlier
    /// instant; a non-existent one (spring-forward gap) moves one hour later.
    pub fn market_close_utc(&self, date: NaiveDate) -> DateTime<Utc> {
        let local = date.and_time(self.close_time);
        let resolved = match self.timezone.from_local_datetime(&local) {
            LocalResult::Single(dt) => Some(dt),
            LocalResult::Ambiguous(earliest, _) => Some(earliest),
            LocalResult::None => self
                .timezone
                .from_local_datetime(&(local + Duration::hours(1)))
                .earliest(),
        };
        match resolved {
            Some(dt) => dt.with_timezone(&Utc),
            None => local.and_utc(),
        }
    }

    /// UTC hour of the close on `date` (21 in EST, 20 in EDT for 16:00 New York).
    pub fn market_close_utc_hour(&self, date: NaiveDate) -> u32 {
        self.market_close_utc(date).hour()
    }

    /// Daily session labelled by `date`: midnight UTC up to the close,
    /// rolled forward a day if the close does not fall after midnight.
    pub fn session_for_date(&self, date: NaiveDate) -> Bucket {
        let start = midnight_utc(date);
        let mut end = self.market_close_utc(date);
        if end <= start {
            end += Duration::days(1);
        }
        Bucket::new(start, end)
    }

    /// Daily bucket for a tick. Ticks at or after the close belong to the
    /// next date's session.
    pub fn daily_bucket(&self, ts: DateTime<Utc>) -> Bucket {
        let date = ts.date_naive();
        let session = self.session_for_date(date);
        if ts < session.end {
            session
        } else {
            self.session_for_date(date + Duration::days(1))
        }
    }

    /// First close strictly after `now`.
    pub fn next_close_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive();
        let today = self.session_for_date(date).end;
        if today > now {
            today
        } else {
            self.session_for_date(date + Duration::days(1)).end
        }
    }

    /// Whether a close is the last session of its ISO week (Friday or later
    /// in exchange-local time).
    pub fn is_week_final_session(&self, close: DateTime<Utc>) -> bool {
        matches!(
            close.with_timezone(&self.timezone).weekday(),
            Weekday::Fri | Weekday::Sat | Weekday::Sun
        )
    }

    /// Bucket containing `ts` for `timeframe`.
    pub fn bucket_for(&self, ts: DateTime<Utc>, timeframe: Timeframe) -> Bucket {
        match timeframe.fixed_minutes() {
            Some(minutes) => fixed_bucket(ts, minutes),
            None if timeframe == Timeframe::D1 => self.daily_bucket(ts),
            None => weekly_bucket(ts),
        }
    }

    /// Bucket for a raw feed timestamp (epoch millis or ISO-8601 text).
    pub fn bucket_for_input(
        &self,
        input: &TimestampInput,
        timeframe: Timeframe,
    ) -> Result<Bucket, TimestampError> {
        Ok(self.bucket_for(input.to_utc()?, timeframe))
    }
}

/// Midnight UTC at the start of `date`.
pub fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Monday 00:00 UTC of the ISO week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

fn fixed_bucket(ts: DateTime<Utc>, minutes: u32) -> Bucket {
    // Every width divides 60 minutes, so epoch alignment is hour alignment.
    let width = i64::from(minutes) * 60;
    let start_secs = ts.timestamp().div_euclid(width) * width;
    let start = DateTime::<Utc>::from_timestamp(start_secs, 0).unwrap_or(ts);
    Bucket::new(start, start + Duration::seconds(width))
}

fn weekly_bucket(ts: DateTime<Utc>) -> Bucket {
    let start = midnight_utc(week_start(ts.date_naive()));
    Bucket::new(start, start + Duration::days(7))
}
