//! Time intervals and bucketing granularities.
//!
//! All timestamps are epoch milliseconds in UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Result, SinkbufError};

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// A half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    start: i64,
    end: i64,
}

impl Interval {
    /// The interval covering every representable timestamp.
    pub const ETERNITY: Interval = Interval {
        start: i64::MIN,
        end: i64::MAX,
    };

    /// Creates a new interval, rejecting `start > end`.
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(SinkbufError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Returns true when `other` lies entirely within this interval.
    pub fn encloses(&self, other: &Interval) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns the overlapping part of two intervals, if any.
    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Interval { start, end })
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", format_millis(self.start), format_millis(self.end))
    }
}

impl FromStr for Interval {
    type Err = SinkbufError;

    /// Parses `<start>/<end>` or `<start>/<period>`, where instants are
    /// RFC 3339, `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD`, and periods are of
    /// the form `P<n>D`, `PT<n>H`, `PT<n>M` or `PT<n>S`.
    fn from_str(input: &str) -> Result<Self> {
        let parse_error = |details: &str| SinkbufError::IntervalParse {
            input: input.to_string(),
            details: details.to_string(),
        };

        let (left, right) = input
            .split_once('/')
            .ok_or_else(|| parse_error("expected '<start>/<end>'"))?;
        let start = parse_instant(left.trim()).ok_or_else(|| parse_error("bad start"))?;
        let end = match parse_period(right.trim()) {
            Some(period) => start
                .checked_add(period)
                .ok_or_else(|| parse_error("period overflows"))?,
            None => parse_instant(right.trim()).ok_or_else(|| parse_error("bad end"))?,
        };

        Interval::new(start, end)
    }
}

/// Parses a single instant into epoch milliseconds.
pub fn parse_instant(input: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis());
    }
    if input.len() == 4 && input.bytes().all(|b| b.is_ascii_digit()) {
        let year = input.parse::<i32>().ok()?;
        return NaiveDate::from_ymd_opt(year, 1, 1)?
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis());
    }
    None
}

fn parse_period(input: &str) -> Option<i64> {
    let body = input.strip_prefix('P')?;
    let (digits, unit) = if let Some(time) = body.strip_prefix('T') {
        let unit = match time.chars().last()? {
            'H' => MILLIS_PER_HOUR,
            'M' => MILLIS_PER_MINUTE,
            'S' => MILLIS_PER_SECOND,
            _ => return None,
        };
        (&time[..time.len() - 1], unit)
    } else {
        let unit = match body.chars().last()? {
            'D' => MILLIS_PER_DAY,
            'W' => 7 * MILLIS_PER_DAY,
            _ => return None,
        };
        (&body[..body.len() - 1], unit)
    };
    digits.parse::<i64>().ok()?.checked_mul(unit)
}

/// Formats epoch milliseconds as RFC 3339, falling back to the raw number
/// for values chrono cannot represent.
pub fn format_millis(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => millis.to_string(),
    }
}

/// Bucketing applied to timestamps for rollup and time-series queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// Timestamps are kept as is.
    #[default]
    None,
    Second,
    Minute,
    FifteenMinute,
    Hour,
    Day,
}

impl Granularity {
    /// Bucket width in milliseconds, `None` for [`Granularity::None`].
    pub fn period_millis(&self) -> Option<i64> {
        match self {
            Granularity::None => None,
            Granularity::Second => Some(MILLIS_PER_SECOND),
            Granularity::Minute => Some(MILLIS_PER_MINUTE),
            Granularity::FifteenMinute => Some(15 * MILLIS_PER_MINUTE),
            Granularity::Hour => Some(MILLIS_PER_HOUR),
            Granularity::Day => Some(MILLIS_PER_DAY),
        }
    }

    /// Floors a timestamp to the start of its bucket.
    pub fn truncate(&self, timestamp: i64) -> i64 {
        match self.period_millis() {
            Some(period) => timestamp.div_euclid(period) * period,
            None => timestamp,
        }
    }
}
