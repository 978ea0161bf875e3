//! Timestamp, local-day and target-date helpers.
//!
//! Everything is stored in UTC. Schedules and symbolic target dates are
//! interpreted in the coordinator's local timezone, expressed as a fixed
//! offset from UTC.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Errors that can occur while parsing dates.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DateParseError {
    /// The input string is empty.
    #[error("Empty date string")]
    EmptyString,

    /// The input is neither `YYYY-MM-DD` nor a known keyword.
    #[error("Invalid date '{0}': expected YYYY-MM-DD, AUTO, TODAY or TOMORROW")]
    InvalidFormat(String),
}

/// Returns the current UTC time as an RFC 3339 string with microseconds.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Builds a fixed offset from minutes east of UTC, falling back to UTC when
/// the value is out of range.
#[must_use]
pub fn offset_from_minutes(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
}

/// Returns the calendar day of `now` in the given offset.
#[must_use]
pub fn local_date(now: Timestamp, offset: FixedOffset) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}

/// Converts a local wall-clock time on `date` to a UTC timestamp.
///
/// `minutes_from_midnight` may exceed a day; the result rolls forward.
#[must_use]
pub fn local_to_utc(date: NaiveDate, minutes_from_midnight: i64, offset: FixedOffset) -> Timestamp {
    let midnight = date.and_time(NaiveTime::MIN);
    let local = midnight + Duration::minutes(minutes_from_midnight);
    // Fixed offsets have no gaps or folds, so the mapping is always single.
    match offset.from_local_datetime(&local).single() {
        Some(dt) => dt.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&local),
    }
}

/// A target date argument for manual runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DateArg {
    /// An explicit calendar date.
    Date(NaiveDate),
    /// The most recent complete local day (yesterday).
    Auto,
    /// The current local day.
    Today,
    /// The next local day.
    Tomorrow,
}

impl DateArg {
    /// Resolves the argument against the caller's local calendar day.
    #[must_use]
    pub fn resolve(&self, now: Timestamp, offset: FixedOffset) -> NaiveDate {
        let today = local_date(now, offset);
        match self {
            Self::Date(date) => *date,
            Self::Auto => today.pred_opt().unwrap_or(today),
            Self::Today => today,
            Self::Tomorrow => today.succ_opt().unwrap_or(today),
        }
    }
}

impl FromStr for DateArg {
    type Err = DateParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(DateParseError::EmptyString);
        }

        match trimmed.to_ascii_uppercase().as_str() {
            "AUTO" => Ok(Self::Auto),
            "TODAY" => Ok(Self::Today),
            "TOMORROW" => Ok(Self::Tomorrow),
            _ => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .map(Self::Date)
                .map_err(|_| DateParseError::InvalidFormat(trimmed.to_string())),
        }
    }
}

impl fmt::Display for DateArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            Self::Auto => write!(f, "AUTO"),
            Self::Today => write!(f, "TODAY"),
            Self::Tomorrow => write!(f, "TOMORROW"),
        }
    }
}

/// Iterates every date in `[start, end]`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |d| *d <= end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Timestamp {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.ends_with("+00:00"));
    }

    #[test]
    fn test_local_date_with_offset() {
        let now = ts("2025-01-15T03:00:00Z");
        assert_eq!(local_date(now, offset_from_minutes(0)), NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
        // 03:00 UTC is still the previous evening five hours west.
        assert_eq!(
            local_date(now, offset_from_minutes(-300)),
            NaiveDate::from_ymd_opt(2025, 1, 14).unwrap()
        );
    }

    #[test]
    fn test_local_to_utc() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 14).unwrap();
        let utc = local_to_utc(date, 13 * 60, offset_from_minutes(-300));
        assert_eq!(utc, ts("2025-01-14T18:00:00Z"));
    }

    #[test]
    fn test_date_arg_parse() {
        assert_eq!("AUTO".parse::<DateArg>().unwrap(), DateArg::Auto);
        assert_eq!("today".parse::<DateArg>().unwrap(), DateArg::Today);
        assert_eq!("TOMORROW".parse::<DateArg>().unwrap(), DateArg::Tomorrow);
        assert_eq!(
            "2025-03-01".parse::<DateArg>().unwrap(),
            DateArg::Date(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap())
        );
        assert_eq!("".parse::<DateArg>(), Err(DateParseError::EmptyString));
        assert!(matches!("03/01/2025".parse::<DateArg>(), Err(DateParseError::InvalidFormat(_))));
    }

    #[test]
    fn test_date_arg_resolve() {
        let now = ts("2025-01-15T12:00:00Z");
        let utc = offset_from_minutes(0);
        assert_eq!(DateArg::Auto.resolve(now, utc), NaiveDate::from_ymd_opt(2025, 1, 14).unwrap());
        assert_eq!(DateArg::Today.resolve(now, utc), NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
        assert_eq!(DateArg::Tomorrow.resolve(now, utc), NaiveDate::from_ymd_opt(2025, 1, 16).unwrap());
    }

    #[test]
    fn test_date_range_inclusive() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 30).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 2, 2).unwrap();
        let days: Vec<_> = date_range(start, end).collect();
        assert_eq!(days.len(), 4);
        assert_eq!(days[3], end);
    }
}
