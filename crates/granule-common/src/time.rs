//! Time handling utilities for granule discovery and catalog records.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A closed time window `[start, end]` for discovery queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a range, rejecting `start > end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, TimeParseError> {
        if start > end {
            return Err(TimeParseError::InvertedRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    /// Parse `"start/end"` (or two separate values) using [`parse_datetime_flexible`].
    pub fn parse(start: &str, end: &str) -> Result<Self, TimeParseError> {
        let start = parse_datetime_flexible(start)?;
        let end = parse_datetime_flexible(end)?;
        Self::new(start, end)
    }

    pub fn contains(&self, dt: &DateTime<Utc>) -> bool {
        dt >= &self.start && dt <= &self.end
    }

    /// Render as the `start,end` form catalog search endpoints accept.
    pub fn to_query_param(&self) -> String {
        format!(
            "{},{}",
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Granularity used to widen a single captured date into a covering interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatetimeInterval {
    Day,
    Month,
    Year,
}

impl DatetimeInterval {
    /// Expand `dt` to the first and last instant of its containing day, month or year.
    pub fn expand(&self, dt: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), TimeParseError> {
        let date = dt.date_naive();
        let (first, next) = match self {
            DatetimeInterval::Day => (date, date.succ_opt()),
            DatetimeInterval::Month => {
                let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1);
                let next = if date.month() == 12 {
                    NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
                };
                match first {
                    Some(first) => (first, next),
                    None => (date, None),
                }
            }
            DatetimeInterval::Year => {
                let first = NaiveDate::from_ymd_opt(date.year(), 1, 1);
                let next = NaiveDate::from_ymd_opt(date.year() + 1, 1, 1);
                match first {
                    Some(first) => (first, next),
                    None => (date, None),
                }
            }
        };
        let next = next.ok_or_else(|| TimeParseError::OutOfRange(dt.to_rfc3339()))?;
        let start = Utc.from_utc_datetime(&first.and_time(chrono::NaiveTime::MIN));
        let end = Utc.from_utc_datetime(&next.and_time(chrono::NaiveTime::MIN)) - Duration::seconds(1);
        Ok((start, end))
    }
}

impl std::str::FromStr for DatetimeInterval {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" => Ok(DatetimeInterval::Day),
            "month" => Ok(DatetimeInterval::Month),
            "year" => Ok(DatetimeInterval::Year),
            other => Err(TimeParseError::InvalidFormat(format!(
                "unknown datetime range '{}'",
                other
            ))),
        }
    }
}

/// Parse a datetime written in any of the layouts granule filenames and
/// event payloads use.
///
/// Accepted, in order:
/// - RFC 3339: "2024-01-15T12:00:00Z"
/// - naive datetime, assumed UTC: "2024-01-15T12:00:00"
/// - date: "2024-01-15" or "20240115"
/// - year-month: "2024-01" or "202401"
/// - year: "2024"
///
/// Partial forms resolve to the first instant of the period.
pub fn parse_datetime_flexible(s: &str) -> Result<DateTime<Utc>, TimeParseError> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }

    for fmt in ["%Y-%m-%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)));
        }
    }

    let digits_only = s.chars().all(|c| c.is_ascii_digit());
    let year_month = match (s.len(), digits_only) {
        (7, false) if s.as_bytes()[4] == b'-' => Some((&s[..4], &s[5..])),
        (6, true) => Some((&s[..4], &s[4..])),
        _ => None,
    };
    if let Some((year, month)) = year_month {
        if let (Ok(year), Ok(month)) = (year.parse::<i32>(), month.parse::<u32>()) {
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, 1) {
                return Ok(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)));
            }
        }
    }

    if s.len() == 4 && digits_only {
        if let Ok(year) = s.parse::<i32>() {
            if let Some(date) = NaiveDate::from_ymd_opt(year, 1, 1) {
                return Ok(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)));
            }
        }
    }

    Err(TimeParseError::InvalidFormat(s.to_string()))
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TimeParseError {
    #[error("Invalid time format: {0}")]
    InvalidFormat(String),

    #[error("Time range start {start} is after end {end}")]
    InvertedRange { start: String, end: String },

    #[error("Time out of representable range: {0}")]
    OutOfRange(String),
}
