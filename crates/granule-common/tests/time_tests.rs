//! Tests for datetime parsing and interval expansion.

use chrono::{Datelike, TimeZone, Timelike, Utc};
use granule_common::time::{parse_datetime_flexible, DatetimeInterval, TimeParseError, TimeRange};

// ============================================================================
// Flexible parsing tests
// ============================================================================

#[test]
fn test_parse_year_only() {
    let dt = parse_datetime_flexible("2005").unwrap();
    assert_eq!(dt, Utc.with_ymd_and_hms(2005, 1, 1, 0, 0, 0).unwrap());
}

#[test]
fn test_parse_year_month_forms() {
    let dashed = parse_datetime_flexible("2005-07").unwrap();
    let compact = parse_datetime_flexible("200507").unwrap();
    assert_eq!(dashed, compact);
    assert_eq!(dashed.month(), 7);
    assert_eq!(dashed.day(), 1);
}

#[test]
fn test_parse_naive_datetime_assumes_utc() {
    let dt = parse_datetime_flexible("2000-06-21T06:30:00").unwrap();
    assert_eq!(dt.hour(), 6);
    assert_eq!(dt.minute(), 30);
}

#[test]
fn test_parse_offset_is_normalized() {
    let dt = parse_datetime_flexible("2000-06-21T02:00:00-04:00").unwrap();
    assert_eq!(dt.hour(), 6);
}

#[test]
fn test_parse_rejects_garbage() {
    assert!(matches!(
        parse_datetime_flexible("abcd"),
        Err(TimeParseError::InvalidFormat(_))
    ));
    assert!(parse_datetime_flexible("2005-13").is_err());
    assert!(parse_datetime_flexible("").is_err());
}

// ============================================================================
// TimeRange tests
// ============================================================================

#[test]
fn test_range_rejects_inverted() {
    let result = TimeRange::parse("2000-07-10", "2000-06-21");
    assert!(matches!(result, Err(TimeParseError::InvertedRange { .. })));
}

#[test]
fn test_range_allows_equal_bounds() {
    let range = TimeRange::parse("2000-06-21", "2000-06-21").unwrap();
    assert_eq!(range.start, range.end);
}

#[test]
fn test_range_query_param() {
    let range = TimeRange::parse("2000-06-21T00:00:00Z", "2000-07-10T00:00:00Z").unwrap();
    assert_eq!(
        range.to_query_param(),
        "2000-06-21T00:00:00Z,2000-07-10T00:00:00Z"
    );
}

#[test]
fn test_range_contains_is_inclusive() {
    let range = TimeRange::parse("2000-06-21", "2000-06-22").unwrap();
    assert!(range.contains(&range.start));
    assert!(range.contains(&range.end));
    assert!(!range.contains(&Utc.with_ymd_and_hms(2000, 6, 23, 0, 0, 0).unwrap()));
}

// ============================================================================
// Interval expansion tests
// ============================================================================

#[test]
fn test_expand_year() {
    let dt = Utc.with_ymd_and_hms(2005, 6, 15, 12, 0, 0).unwrap();
    let (start, end) = DatetimeInterval::Year.expand(dt).unwrap();
    assert_eq!(start, Utc.with_ymd_and_hms(2005, 1, 1, 0, 0, 0).unwrap());
    assert_eq!(end, Utc.with_ymd_and_hms(2005, 12, 31, 23, 59, 59).unwrap());
}

#[test]
fn test_expand_month_december() {
    let dt = Utc.with_ymd_and_hms(2004, 12, 3, 0, 0, 0).unwrap();
    let (start, end) = DatetimeInterval::Month.expand(dt).unwrap();
    assert_eq!(start, Utc.with_ymd_and_hms(2004, 12, 1, 0, 0, 0).unwrap());
    assert_eq!(end, Utc.with_ymd_and_hms(2004, 12, 31, 23, 59, 59).unwrap());
}

#[test]
fn test_expand_month_leap_february() {
    let dt = Utc.with_ymd_and_hms(2004, 2, 10, 0, 0, 0).unwrap();
    let (_, end) = DatetimeInterval::Month.expand(dt).unwrap();
    assert_eq!(end, Utc.with_ymd_and_hms(2004, 2, 29, 23, 59, 59).unwrap());
}

#[test]
fn test_expand_day() {
    let dt = Utc.with_ymd_and_hms(2000, 6, 21, 17, 45, 0).unwrap();
    let (start, end) = DatetimeInterval::Day.expand(dt).unwrap();
    assert_eq!(start, Utc.with_ymd_and_hms(2000, 6, 21, 0, 0, 0).unwrap());
    assert_eq!(end, Utc.with_ymd_and_hms(2000, 6, 21, 23, 59, 59).unwrap());
}

#[test]
fn test_interval_serde_lowercase() {
    let parsed: DatetimeInterval = serde_json::from_str("\"year\"").unwrap();
    assert_eq!(parsed, DatetimeInterval::Year);
}
