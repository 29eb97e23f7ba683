//! Common types and utilities shared across the granule ingestion services.

pub mod bbox;
pub mod error;
pub mod time;

pub use bbox::BoundingBox;
pub use error::{GranuleError, GranuleResult};
pub use time::{parse_datetime_flexible, DatetimeInterval, TimeParseError, TimeRange};
