//! Timestamp formatting for SQLite storage
//!
//! Timestamps are stored as RFC 3339 UTC strings with a fixed microsecond
//! precision so that lexicographic comparison in SQL matches chronological
//! order. All reads and writes must go through these helpers.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::StoreError;

/// Formats a timestamp for storage
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored timestamp
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::SerializationError(format!("Invalid timestamp '{s}': {e}")))
}

/// Parses an optional stored timestamp
pub fn parse_ts_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(parse_ts).transpose()
}
