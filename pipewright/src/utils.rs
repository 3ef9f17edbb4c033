//! Timestamp and identifier helpers.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A UTC timestamp.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC time as an ISO 8601 string with microsecond precision.
///
/// # Examples
///
/// ```
/// use pipewright::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with("+00:00"));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    format_timestamp(&Utc::now())
}

/// Formats a timestamp the same way as [`iso_timestamp`].
#[must_use]
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Generates a fresh run identifier.
///
/// Uses UUID v7 so identifiers sort by creation time.
#[must_use]
pub fn generate_run_id() -> String {
    Uuid::now_v7().to_string()
}

/// Returns milliseconds elapsed between two timestamps, saturating at zero.
#[must_use]
pub fn elapsed_ms(start: &Timestamp, end: &Timestamp) -> u64 {
    u64::try_from((*end - *start).num_milliseconds()).unwrap_or(0)
}
