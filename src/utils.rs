use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Convert a capture timestamp (offset from the Unix epoch) into a UTC datetime.
pub fn timestamp_from_duration(offset: Duration) -> DateTime<Utc> {
    Utc.timestamp_opt(offset.as_secs() as i64, offset.subsec_nanos())
        .single()
        .unwrap_or_default()
}

/// Inverse of [`timestamp_from_duration`]; instants before the epoch clamp to zero.
pub fn duration_since_epoch(timestamp: DateTime<Utc>) -> Duration {
    let secs = timestamp.timestamp();
    if secs < 0 {
        return Duration::ZERO;
    }
    Duration::new(secs as u64, timestamp.timestamp_subsec_nanos())
}

/// Whole seconds, rounded down and clamped at zero, between `now` and `deadline`.
pub fn remaining_seconds(deadline: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (deadline - now).num_seconds().max(0) as u64
}

/// Longest configurable window or block duration (100 years)
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Turn a configured number of seconds into a chrono duration, clamped to
/// [`MAX_DURATION_SECS`] so date arithmetic on it cannot overflow.
pub fn seconds_duration(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

pub fn format_file_stamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y%m%d_%H%M%S").to_string()
}
