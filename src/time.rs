//! Millisecond timestamp helpers shared by the catalog, planner, and driver.

use chrono::{TimeZone, Utc};

pub type Timestamp = u64;

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_ms() -> Timestamp {
    Utc::now().timestamp_millis().max(0) as Timestamp
}

/// Human-readable rendering of a millisecond timestamp, for log lines only.
///
/// Falls back to the raw integer if the value is out of `chrono`'s
/// representable range (should not happen for any real sample, but this is a
/// debug aid, not a codec, so it must never panic).
pub fn format_ts(ts: Timestamp) -> String {
    match Utc.timestamp_millis_opt(ts as i64) {
        chrono::LocalResult::Single(dt) => dt.format("%d %b %Y - %H:%M:%S%.3f").to_string(),
        _ => format!("<invalid ts {ts}>"),
    }
}
