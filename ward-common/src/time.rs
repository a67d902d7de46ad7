//! Small timestamp helpers.
//!
//! The durable store persists `TIMESTAMPTZ` (always UTC); everything above
//! the store speaks integer unix epochs. These helpers are the only place
//! the conversion happens.

use chrono::{DateTime, Utc};

/// Current unix timestamp in whole seconds.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Convert a database timestamp to a unix epoch.
pub fn to_epoch(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

/// Convert an optional database timestamp to an optional unix epoch.
pub fn to_epoch_opt(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(to_epoch)
}

/// Convert a unix epoch back to a database timestamp.
///
/// Epochs outside chrono's representable range clamp to the epoch origin;
/// they can only arise from corrupted rows.
pub fn from_epoch(epoch: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(epoch, 0).unwrap_or_default()
}
