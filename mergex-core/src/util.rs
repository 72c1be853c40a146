//! Small shared helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as float seconds since the Unix epoch.
///
/// Queue items and throttle markers carry float-second timestamps on the
/// wire, so everything that touches `ts`, `not_before`, or `until` goes
/// through this.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
