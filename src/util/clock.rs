//! Wall-clock helpers.
//!
//! Latency observations are integer differences of two wall-clock instants;
//! timestamps stored on nodes and in the coordination store are UNIX epoch
//! seconds so they survive process restarts.

use chrono::{DateTime, Utc};

/// Current UNIX time in whole seconds.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Current UNIX time in seconds with sub-second precision.
pub fn now_secs_f64() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}

/// Elapsed whole seconds between two instants, clamped at zero.
pub fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn elapsed_is_clamped() {
        let earlier = Utc.timestamp_opt(1_000, 0).unwrap();
        let later = Utc.timestamp_opt(1_042, 0).unwrap();
        assert_eq!(elapsed_secs(earlier, later), 42);
        assert_eq!(elapsed_secs(later, earlier), 0);
    }
}
