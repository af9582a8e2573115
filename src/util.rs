/// Small shared helpers: wall-clock timestamps and the overshoot test
/// used by every incremental motion.

use chrono::{Local, TimeZone, Utc};

/// Unix epoch milliseconds. Used for every persisted timestamp and for
/// request timestamps on the bridge.
pub type UnixMillis = i64;

pub fn unix_time_ms() -> UnixMillis {
    Utc::now().timestamp_millis()
}

/// Human-readable local time, e.g. "03:12:45 PM on Mon, Oct 19, 2026"
pub fn friendly_timestamp(unix_time_ms: UnixMillis, include_date: bool) -> String {
    let format = if include_date {
        "%I:%M:%S %p on %a, %b %d, %Y"
    } else {
        "%I:%M:%S %p"
    };
    match Local.timestamp_millis_opt(unix_time_ms).single() {
        Some(time) => time.format(format).to_string(),
        None => format!("{} ms", unix_time_ms),
    }
}

pub fn signum(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// True when taking `step` from `traveled` would leave us strictly farther
/// from `required` than we are now.
pub fn would_move_away_from_target(traveled: f64, step: f64, required: f64) -> bool {
    (traveled + step - required).abs() > (traveled - required).abs()
}

/// Trim trailing zeros so 12.50000 prints as 12.5
pub fn stringify_mm(value: f64) -> String {
    let text = format!("{:.3}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overshoot_rule() {
        // Short of target: keep going
        assert!(!would_move_away_from_target(0.0, 1.0, 5.0));
        // Exactly reaching the target is still progress
        assert!(!would_move_away_from_target(4.0, 1.0, 5.0));
        // Past the target and moving further away
        assert!(would_move_away_from_target(5.0, 1.0, 5.0));
        // Negative direction
        assert!(!would_move_away_from_target(-1.0, -1.0, -3.0));
        assert!(would_move_away_from_target(-2.9, -1.0, -3.0));
    }

    #[test]
    fn test_stringify_mm() {
        assert_eq!(stringify_mm(12.5), "12.5");
        assert_eq!(stringify_mm(3.0), "3");
        assert_eq!(stringify_mm(-0.0001), "0");
        assert_eq!(stringify_mm(0.125), "0.125");
    }

    #[test]
    fn test_signum() {
        assert_eq!(signum(3.2), 1.0);
        assert_eq!(signum(-0.1), -1.0);
        assert_eq!(signum(0.0), 0.0);
    }
}
