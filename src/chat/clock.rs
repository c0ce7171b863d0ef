// Wall-clock helpers
//
// All persisted and signed timestamps are milliseconds since the Unix epoch.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Saturating conversion of a duration to whole milliseconds
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_advances() {
        let a = now_millis();
        std::thread::sleep(Duration::from_millis(5));
        let b = now_millis();
        assert!(b >= a + 5);
    }

    #[test]
    fn test_duration_millis() {
        assert_eq!(duration_millis(Duration::from_secs(60)), 60_000);
        assert_eq!(duration_millis(Duration::from_micros(1500)), 1);
    }
}
