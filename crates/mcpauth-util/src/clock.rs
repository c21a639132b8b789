//! Wall-clock helpers.

use chrono::Utc;

/// Current time in seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_and_secs_agree() {
        let secs = now_secs();
        let millis = now_millis();
        // Allow for a second boundary between the two reads.
        assert!(millis / 1000 >= secs);
        assert!(millis / 1000 - secs <= 1);
    }

    #[test]
    fn test_now_is_after_2020() {
        assert!(now_secs() > 1_577_836_800);
    }
}
