//! RAII timing for remote calls.
//!
//! ```rust,ignore
//! let _timing = TimingGuard::new("token_exchange");
//! client.post(url).send().await?;
//! // duration is logged when `_timing` drops
//! ```

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Logs how long an operation took when dropped.
///
/// Operations slower than the warn threshold are logged at `warn`, the rest
/// at `debug`.
pub struct TimingGuard {
    operation: &'static str,
    start: Instant,
    warn_after: Duration,
}

impl TimingGuard {
    pub fn new(operation: &'static str) -> Self {
        debug!(operation, "Starting operation");
        Self {
            operation,
            start: Instant::now(),
            warn_after: Duration::from_secs(5),
        }
    }

    /// Set the threshold above which completion is logged at `warn`.
    pub fn with_warn_threshold(mut self, threshold: Duration) -> Self {
        self.warn_after = threshold;
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        if elapsed >= self.warn_after {
            warn!(operation = self.operation, duration_ms, "Slow operation completed");
        } else {
            debug!(operation = self.operation, duration_ms, "Operation completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_increases() {
        let guard = TimingGuard::new("test").with_warn_threshold(Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        assert!(guard.elapsed() >= Duration::from_millis(5));
    }
}
