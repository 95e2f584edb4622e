//! Log throttling
//!
//! Limits how often the same log message is recorded, so a camera that lost
//! signal or a registry that went away does not flood the journal at sampler
//! cadence.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Throttles repeated log messages by key
pub struct LogThrottler {
    last_logged: Mutex<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` if the message should be logged now.
    /// When `true` is returned the internal timestamp is updated.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Clear throttle state for a key so the next occurrence logs immediately.
    /// Called when an error condition recovers.
    pub fn clear(&self, key: &str) {
        self.last_logged.lock().remove(key);
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(50));

        assert!(throttler.should_log("signal_lost"));
        assert!(!throttler.should_log("signal_lost"));

        thread::sleep(Duration::from_millis(80));
        assert!(throttler.should_log("signal_lost"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("cam0"));
        assert!(throttler.should_log("cam1"));
        assert!(!throttler.should_log("cam0"));
    }

    #[test]
    fn test_clear_resets() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("cam0"));
        throttler.clear("cam0");
        assert!(throttler.should_log("cam0"));
    }
}
