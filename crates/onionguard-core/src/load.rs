//! CPU load sampling
//!
//! Readings are cached so callers on a hot path never pay for a refresh more
//! than once per `max_age`.

use std::time::{Duration, Instant};
use sysinfo::System;

/// Default cache lifetime of a reading
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5);

/// Cached global CPU usage as a fraction in `0.0..=1.0`
pub struct LoadMonitor {
    sys: System,
    max_age: Duration,
    last: Option<(Instant, f64)>,
}

impl Default for LoadMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE)
    }
}

impl LoadMonitor {
    pub fn new(max_age: Duration) -> Self {
        let mut sys = System::new();
        // First refresh establishes the baseline for the next delta
        sys.refresh_cpu_usage();
        Self {
            sys,
            max_age,
            last: None,
        }
    }

    /// Current load, refreshed when the cached reading is stale
    pub fn load(&mut self) -> f64 {
        if let Some((at, value)) = self.last {
            if at.elapsed() < self.max_age {
                return value;
            }
        }

        self.sys.refresh_cpu_usage();
        let value = (self.sys.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0);
        self.last = Some((Instant::now(), value));
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_is_a_fraction() {
        let mut monitor = LoadMonitor::default();
        let load = monitor.load();
        assert!((0.0..=1.0).contains(&load));
    }

    #[test]
    fn test_reading_is_cached() {
        let mut monitor = LoadMonitor::new(Duration::from_secs(3600));
        let first = monitor.load();
        assert_eq!(monitor.load(), first);
    }
}
