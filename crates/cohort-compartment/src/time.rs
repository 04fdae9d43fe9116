//! Logical time sources.
//!
//! Everything that needs "now" asks an injected [`TimeSource`] instead of
//! reading the wall clock directly, so tests can drive time by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current time in milliseconds.
pub trait TimeSource: Send + Sync {
    fn current_time(&self) -> u64;
}

/// Wall-clock time in milliseconds since the UNIX epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn current_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced time, for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move time forward by `millis`, returning the new time.
    pub fn advance(&self, millis: u64) -> u64 {
        self.now.fetch_add(millis, Ordering::SeqCst) + millis
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn current_time(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time_source() {
        let time = ManualTimeSource::new(100);
        assert_eq!(time.current_time(), 100);
        assert_eq!(time.advance(50), 150);
        time.set(10);
        assert_eq!(time.current_time(), 10);
    }

    #[test]
    fn test_system_time_is_monotone_enough() {
        let time = SystemTimeSource;
        let a = time.current_time();
        let b = time.current_time();
        assert!(b >= a);
        assert!(a > 0);
    }
}
