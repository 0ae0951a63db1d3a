//! Monotonic-clock helpers.
//!
//! All internal scheduling uses a monotonic clock; wall-clock time is
//! reserved for fields that are transmitted to, or compared against, the
//! remote side. `MonoClock` wraps `std::time::Instant` behind a trait so
//! tests can substitute a controllable fake instead of sleeping.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic seconds, decoupled from wall-clock time so
/// scheduling is unaffected by clock adjustments (NTP steps, DST, manual
/// changes).
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Real wall-clock-independent clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Current wall-clock time in seconds since the Unix epoch, for fields that
/// cross the wire (e.g. `deactivated_at`, fact values comparisons).
pub fn wall_time() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs_f64()
}

#[cfg(test)]
pub struct FakeClock {
    seconds: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl FakeClock {
    pub fn new(start: u64) -> Self {
        Self { seconds: std::sync::atomic::AtomicU64::new(start) }
    }

    pub fn advance(&self, delta: u64) {
        self.seconds.fetch_add(delta, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now(&self) -> f64 {
        self.seconds.load(std::sync::atomic::Ordering::SeqCst) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_monotonically() {
        let clock = FakeClock::new(1_000);
        assert_eq!(clock.now(), 1000.0);
        clock.advance(30);
        assert_eq!(clock.now(), 1030.0);
    }

    #[test]
    fn system_clock_is_nondecreasing() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
