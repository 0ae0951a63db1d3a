//! Reconnection backoff policy.
//!
//! The broker connection flaps under normal operation (NAT timeouts,
//! load-balancer rotation); the policy below escalates the retry delay
//! only once flapping looks sustained, rather than hammering the broker
//! on every transient drop. Tracks the last 15 disconnects and derives a
//! delay from three tiers, most-severe first.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;

/// Only the most recent 15 disconnects are tracked.
const HISTORY_LEN: usize = 15;

const WINDOW_SHORT: f64 = 60.0;
const WINDOW_LONG: f64 = 600.0;

/// Tracks recent disconnect timestamps (monotonic seconds) and derives the
/// delay before the next reconnect attempt.
#[derive(Debug, Default)]
pub struct ReconnectPolicy {
    disconnects: VecDeque<f64>,
    successive_failures: u32,
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a disconnect at `now`, keeping only the most recent 15.
    pub fn record_disconnect(&mut self, now: f64) {
        self.disconnects.push_back(now);
        while self.disconnects.len() > HISTORY_LEN {
            self.disconnects.pop_front();
        }
        self.successive_failures += 1;
    }

    /// A successful, stable connection resets the successive-failure
    /// counter; the tracked disconnect history is left alone since it
    /// describes recent history, not consecutive failures.
    pub fn record_connected(&mut self) {
        self.successive_failures = 0;
    }

    fn count_since(&self, now: f64, window: f64) -> usize {
        self.disconnects.iter().filter(|&&t| now - t <= window).count()
    }

    /// The delay to wait before the next connection attempt. Tiers, most
    /// severe first:
    /// 1. ≥15 disconnects in the last 600s → `300 ± 60` seconds.
    /// 2. ≥6 disconnects in the last 60s → `60 ± 15` seconds.
    /// 3. ≥3 successive connect failures → `rand(min(300, 20n), min(900, 60n))`
    ///    seconds, `n` the successive-failure count.
    /// 4. Otherwise: reconnect immediately.
    pub fn next_delay(&self, now: f64) -> Duration {
        self.next_delay_with_rng(now, &mut rand::thread_rng())
    }

    fn next_delay_with_rng(&self, now: f64, rng: &mut impl Rng) -> Duration {
        if self.count_since(now, WINDOW_LONG) >= HISTORY_LEN {
            return jittered(rng, 300.0, 60.0);
        }
        if self.count_since(now, WINDOW_SHORT) >= 6 {
            return jittered(rng, 60.0, 15.0);
        }
        if self.successive_failures >= 3 {
            let n = self.successive_failures as f64;
            let low = (20.0 * n).min(300.0);
            let high = (60.0 * n).min(900.0).max(low);
            return Duration::from_secs_f64(rng.gen_range(low..=high));
        }
        Duration::ZERO
    }
}

fn jittered(rng: &mut impl Rng, center: f64, spread: f64) -> Duration {
    let delta = rng.gen_range(-spread..=spread);
    Duration::from_secs_f64((center + delta).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn fewer_than_three_failures_reconnects_immediately() {
        let mut policy = ReconnectPolicy::new();
        policy.record_disconnect(0.0);
        policy.record_disconnect(1.0);
        assert_eq!(policy.next_delay(1.0), Duration::ZERO);
    }

    #[test]
    fn three_successive_failures_use_the_rand_formula() {
        let mut policy = ReconnectPolicy::new();
        for t in [0.0, 1.0, 2.0] {
            policy.record_disconnect(t);
        }
        // n=3: low=min(300,60)=60, high=min(900,180)=180.
        let mut rng = StepRng::new(0, 1);
        let delay = policy.next_delay_with_rng(2.0, &mut rng).as_secs_f64();
        assert!((60.0..=180.0).contains(&delay), "delay {delay} out of [60,180]");
    }

    #[test]
    fn burst_of_six_in_a_minute_escalates_to_60_plus_minus_15() {
        let mut policy = ReconnectPolicy::new();
        for t in [0.0, 10.0, 20.0, 30.0, 40.0, 50.0] {
            policy.record_disconnect(t);
        }
        let mut rng = StepRng::new(0, 1);
        let delay = policy.next_delay_with_rng(50.0, &mut rng).as_secs_f64();
        assert!((45.0..=75.0).contains(&delay), "delay {delay} out of [45,75]");
    }

    #[test]
    fn sustained_flapping_hits_the_longest_tier() {
        let mut policy = ReconnectPolicy::new();
        for i in 0..15 {
            policy.record_disconnect(i as f64 * 30.0);
        }
        let mut rng = StepRng::new(0, 1);
        let delay = policy.next_delay_with_rng(14.0 * 30.0, &mut rng).as_secs_f64();
        assert!((240.0..=360.0).contains(&delay), "delay {delay} out of [240,360]");
    }

    #[test]
    fn only_the_most_recent_fifteen_disconnects_count() {
        let mut policy = ReconnectPolicy::new();
        for i in 0..20 {
            policy.record_disconnect(i as f64 * 100.0);
        }
        assert_eq!(policy.disconnects.len(), HISTORY_LEN);
        assert_eq!(*policy.disconnects.front().unwrap(), 500.0);
    }

    #[test]
    fn a_stable_connection_resets_successive_failures() {
        let mut policy = ReconnectPolicy::new();
        policy.record_disconnect(0.0);
        policy.record_disconnect(1.0);
        policy.record_disconnect(2.0);
        policy.record_connected();
        assert_eq!(policy.next_delay(2.0), Duration::ZERO);
    }
}
