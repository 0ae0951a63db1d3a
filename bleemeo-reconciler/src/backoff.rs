//! Pure backoff/delay formulas used by the reconciler loop.

use rand::Rng;

/// Wait between loop iterations after `n_errors` successive phase failures:
/// `min(5 + n_errors, 45)` seconds.
pub fn phase_error_delay(n_errors: u32) -> f64 {
    (5.0 + n_errors as f64).min(45.0)
}

/// After how many successive errors the loop escalates subsequent phases to
/// a full resync.
pub const ESCALATE_AFTER_ERRORS: u32 = 3;

/// `AUTH_ERROR` backoff: `rand(min(300, 10n), min(900, 30n))` seconds.
pub fn auth_error_delay(rng: &mut impl Rng, n_auth_errors: u32) -> f64 {
    let n = n_auth_errors as f64;
    let low = (10.0 * n).min(300.0);
    let high = (30.0 * n).min(900.0).max(low);
    rng.gen_range(low..=high)
}

/// Initial-registration retry delay: exponential `10, 20, 40, ...` capped at
/// 600s.
pub fn registration_retry_delay(attempt: u32) -> f64 {
    let doubled = 10.0 * 2f64.powi(attempt as i32);
    doubled.min(600.0)
}

/// A single metric registration's in-place retry delay:
/// `min(0.5 * attempt, 5)` seconds.
pub fn metric_registration_retry_delay(attempt: u32) -> f64 {
    (0.5 * attempt as f64).min(5.0)
}

/// Maximum number of in-place retries for a single metric registration
/// before giving up and propagating the error.
pub const MAX_METRIC_REGISTRATION_ATTEMPTS: u32 = 10;

/// Initial jitter applied once when starting the loop from a non-empty
/// cache: 5-30 seconds.
pub fn initial_jitter(rng: &mut impl Rng) -> f64 {
    rng.gen_range(5.0..=30.0)
}

/// Full-sync cadence: every 3,500-3,700 seconds unconditionally.
pub fn full_sync_interval(rng: &mut impl Rng) -> f64 {
    rng.gen_range(3_500.0..=3_700.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn phase_error_delay_caps_at_45() {
        assert_eq!(phase_error_delay(0), 5.0);
        assert_eq!(phase_error_delay(10), 15.0);
        assert_eq!(phase_error_delay(100), 45.0);
    }

    #[test]
    fn registration_retry_delay_doubles_then_caps() {
        assert_eq!(registration_retry_delay(0), 10.0);
        assert_eq!(registration_retry_delay(1), 20.0);
        assert_eq!(registration_retry_delay(2), 40.0);
        assert_eq!(registration_retry_delay(10), 600.0);
    }

    #[test]
    fn metric_registration_retry_delay_caps_at_5() {
        assert_eq!(metric_registration_retry_delay(1), 0.5);
        assert_eq!(metric_registration_retry_delay(20), 5.0);
    }

    #[test]
    fn auth_error_delay_stays_within_bounds() {
        let mut rng = StepRng::new(u64::MAX / 2, 1);
        for n in [1, 5, 20, 100] {
            let delay = auth_error_delay(&mut rng, n);
            let expected_low = (10.0 * n as f64).min(300.0);
            let expected_high = (30.0 * n as f64).min(900.0).max(expected_low);
            assert!(delay >= expected_low && delay <= expected_high, "n={n} delay={delay}");
        }
    }

    #[test]
    fn initial_jitter_within_range() {
        let mut rng = StepRng::new(0, 1);
        for _ in 0..10 {
            let j = initial_jitter(&mut rng);
            assert!((5.0..=30.0).contains(&j));
        }
    }

    #[test]
    fn full_sync_interval_within_range() {
        let mut rng = StepRng::new(0, 1);
        for _ in 0..10 {
            let interval = full_sync_interval(&mut rng);
            assert!((3_500.0..=3_700.0).contains(&interval));
        }
    }
}
