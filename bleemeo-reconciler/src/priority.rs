//! Registration-queue ordering.
//!
//! Before each metrics-sync iteration, `current_metrics` is reordered so
//! a fixed set of "high priority" labels float to the head; the
//! remainder is shuffled so a single misbehaving identity can't starve
//! the same set of low-priority metrics across every run.

use bleemeo_core::MetricRegistrationRequest;
use rand::seq::SliceRandom;
use rand::Rng;

/// Stable-partition `requests` into high-priority-first, then shuffle the
/// low-priority tail in place.
pub fn prioritize(mut requests: Vec<MetricRegistrationRequest>, rng: &mut impl Rng) -> Vec<MetricRegistrationRequest> {
    // `sort_by_key` is stable, so this keeps high-priority entries first
    // without disturbing their relative order.
    requests.sort_by_key(|req| !req.is_high_priority());
    let split = requests.iter().position(|req| !req.is_high_priority()).unwrap_or(requests.len());
    requests[split..].shuffle(rng);
    requests
}
