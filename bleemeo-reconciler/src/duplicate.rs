//! Duplicate-agent detection.
//!
//! Compares the freshly-fetched `fqdn`/`primary_address`/`primary_mac_address`
//! facts against the cached values; any mismatch means another agent is
//! running with the same credentials. Detections are tracked in a ring of
//! the last 15 events so repeated near-simultaneous detections escalate the
//! hold-off.

use std::collections::VecDeque;

const HISTORY_LEN: usize = 15;
/// If the 3rd-most-recent detection happened within this many seconds, the
/// long hold-off applies.
const RECENT_WINDOW_SECONDS: f64 = 3600.0;

const SHORT_HOLD_OFF_CENTER: f64 = 300.0;
const SHORT_HOLD_OFF_SPREAD: f64 = 60.0;
const LONG_HOLD_OFF_CENTER: f64 = 900.0;
const LONG_HOLD_OFF_SPREAD: f64 = 60.0;

/// The three identity facts compared each loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityFacts {
    pub fqdn: Option<String>,
    pub primary_address: Option<String>,
    pub primary_mac_address: Option<String>,
}

/// `true` if any of the three facts present in both snapshots disagree.
/// A fact missing from either side is not considered a mismatch (the
/// collector may not always supply every fact).
pub fn is_mismatch(cached: &IdentityFacts, observed: &IdentityFacts) -> bool {
    fn disagrees(a: &Option<String>, b: &Option<String>) -> bool {
        matches!((a, b), (Some(a), Some(b)) if a != b)
    }
    disagrees(&cached.fqdn, &observed.fqdn)
        || disagrees(&cached.primary_address, &observed.primary_address)
        || disagrees(&cached.primary_mac_address, &observed.primary_mac_address)
}

/// Tracks the last [`HISTORY_LEN`] detection timestamps and computes the
/// escalating hold-off.
#[derive(Debug, Default)]
pub struct DuplicateDetector {
    history: VecDeque<f64>,
}

impl DuplicateDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a detection at `now_mono` and return the hold-off duration in
    /// seconds to apply.
    pub fn record_detection(&mut self, now_mono: f64, rng: &mut impl rand::Rng) -> f64 {
        self.history.push_back(now_mono);
        if self.history.len() > HISTORY_LEN {
            self.history.pop_front();
        }
        self.hold_off(now_mono, rng)
    }

    /// `900±60s` if the 3rd-most-recent event (this one included) is within
    /// the last hour, else `300±60s`.
    fn hold_off(&self, now_mono: f64, rng: &mut impl rand::Rng) -> f64 {
        let third_most_recent = self.history.iter().rev().nth(2);
        let recent = third_most_recent.is_some_and(|t| now_mono - t <= RECENT_WINDOW_SECONDS);
        if recent {
            jittered(rng, LONG_HOLD_OFF_CENTER, LONG_HOLD_OFF_SPREAD)
        } else {
            jittered(rng, SHORT_HOLD_OFF_CENTER, SHORT_HOLD_OFF_SPREAD)
        }
    }
}

fn jittered(rng: &mut impl rand::Rng, center: f64, spread: f64) -> f64 {
    rng.gen_range((center - spread)..=(center + spread))
}
