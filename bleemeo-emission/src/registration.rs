//! Pending-registration tracking.

use std::collections::HashMap;
use std::sync::Mutex;

use bleemeo_core::model::MetricIdentity;
use bleemeo_core::MetricRegistrationRequest;

use crate::point::MetricPoint;

/// The emission path's view of "identities locally emitted but not yet
/// confirmed in cache". Shared
/// between the emission path (which records sightings) and the
/// reconciler (which drains it for registration each loop).
#[derive(Default)]
pub struct RegistrationTracker {
    requests: Mutex<HashMap<MetricIdentity, MetricRegistrationRequest>>,
}

impl RegistrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or refresh a sighting of `point` at `now_mono`. Returns
    /// `true` if this is a brand new identity (the caller should signal
    /// the reconciler's wake event).
    pub fn observe(&self, point: &MetricPoint, now_mono: f64) -> bool {
        let identity = (point.label.clone(), point.item().to_string());
        let mut guard = self.requests.lock().expect("registration tracker lock poisoned");
        let is_new = !guard.contains_key(&identity);
        guard
            .entry(identity)
            .and_modify(|req| req.last_seen = now_mono)
            .or_insert_with(|| MetricRegistrationRequest {
                label: point.label.clone(),
                labels: point.labels.clone(),
                service_label: point.service_label.clone(),
                instance: point.service_instance.clone(),
                container_name: point.container_name.clone(),
                status_of_label: point.status_of.clone(),
                last_status: point.status_code,
                last_problem_origins: point.problem_origin.clone(),
                last_seen: now_mono,
            });
        is_new
    }

    /// A snapshot of all pending registrations, for the reconciler's
    /// metrics-sync phase.
    pub fn snapshot(&self) -> Vec<MetricRegistrationRequest> {
        self.requests.lock().expect("registration tracker lock poisoned").values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().expect("registration tracker lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop `identity` once it has a matching cache entry.
    pub fn remove(&self, identity: &MetricIdentity) {
        self.requests.lock().expect("registration tracker lock poisoned").remove(identity);
    }

    /// Evict entries not seen in the last 70 minutes.
    pub fn prune_stale(&self, now_mono: f64, max_age_seconds: f64) {
        self.requests
            .lock()
            .expect("registration tracker lock poisoned")
            .retain(|_, req| now_mono - req.last_seen < max_age_seconds);
    }
}
