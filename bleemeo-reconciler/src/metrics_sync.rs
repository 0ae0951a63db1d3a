//! Metric synchronization — escalation heuristics, registration ordering
//! constraints, reactivation, label backfill, inactivation and final
//! pruning.

use bleemeo_cache::CacheSnapshot;
use bleemeo_core::{Metric, MetricRegistrationRequest};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// `|update_metrics| > 3% * active_metric_count` escalates to a full
/// active-only listing.
pub fn escalate_to_full(update_metrics_count: usize, active_metric_count: usize) -> bool {
    (update_metrics_count as f64) > 0.03 * (active_metric_count as f64)
}

/// `|pending_registrations| > 3% * |cache.metrics|` also refreshes inactive
/// metrics.
pub fn escalate_to_full_with_inactive(pending_registrations_count: usize, cache_metrics_count: usize) -> bool {
    (pending_registrations_count as f64) > 0.03 * (cache_metrics_count as f64)
}

/// Metrics excluded from the 70-minute inactivation sweep.
pub fn is_inactivation_exempt(label: &str) -> bool {
    matches!(label, "agent_status" | "agent_sent_message")
}

const INACTIVATION_THRESHOLD_SECONDS: f64 = 70.0 * 60.0;
const REACTIVATION_WINDOW_SECONDS: f64 = 600.0;
const REACTIVATION_GRACE_SECONDS: f64 = 60.0;
/// Deactivated metrics older than this are evicted from the cache entirely.
pub const DEACTIVATED_RETENTION_SECONDS: f64 = 200.0 * 24.0 * 3600.0;

/// A metric not seen in the last 70 minutes (and not exempt) should be
/// PATCHed `active=false`. `last_seen_mono`
/// comes from the matching `MetricRegistrationRequest`, or `None` if the
/// identity was never observed this process lifetime (and so cannot be
/// timed out by this rule — it simply never got registered).
pub fn should_inactivate(label: &str, last_seen_mono: Option<f64>, now_mono: f64, agent_uptime_seconds: f64) -> bool {
    if agent_uptime_seconds < INACTIVATION_THRESHOLD_SECONDS || is_inactivation_exempt(label) {
        return false;
    }
    match last_seen_mono {
        Some(last_seen) => now_mono - last_seen >= INACTIVATION_THRESHOLD_SECONDS,
        None => true,
    }
}

/// A deactivated metric is reactivated when the last sample is newer than
/// `deactivated_at + 60s` and it was seen within the last 600s.
pub fn should_reactivate(deactivated_at: f64, last_sample_wall: f64, last_seen_mono: f64, now_mono: f64) -> bool {
    last_sample_wall > deactivated_at + REACTIVATION_GRACE_SECONDS
        && now_mono - last_seen_mono <= REACTIVATION_WINDOW_SECONDS
}

/// A deactivated metric older than 200 days is evicted from the cache.
pub fn should_evict(deactivated_at: f64, now_wall: f64) -> bool {
    now_wall - deactivated_at > DEACTIVATED_RETENTION_SECONDS
}

/// Gates label backfill PATCHes: probed once per full-sync window, flipped
/// off the first time a PATCH response lacks a `labels` key.
#[derive(Debug, Default)]
pub struct LabelSupportProbe(AtomicBool);

impl LabelSupportProbe {
    pub fn new() -> Self {
        Self(AtomicBool::new(true))
    }

    pub fn is_supported(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Call after every agent-labels PATCH response; `response_had_labels`
    /// is whether the JSON body included a `labels` key.
    pub fn observe(&self, response_had_labels: bool) {
        if !response_had_labels {
            self.0.store(false, Ordering::SeqCst);
        }
    }

    /// A full sync re-probes support from scratch.
    pub fn reset_for_full_sync(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Whether `local` carries labels the `remote` metric object doesn't have
/// yet — the label-backfill trigger condition.
pub fn needs_label_backfill(remote: &Metric, local_labels: &std::collections::HashMap<String, String>) -> bool {
    local_labels.keys().any(|k| !remote.labels.contains_key(k))
}

/// Whether a pending registration's dependencies (status-of metric,
/// container, service) are already present in the cache.
pub fn is_registration_ready(request: &MetricRegistrationRequest, snapshot: &CacheSnapshot) -> bool {
    if let Some(status_of) = &request.status_of_label {
        let item = request.labels.get("item").cloned().unwrap_or_default();
        if !snapshot.metrics_by_labelitem.contains_key(&(status_of.clone(), item)) {
            return false;
        }
    }
    if let Some(container_name) = &request.container_name {
        if !snapshot.containers_by_name.contains_key(container_name) {
            return false;
        }
    }
    if let Some(service_label) = &request.service_label {
        let instance = request.instance.clone().unwrap_or_default();
        if !snapshot.services_by_labelinstance.contains_key(&(service_label.clone(), instance)) {
            return false;
        }
    }
    true
}

/// Resolve ordering constraints: each request not yet ready is
/// requeued to the tail at most once per call; a request still not ready
/// after its one requeue is left in `still_deferred` for the next loop.
pub fn resolve_registration_order(
    requests: Vec<MetricRegistrationRequest>,
    snapshot: &CacheSnapshot,
) -> (Vec<MetricRegistrationRequest>, Vec<MetricRegistrationRequest>) {
    let total = requests.len();
    let mut queue: VecDeque<MetricRegistrationRequest> = requests.into_iter().collect();
    let mut ready = Vec::new();
    let mut deferred = Vec::new();
    let mut requeues_spent = 0usize;

    while let Some(item) = queue.pop_front() {
        if is_registration_ready(&item, snapshot) {
            ready.push(item);
            continue;
        }
        if requeues_spent < total {
            requeues_spent += 1;
            queue.push_back(item);
        } else {
            deferred.push(item);
        }
    }

    (ready, deferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bleemeo_core::{Container, Service, Thresholds};
    use std::collections::HashMap;

    fn request(label: &str) -> MetricRegistrationRequest {
        MetricRegistrationRequest {
            label: label.to_string(),
            labels: HashMap::new(),
            service_label: None,
            instance: None,
            container_name: None,
            status_of_label: None,
            last_status: None,
            last_problem_origins: None,
            last_seen: 0.0,
        }
    }

    #[test]
    fn escalation_heuristics_use_the_3_percent_threshold() {
        assert!(!escalate_to_full(3, 1000));
        assert!(escalate_to_full(31, 1000));
        assert!(!escalate_to_full_with_inactive(3, 1000));
        assert!(escalate_to_full_with_inactive(31, 1000));
    }

    #[test]
    fn inactivation_requires_70_minutes_of_uptime_and_excludes_core_metrics() {
        assert!(!should_inactivate("cpu_used", Some(0.0), 5000.0, 100.0));
        assert!(!should_inactivate("agent_status", Some(0.0), 5000.0, 10_000.0));
        assert!(should_inactivate("cpu_used", Some(0.0), 5000.0, 10_000.0));
        assert!(!should_inactivate("cpu_used", Some(4900.0), 5000.0, 10_000.0));
    }

    #[test]
    fn reactivation_needs_fresh_sample_and_recent_sight() {
        assert!(should_reactivate(1000.0, 1070.0, 500.0, 600.0));
        assert!(!should_reactivate(1000.0, 1050.0, 500.0, 600.0), "sample not past the 60s grace");
        assert!(!should_reactivate(1000.0, 1070.0, 0.0, 700.0), "not seen recently enough");
    }

    #[test]
    fn eviction_after_200_days() {
        let now = 200.0 * 24.0 * 3600.0 + 1.0;
        assert!(should_evict(0.0, now));
        assert!(!should_evict(now - 10.0, now));
    }

    #[test]
    fn label_support_probe_flips_off_on_missing_key_and_resets() {
        let probe = LabelSupportProbe::new();
        assert!(probe.is_supported());
        probe.observe(false);
        assert!(!probe.is_supported());
        probe.reset_for_full_sync();
        assert!(probe.is_supported());
    }

    #[test]
    fn label_backfill_detects_new_local_labels() {
        let remote = Metric {
            uuid: "u1".into(),
            label: "cpu_used".into(),
            labels: HashMap::new(),
            service_uuid: None,
            container_uuid: None,
            status_of_uuid: None,
            thresholds: Thresholds::default(),
            unit_code: None,
            unit_text: None,
            deactivated_at: None,
        };
        let mut local = HashMap::new();
        local.insert("core".to_string(), "0".to_string());
        assert!(needs_label_backfill(&remote, &local));
        assert!(!needs_label_backfill(&remote, &HashMap::new()));
    }

    #[test]
    fn registration_ready_when_no_dependency_declared() {
        let snapshot = CacheSnapshot::default();
        assert!(is_registration_ready(&request("cpu_used"), &snapshot));
    }

    #[test]
    fn registration_waits_for_its_container() {
        let mut snapshot = CacheSnapshot::default();
        let mut req = request("disk_used");
        req.container_name = Some("web".to_string());
        assert!(!is_registration_ready(&req, &snapshot));

        snapshot.containers.insert(
            "c1".into(),
            Container { uuid: "c1".into(), name: "web".into(), docker_id: "d1".into(), inspect_hash: "h".into() },
        );
        snapshot.rebuild_indexes();
        assert!(is_registration_ready(&req, &snapshot));
    }

    #[test]
    fn registration_waits_for_its_service() {
        let mut snapshot = CacheSnapshot::default();
        let mut req = request("nginx_status");
        req.service_label = Some("nginx".to_string());
        assert!(!is_registration_ready(&req, &snapshot));

        snapshot.services.insert(
            "s1".into(),
            Service {
                uuid: "s1".into(),
                label: "nginx".into(),
                instance: None,
                listen_addresses: Default::default(),
                exe_path: String::new(),
                stack: String::new(),
                active: true,
            },
        );
        snapshot.rebuild_indexes();
        assert!(is_registration_ready(&req, &snapshot));
    }

    #[test]
    fn unready_requests_are_requeued_exactly_once_then_deferred() {
        let snapshot = CacheSnapshot::default();
        let mut never_ready = request("waiting");
        never_ready.container_name = Some("ghost".to_string());
        let requests = vec![request("cpu_used"), never_ready.clone(), never_ready];

        let (ready, deferred) = resolve_registration_order(requests, &snapshot);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].label, "cpu_used");
        assert_eq!(deferred.len(), 2);
    }

    #[test]
    fn dependency_satisfied_partway_through_lets_request_through() {
        let mut snapshot = CacheSnapshot::default();
        snapshot.services.insert(
            "s1".into(),
            Service {
                uuid: "s1".into(),
                label: "nginx".into(),
                instance: None,
                listen_addresses: Default::default(),
                exe_path: String::new(),
                stack: String::new(),
                active: true,
            },
        );
        snapshot.rebuild_indexes();

        let mut dependent = request("nginx_status");
        dependent.service_label = Some("nginx".to_string());
        let (ready, deferred) = resolve_registration_order(vec![dependent], &snapshot);
        assert_eq!(ready.len(), 1);
        assert!(deferred.is_empty());
    }
}
