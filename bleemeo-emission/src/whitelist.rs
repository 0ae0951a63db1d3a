//! Whitelist and Docker-integration gating.

use bleemeo_core::AgentConfig;

use crate::point::MetricPoint;

/// A point belonging to a container is dropped entirely when Docker
/// integration is disabled for the account, independent of the
/// whitelist.
pub fn belongs_to_container(point: &MetricPoint) -> bool {
    point.container_name.is_some()
}

/// Whether `point` should be accepted into the emission path at all:
/// - a container-attached point is always dropped when Docker
///   integration is off, even if explicitly whitelisted.
/// - no `current_config` yet → allow (nothing to gate against).
/// - a service-status metric always bypasses the whitelist.
/// - an empty whitelist allows everything.
/// - otherwise the point's label must be in the whitelist.
pub fn is_allowed(config: Option<&AgentConfig>, point: &MetricPoint) -> bool {
    if let Some(config) = config {
        if belongs_to_container(point) && !config.docker_integration {
            return false;
        }
    }

    if point.is_service_status() {
        return true;
    }

    match config {
        None => true,
        Some(config) if config.metrics_whitelist.is_empty() => true,
        Some(config) => config.metrics_whitelist.contains(&point.label),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config(whitelist: &[&str], docker_integration: bool) -> AgentConfig {
        AgentConfig {
            uuid: "cfg-1".to_string(),
            name: "default".to_string(),
            docker_integration,
            topinfo_period: 10,
            metrics_whitelist: whitelist.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            metric_resolution: 10,
        }
    }

    fn point(label: &str) -> MetricPoint {
        MetricPoint {
            label: label.to_string(),
            labels: Default::default(),
            value: 1.0,
            time: 0.0,
            service_label: None,
            service_instance: None,
            container_name: None,
            status_of: None,
            status_code: None,
            problem_origin: None,
        }
    }

    #[test]
    fn no_config_yet_allows_everything() {
        assert!(is_allowed(None, &point("cpu_used")));
    }

    #[test]
    fn empty_whitelist_allows_everything_not_docker_gated() {
        let cfg = config(&[], true);
        assert!(is_allowed(Some(&cfg), &point("cpu_used")));
    }

    #[test]
    fn populated_whitelist_rejects_unlisted_labels() {
        let cfg = config(&["cpu_used"], true);
        assert!(is_allowed(Some(&cfg), &point("cpu_used")));
        assert!(!is_allowed(Some(&cfg), &point("mem_used")));
    }

    #[test]
    fn service_status_bypasses_whitelist() {
        let cfg = config(&["cpu_used"], true);
        let mut status_point = point("nginx_status");
        status_point.service_label = Some("nginx".to_string());
        assert!(is_allowed(Some(&cfg), &status_point));
    }

    #[test]
    fn container_points_need_docker_integration_regardless_of_whitelist() {
        let cfg = config(&["cpu_used"], false);
        let mut container_point = point("cpu_used");
        container_point.container_name = Some("web-1".to_string());
        assert!(!is_allowed(Some(&cfg), &container_point));

        let cfg = config(&["cpu_used"], true);
        assert!(is_allowed(Some(&cfg), &container_point));
    }
}
