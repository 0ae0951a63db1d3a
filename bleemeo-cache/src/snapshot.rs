//! The value type published by the Object Cache to its readers.

use bleemeo_core::model::MetricIdentity;
use bleemeo_core::{AgentConfig, AgentFact, Container, Metric, Service};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Immutable-by-convention view of every cached remote object plus its
/// secondary lookup indexes.
///
/// Consumers hold an `Arc<CacheSnapshot>` cloned out of [`crate::ObjectCache::snapshot`];
/// mutation always happens on a private working copy that replaces the
/// published snapshot atomically (`mutate`), never in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub metrics: HashMap<String, Metric>,
    pub services: HashMap<String, Service>,
    pub containers: HashMap<String, Container>,
    pub facts: HashMap<String, AgentFact>,
    pub tags: Vec<String>,
    pub current_config: Option<AgentConfig>,
    pub next_config_at: Option<f64>,
    pub registration_at: Option<f64>,
    pub account_id: Option<String>,

    #[serde(skip)]
    pub metrics_by_labelitem: HashMap<MetricIdentity, Metric>,
    #[serde(skip)]
    pub containers_by_name: HashMap<String, Container>,
    #[serde(skip)]
    pub services_by_labelinstance: HashMap<(String, String), Service>,
    #[serde(skip)]
    pub facts_by_key: HashMap<String, AgentFact>,
}

impl CacheSnapshot {
    /// Rebuild all four secondary indexes from the primary maps. Must be
    /// called after every structural mutation.
    pub fn rebuild_indexes(&mut self) {
        self.metrics_by_labelitem = self
            .metrics
            .values()
            .map(|metric| (metric.identity(), metric.clone()))
            .collect();

        self.containers_by_name =
            self.containers.values().map(|c| (c.name.clone(), c.clone())).collect();

        self.services_by_labelinstance =
            self.services.values().map(|s| (s.identity(), s.clone())).collect();

        self.facts_by_key = self.facts.values().map(|f| (f.key.clone(), f.clone())).collect();
    }

    /// Thresholds keyed by `(label, item)`, the shape the reconciler hands
    /// to the (out-of-scope) threshold evaluator.
    pub fn core_thresholds(&self) -> HashMap<(String, String), bleemeo_core::Thresholds> {
        self.metrics
            .values()
            .map(|m| {
                let item = m.labels.get("item").cloned().unwrap_or_default();
                ((m.label.clone(), item), m.thresholds.clone())
            })
            .collect()
    }

    /// Units keyed by `(label, item)`.
    pub fn core_units(&self) -> HashMap<(String, String), (Option<i64>, Option<String>)> {
        self.metrics
            .values()
            .map(|m| {
                let item = m.labels.get("item").cloned().unwrap_or_default();
                ((m.label.clone(), item), (m.unit_code, m.unit_text.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bleemeo_core::Thresholds;
    use std::collections::HashMap as Map;

    fn metric(uuid: &str, label: &str, item: &str) -> Metric {
        let mut labels = Map::new();
        if !item.is_empty() {
            labels.insert("item".to_string(), item.to_string());
        }
        Metric {
            uuid: uuid.to_string(),
            label: label.to_string(),
            labels,
            service_uuid: None,
            container_uuid: None,
            status_of_uuid: None,
            thresholds: Thresholds::default(),
            unit_code: None,
            unit_text: None,
            deactivated_at: None,
        }
    }

    #[test]
    fn every_metric_round_trips_through_its_index() {
        let mut snapshot = CacheSnapshot::default();
        snapshot.metrics.insert("u1".into(), metric("u1", "cpu_used", ""));
        snapshot.metrics.insert("u2".into(), metric("u2", "disk_used", "/var"));
        snapshot.rebuild_indexes();

        for metric in snapshot.metrics.values() {
            let looked_up = snapshot.metrics_by_labelitem.get(&metric.identity());
            assert_eq!(looked_up, Some(metric));
        }
    }

    #[test]
    fn rebuild_drops_stale_index_entries() {
        let mut snapshot = CacheSnapshot::default();
        snapshot.metrics.insert("u1".into(), metric("u1", "cpu_used", ""));
        snapshot.rebuild_indexes();
        assert_eq!(snapshot.metrics_by_labelitem.len(), 1);

        snapshot.metrics.remove("u1");
        snapshot.rebuild_indexes();
        assert!(snapshot.metrics_by_labelitem.is_empty());
    }
}
