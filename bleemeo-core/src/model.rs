//! The data model shared by the cache, API client and reconciler.
//!
//! All remote identifiers are opaque strings. Cyclic references
//! (metric→service, metric→container, metric→status-of-metric) are stored
//! as UUIDs only and resolved through cache indexes — never as direct
//! references — so a snapshot can be handed out immutably.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::truncate::{truncate, API_METRIC_ITEM_LENGTH, API_SERVICE_INSTANCE_LENGTH};

/// `(label, truncated_item)` — the agent-side identity of a metric. Two
/// metrics in a cache must never share the same identity.
pub type MetricIdentity = (String, String);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub low_warning: Option<f64>,
    pub low_critical: Option<f64>,
    pub high_warning: Option<f64>,
    pub high_critical: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub uuid: String,
    pub label: String,
    pub labels: HashMap<String, String>,
    pub service_uuid: Option<String>,
    pub container_uuid: Option<String>,
    pub status_of_uuid: Option<String>,
    pub thresholds: Thresholds,
    pub unit_code: Option<i64>,
    pub unit_text: Option<String>,
    /// Wall-clock time the metric was deactivated, or `None` if active.
    pub deactivated_at: Option<f64>,
}

impl Metric {
    /// The agent-side identity `(label, truncated_item)`; `truncated_item`
    /// is clipped to 50 characters when the metric carries a `service_uuid`,
    /// 100 characters otherwise.
    pub fn identity(&self) -> MetricIdentity {
        let item = self.labels.get("item").map(String::as_str).unwrap_or("");
        let max = if self.service_uuid.is_some() {
            API_SERVICE_INSTANCE_LENGTH
        } else {
            API_METRIC_ITEM_LENGTH
        };
        (self.label.clone(), truncate(item, max))
    }

    pub fn is_active(&self) -> bool {
        self.deactivated_at.is_none()
    }
}

/// A registration the emission path or a targeted notification wants
/// reconciled; not yet known to have a matching [`Metric`] in cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRegistrationRequest {
    pub label: String,
    pub labels: HashMap<String, String>,
    pub service_label: Option<String>,
    pub instance: Option<String>,
    pub container_name: Option<String>,
    pub status_of_label: Option<String>,
    pub last_status: Option<i32>,
    pub last_problem_origins: Option<String>,
    /// Monotonic seconds at which this identity was last emitted.
    pub last_seen: f64,
}

impl MetricRegistrationRequest {
    /// High-priority labels float to the head of the registration queue so
    /// a misbehaving identity cannot starve the core system metrics.
    pub fn is_high_priority(&self) -> bool {
        is_priority_label(&self.label)
    }
}

/// Hard-coded set of "high priority" metric labels: the core system
/// metrics (CPU, memory, disk, network, swap, agent health) that should
/// register before anything else.
pub fn is_priority_label(label: &str) -> bool {
    const PRIORITY: &[&str] = &[
        "cpu_idle", "cpu_wait", "cpu_nice", "cpu_user", "cpu_system",
        "cpu_interrupt", "cpu_softirq", "cpu_steal",
        "mem_free", "mem_cached", "mem_buffered", "mem_used",
        "io_utilization", "io_read_bytes", "io_write_bytes", "io_reads",
        "io_writes", "net_bits_recv", "net_bits_sent", "net_packets_recv",
        "net_packets_sent", "net_err_in", "net_err_out", "disk_used_perc",
        "swap_used_perc", "cpu_used", "mem_used_perc",
        "agent_status",
    ];
    PRIORITY.contains(&label)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: String,
    pub label: String,
    pub instance: Option<String>,
    pub listen_addresses: HashSet<String>,
    pub exe_path: String,
    pub stack: String,
    pub active: bool,
}

impl Service {
    /// `(label, truncated_instance)`, instance clipped to 50 characters.
    pub fn identity(&self) -> (String, String) {
        let instance = self.instance.as_deref().unwrap_or("");
        (self.label.clone(), truncate(instance, API_SERVICE_INSTANCE_LENGTH))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub uuid: String,
    pub name: String,
    pub docker_id: String,
    pub inspect_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFact {
    pub uuid: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub uuid: String,
    pub name: String,
    pub docker_integration: bool,
    pub topinfo_period: i64,
    pub metrics_whitelist: HashSet<String>,
    pub metric_resolution: i64,
}
