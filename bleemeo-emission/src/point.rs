//! The value type flowing through the emission path.

use std::collections::HashMap;

/// One observed metric value plus enough identifying context for the
/// reconciler to register it if it hasn't been seen before.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub label: String,
    pub labels: HashMap<String, String>,
    pub value: f64,
    /// Wall-clock time of observation, as sent over the wire.
    pub time: f64,
    pub service_label: Option<String>,
    pub service_instance: Option<String>,
    pub container_name: Option<String>,
    pub status_of: Option<String>,
    pub status_code: Option<i32>,
    pub problem_origin: Option<String>,
}

impl MetricPoint {
    pub fn item(&self) -> &str {
        self.labels.get("item").map(String::as_str).unwrap_or("")
    }

    /// A service-status metric (`label == "{service_label}_status"`)
    /// bypasses the whitelist unconditionally.
    pub fn is_service_status(&self) -> bool {
        match &self.service_label {
            Some(service_label) => self.label == format!("{service_label}_status"),
            None => false,
        }
    }
}
