//! Identity truncation rules.
//!
//! Metric items are clipped to 100 characters (50 when the metric is
//! attached to a service); service instances are clipped to 50 characters;
//! container names to 100. Truncation is required to be idempotent:
//! `truncate(truncate(x, n), n) == truncate(x, n)`.

/// Metric item length when the metric carries no service attachment.
pub const API_METRIC_ITEM_LENGTH: usize = 100;
/// Metric item / service instance length when a service is attached.
pub const API_SERVICE_INSTANCE_LENGTH: usize = 50;
/// Container name length.
pub const API_CONTAINER_NAME_LENGTH: usize = 100;

/// Truncate `s` to at most `max_chars` **characters** (not bytes), always
/// cutting on a char boundary.
pub fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
