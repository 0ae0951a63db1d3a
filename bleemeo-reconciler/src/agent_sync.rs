//! Agent record sync.

use std::sync::atomic::{AtomicBool, Ordering};

use bleemeo_core::datetime::api_datetime_to_time;
use bleemeo_core::{AgentConfig, ConnectorError, Result};
use serde_json::Value;
use std::collections::HashSet;

/// Max tag length accepted by the server.
const MAX_TAG_LENGTH: usize = 100;

/// Filters out empty tags and ones exceeding 100 characters before they're
/// sent in the PATCH body.
pub fn valid_tags(tags: &[String]) -> Vec<String> {
    tags.iter().filter(|t| !t.is_empty() && t.chars().count() <= MAX_TAG_LENGTH).cloned().collect()
}

/// Parsed result of `PATCH v1/agent/{uuid}/`.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSyncResult {
    pub created_at: Option<f64>,
    pub account: String,
    /// Tags returned by the server, already filtered to `is_automatic=false`
    /// server-side.
    pub tags: Vec<String>,
    pub next_config_at: Option<f64>,
    /// `Some(uuid)` when the agent record carries a `current_config`.
    pub current_config_uuid: Option<String>,
}

pub fn parse_agent_patch_response(value: &Value) -> Result<AgentSyncResult> {
    let account = value
        .get("account")
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectorError::Invariant("agent PATCH response missing 'account'".to_string()))?
        .to_string();

    let tags = value
        .get("tags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let current_config_uuid = value
        .get("current_config")
        .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.get("id").and_then(Value::as_str).map(str::to_string)));

    Ok(AgentSyncResult {
        created_at: value.get("created_at").and_then(Value::as_str).and_then(|s| api_datetime_to_time(Some(s))),
        account,
        tags,
        next_config_at: value.get("next_config_at").and_then(Value::as_str).and_then(|s| api_datetime_to_time(Some(s))),
        current_config_uuid,
    })
}

/// Tracks whether the one-shot account-mismatch warning has already fired
/// this process lifetime.
#[derive(Debug, Default)]
pub struct AccountMismatchWarned(AtomicBool);

impl AccountMismatchWarned {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a mismatch is observed (caller should
    /// log); subsequent calls return `false` even if the mismatch persists.
    pub fn observe(&self, configured: &str, server: &str) -> bool {
        if configured == server {
            return false;
        }
        !self.0.swap(true, Ordering::SeqCst)
    }
}

/// Parse `GET /v1/config/{id}/`, falling back to legacy field names
/// (`metrics_whitelist`, `topinfo_period`) when the newer ones are absent.
pub fn parse_account_config(uuid: String, value: &Value) -> Result<AgentConfig> {
    let name = value.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
    let docker_integration = value.get("docker_integration").and_then(Value::as_bool).unwrap_or(false);

    let whitelist_raw = value
        .get("metrics_agent_whitelist")
        .or_else(|| value.get("metrics_whitelist"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let metrics_whitelist: HashSet<String> =
        whitelist_raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();

    let topinfo_period = value
        .get("live_process_resolution")
        .or_else(|| value.get("topinfo_period"))
        .and_then(Value::as_i64)
        .unwrap_or(10);

    let metric_resolution = value
        .get("metrics_agent_resolution")
        .map(|v| match v {
            Value::Number(n) => n.as_i64().unwrap_or(10),
            Value::String(s) => s.parse::<i64>().unwrap_or(10),
            _ => 10,
        })
        .unwrap_or(10);

    Ok(AgentConfig { uuid, name, docker_integration, topinfo_period, metrics_whitelist, metric_resolution })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tags_filters_empty_and_overlong() {
        let tags = vec!["ok".to_string(), "".to_string(), "x".repeat(101)];
        assert_eq!(valid_tags(&tags), vec!["ok".to_string()]);
    }

    #[test]
    fn parses_a_full_patch_response() {
        let value = json!({
            "created_at": "2020-01-01T00:00:00Z",
            "account": "acct-1",
            "tags": [{"name": "prod"}, {"name": "web"}],
            "next_config_at": "2020-01-02T00:00:00Z",
            "current_config": "cfg-1",
        });
        let result = parse_agent_patch_response(&value).unwrap();
        assert_eq!(result.account, "acct-1");
        assert_eq!(result.tags, vec!["prod".to_string(), "web".to_string()]);
        assert_eq!(result.current_config_uuid.as_deref(), Some("cfg-1"));
    }

    #[test]
    fn missing_account_is_an_invariant_error() {
        let value = json!({});
        assert!(parse_agent_patch_response(&value).is_err());
    }

    #[test]
    fn mismatch_warning_fires_once() {
        let warned = AccountMismatchWarned::new();
        assert!(warned.observe("acct-1", "acct-2"));
        assert!(!warned.observe("acct-1", "acct-2"));
    }

    #[test]
    fn matching_accounts_never_warn() {
        let warned = AccountMismatchWarned::new();
        assert!(!warned.observe("acct-1", "acct-1"));
    }

    #[test]
    fn account_config_falls_back_to_legacy_whitelist_key() {
        let value = json!({
            "name": "default",
            "docker_integration": true,
            "metrics_whitelist": "cpu_used, disk_used_perc",
            "topinfo_period": 10,
        });
        let config = parse_account_config("cfg-1".to_string(), &value).unwrap();
        assert_eq!(config.metrics_whitelist, HashSet::from(["cpu_used".to_string(), "disk_used_perc".to_string()]));
        assert_eq!(config.topinfo_period, 10);
    }

    #[test]
    fn metrics_agent_resolution_parses_from_string_and_defaults() {
        let value = json!({"metrics_agent_resolution": "20"});
        let config = parse_account_config("cfg-1".to_string(), &value).unwrap();
        assert_eq!(config.metric_resolution, 20);

        let value = json!({"metrics_agent_resolution": "not-a-number"});
        let config = parse_account_config("cfg-1".to_string(), &value).unwrap();
        assert_eq!(config.metric_resolution, 10);

        let value = json!({});
        let config = parse_account_config("cfg-1".to_string(), &value).unwrap();
        assert_eq!(config.metric_resolution, 10);
    }
}
