//! Durable state store and the versioned `_bleemeo_cache` persistence
//! envelope.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::snapshot::CacheSnapshot;

/// Current envelope version this build writes and fully understands.
pub const CACHE_VERSION: u32 = 7;

/// Legacy flat keys consumed once on upgrade from a pre-`_bleemeo_cache`
/// state file.
pub const LEGACY_KEYS: &[&str] =
    &["metrics_uuid", "services_uuid", "thresholds", "tags_uuid", "docker_container_uuid"];

/// A durable, atomically-written key/value blob. The production
/// implementation ([`JsonFileStateStore`]) is a single JSON file; tests
/// substitute an in-memory implementation.
pub trait StateStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Option<Value>;
    fn set_raw(&mut self, key: &str, value: Value);
    fn delete(&mut self, key: &str);
    /// Flush all pending writes to durable storage atomically.
    fn persist(&mut self) -> io::Result<()>;
}

/// File-backed [`StateStore`]. Writes go to a temporary file in the same
/// directory followed by a rename, so a crash mid-write never leaves a
/// corrupt state file in place.
pub struct JsonFileStateStore {
    path: PathBuf,
    data: HashMap<String, Value>,
}

impl JsonFileStateStore {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err),
        };
        Ok(Self { path, data })
    }
}

impl StateStore for JsonFileStateStore {
    fn get_raw(&self, key: &str) -> Option<Value> {
        self.data.get(key).cloned()
    }

    fn set_raw(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    fn delete(&mut self, key: &str) {
        self.data.remove(key);
    }

    fn persist(&mut self) -> io::Result<()> {
        let serialized = serde_json::to_string(&self.data)?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serialized)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// Load the `_bleemeo_cache` envelope, applying forward migrations in
/// order. Returns `None` (an empty cache) if:
/// - no envelope is present yet (first start — caller falls back to
///   [`load_legacy_compatibility`]), or
/// - the stored `version` exceeds [`CACHE_VERSION`].
pub fn load_envelope(store: &dyn StateStore) -> Option<CacheSnapshot> {
    let mut envelope = store.get_raw("_bleemeo_cache")?;
    let version = envelope.get("version").and_then(Value::as_u64).unwrap_or(0) as u32;

    if version > CACHE_VERSION {
        tracing::warn!(stored_version = version, code_version = CACHE_VERSION, "refusing to load newer cache format");
        return None;
    }

    migrate_v1_to_current(&mut envelope, version);

    let mut snapshot: CacheSnapshot = serde_json::from_value(envelope).unwrap_or_default();
    snapshot.rebuild_indexes();
    Some(snapshot)
}

/// Apply the documented V1→V7 schema migrations in place on the raw JSON
/// envelope before final deserialization.
fn migrate_v1_to_current(envelope: &mut Value, stored_version: u32) {
    let Some(metrics) = envelope.get_mut("metrics").and_then(Value::as_object_mut) else {
        return;
    };

    for metric in metrics.values_mut() {
        let Some(obj) = metric.as_object_mut() else { continue };

        // V3: metrics gained an "active" boolean, defaulting true; will be
        // corrected by the next full sync regardless.
        if stored_version < 3 && !obj.contains_key("active") {
            obj.insert("active".to_string(), json!(true));
        }

        // V4: "active" (bool) became "deactivated_at" (wall time or null).
        if stored_version < 4 {
            if let Some(active) = obj.remove("active") {
                let deactivated_at = if active.as_bool().unwrap_or(true) {
                    Value::Null
                } else {
                    json!(bleemeo_core::wall_time())
                };
                obj.insert("deactivated_at".to_string(), deactivated_at);
            }
        }

        // V7: the "item" string became a general `labels` mapping.
        if stored_version < 7 {
            if let Some(item) = obj.remove("item") {
                let mut labels = serde_json::Map::new();
                if let Some(item) = item.as_str() {
                    if !item.is_empty() {
                        labels.insert("item".to_string(), json!(item));
                    }
                }
                obj.insert("labels".to_string(), Value::Object(labels));
            }
        }
    }

    // Containers cannot be recovered from a V1 envelope; start empty, the
    // next full containers sync repopulates them.
    if stored_version <= 1 {
        envelope["containers"] = json!({});
    }

    if let Some(config) = envelope.get_mut("current_config").and_then(Value::as_object_mut) {
        // V5: AgentConfig dropped its "blacklist" field.
        if stored_version < 5 {
            config.remove("blacklist");
        }
        // V6: AgentConfig gained "metric_resolution", default 10.
        if stored_version < 6 && !config.contains_key("metric_resolution") {
            config.insert("metric_resolution".to_string(), json!(10));
        }
    }

    envelope["version"] = json!(CACHE_VERSION);
}

/// Reconstruct a cache from the pre-`_bleemeo_cache` flat legacy keys,
/// then persist in the current format and delete the legacy keys.
///
/// Account-specific historical data-repair hacks for one-off metric
/// reassignment are intentionally not reproduced here; legacy
/// reconstruction only restores the object shapes, not ad hoc patches.
pub fn load_legacy_compatibility(store: &dyn StateStore) -> CacheSnapshot {
    let mut snapshot = CacheSnapshot::default();

    if let Some(Value::Object(services_uuid)) = store.get_raw("services_uuid") {
        for service_value in services_uuid.values() {
            let Some(uuid) = service_value.get("uuid").and_then(Value::as_str) else { continue };
            let listen_addresses = service_value
                .get("listen_addresses")
                .and_then(Value::as_str)
                .unwrap_or("")
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();

            snapshot.services.insert(
                uuid.to_string(),
                bleemeo_core::Service {
                    uuid: uuid.to_string(),
                    label: service_value.get("label").and_then(Value::as_str).unwrap_or("").to_string(),
                    instance: service_value.get("instance").and_then(Value::as_str).map(str::to_string),
                    listen_addresses,
                    exe_path: service_value.get("exe_path").and_then(Value::as_str).unwrap_or("").to_string(),
                    stack: service_value.get("stack").and_then(Value::as_str).unwrap_or("").to_string(),
                    active: service_value.get("active").and_then(Value::as_bool).unwrap_or(true),
                },
            );
        }
    }

    if let Some(Value::Object(tags_uuid)) = store.get_raw("tags_uuid") {
        snapshot.tags = tags_uuid.keys().cloned().collect();
    }

    snapshot.rebuild_indexes();
    snapshot
}

/// Serialize `snapshot` into the current-version envelope under
/// `_bleemeo_cache`.
pub fn save_envelope(store: &mut dyn StateStore, snapshot: &CacheSnapshot) {
    let value = serde_json::to_value(snapshot).expect("CacheSnapshot always serializes");
    store.set_raw("_bleemeo_cache", value);
}

pub fn delete_legacy_keys(store: &mut dyn StateStore) {
    for key in LEGACY_KEYS {
        store.delete(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    #[derive(Default)]
    struct MemoryStore(Map<String, Value>);

    impl StateStore for MemoryStore {
        fn get_raw(&self, key: &str) -> Option<Value> {
            self.0.get(key).cloned()
        }
        fn set_raw(&mut self, key: &str, value: Value) {
            self.0.insert(key.to_string(), value);
        }
        fn delete(&mut self, key: &str) {
            self.0.remove(key);
        }
        fn persist(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn newer_cache_version_is_refused() {
        let mut store = MemoryStore::default();
        store.set_raw("_bleemeo_cache", json!({"version": CACHE_VERSION + 1, "metrics": {}}));
        assert!(load_envelope(&store).is_none());
    }

    #[test]
    fn v1_envelope_migrates_forward() {
        let mut store = MemoryStore::default();
        store.set_raw(
            "_bleemeo_cache",
            json!({
                "version": 1,
                "tags": [],
                "metrics": {
                    "u1": {
                        "uuid": "u1",
                        "label": "cpu_used",
                        "item": "",
                        "service_uuid": null,
                        "container_uuid": null,
                        "status_of_uuid": null,
                        "thresholds": {"low_warning": null, "low_critical": null, "high_warning": null, "high_critical": null},
                        "unit_code": null,
                        "unit_text": null,
                    }
                },
                "services": {},
                "containers": {"ignored": {}},
                "facts": {},
            }),
        );

        let snapshot = load_envelope(&store).expect("should migrate");
        assert!(snapshot.containers.is_empty(), "V1 containers are dropped, not carried forward");
        let metric = &snapshot.metrics["u1"];
        assert_eq!(metric.deactivated_at, None, "V1 metric with no 'active' flag defaults to active");
        assert!(metric.labels.is_empty());
    }

    #[test]
    fn fresh_v7_round_trip_is_identity() {
        let mut snapshot = CacheSnapshot::default();
        snapshot.tags = vec!["web".to_string()];
        let mut store = MemoryStore::default();
        save_envelope(&mut store, &snapshot);
        let reloaded = load_envelope(&store).expect("v7 cache always loads");
        assert_eq!(reloaded.tags, snapshot.tags);
    }
}
