//! Canonicalization of Docker `inspect` documents for change detection.
//!
//! Mount order is not stable across `docker inspect` calls (observed on
//! minikube) even when nothing changed, so mounts are sorted by
//! `(Source, Destination)` before hashing.

use serde_json::Value;
use sha1::{Digest, Sha1};

/// Sort the `Mounts` array of a docker inspect document by
/// `(Source, Destination)` so repeated inspects of an unchanged container
/// hash identically.
pub fn sort_docker_inspect(mut inspect: Value) -> Value {
    if let Some(mounts) = inspect.get_mut("Mounts").and_then(Value::as_array_mut) {
        mounts.sort_by(|a, b| mount_key(a).cmp(&mount_key(b)));
    }
    inspect
}

fn mount_key(mount: &Value) -> (String, String) {
    let source = mount.get("Source").and_then(Value::as_str).unwrap_or("").to_string();
    let destination = mount.get("Destination").and_then(Value::as_str).unwrap_or("").to_string();
    (source, destination)
}

/// SHA-1 over the canonicalized inspect document with keys serialized in
/// sorted order at every nesting level, so the hash is independent of
/// field order.
pub fn inspect_hash(inspect: &Value) -> String {
    let sorted = sort_docker_inspect(inspect.clone());
    let canonical = canonical_json(&sorted);
    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize with object keys in sorted order at every nesting level, so
/// two semantically identical documents hash identically regardless of
/// field order.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        Value::Array(items) => {
            let entries: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", entries.join(","))
        }
        other => serde_json::to_string(other).unwrap(),
    }
}

/// `0001-01-01T00:00:00Z` is Docker's sentinel for "unknown"/unset.
pub fn convert_docker_date(input: Option<&str>) -> Option<String> {
    match input {
        None => None,
        Some("0001-01-01T00:00:00Z") => None,
        Some(other) => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_start_date_maps_to_none() {
        assert_eq!(convert_docker_date(Some("0001-01-01T00:00:00Z")), None);
        assert_eq!(convert_docker_date(Some("2020-01-01T00:00:00Z")).as_deref(), Some("2020-01-01T00:00:00Z"));
        assert_eq!(convert_docker_date(None), None);
    }

    #[test]
    fn hash_is_stable_across_mount_order() {
        let a = json!({
            "Name": "/web",
            "Mounts": [
                {"Source": "/data", "Destination": "/var/data"},
                {"Source": "/cfg", "Destination": "/etc/app"},
            ],
        });
        let b = json!({
            "Name": "/web",
            "Mounts": [
                {"Source": "/cfg", "Destination": "/etc/app"},
                {"Source": "/data", "Destination": "/var/data"},
            ],
        });
        assert_eq!(inspect_hash(&a), inspect_hash(&b));
    }

    #[test]
    fn hash_changes_when_content_changes() {
        let a = json!({"Name": "/web", "Image": "sha256:aaa"});
        let b = json!({"Name": "/web", "Image": "sha256:bbb"});
        assert_ne!(inspect_hash(&a), inspect_hash(&b));
    }
}
