//! The Object Cache component.
//!
//! Readers take a cheap `Arc<CacheSnapshot>` clone via [`ObjectCache::snapshot`]
//! that never changes under them; writers go through [`ObjectCache::mutate`],
//! which hands a private working copy to the closure and only publishes it
//! (with indexes rebuilt) if the closure succeeds. This mirrors the
//! teacher's `Arc<RwLock<HashMap>>` + explicit-lock-scoping discipline,
//! generalized to a whole-snapshot copy-on-write.

use std::sync::{Arc, RwLock};

use crate::persistence::{
    delete_legacy_keys, load_envelope, load_legacy_compatibility, save_envelope, StateStore,
};
use crate::snapshot::CacheSnapshot;

pub struct ObjectCache {
    inner: RwLock<Arc<CacheSnapshot>>,
}

impl ObjectCache {
    /// Load from `store`: prefer the current-version envelope, migrating
    /// forward as needed; fall back to the pre-envelope legacy flat keys on
    /// a genuinely first start.
    pub fn load(store: &mut dyn StateStore) -> Self {
        let snapshot = match load_envelope(store) {
            Some(snapshot) => snapshot,
            None => {
                let snapshot = load_legacy_compatibility(store);
                save_envelope(store, &snapshot);
                delete_legacy_keys(store);
                snapshot
            }
        };
        Self { inner: RwLock::new(Arc::new(snapshot)) }
    }

    /// An empty cache, for first-ever agent registration before any state
    /// file exists.
    pub fn empty() -> Self {
        Self { inner: RwLock::new(Arc::new(CacheSnapshot::default())) }
    }

    /// A cheap, stable-by-convention view of the cache. Holding this past a
    /// subsequent `mutate` call keeps reading the *old* snapshot — readers
    /// that need freshness must re-call `snapshot()`.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.inner.read().expect("cache lock poisoned"))
    }

    /// Apply `f` to a private copy of the current snapshot and publish the
    /// result. `f`'s return value is threaded back to the caller
    /// (registration flows need the freshly-assigned UUID, for instance);
    /// the closure is expected to call [`CacheSnapshot::rebuild_indexes`]
    /// itself when it touches a primary map, since not every mutation
    /// disturbs every index.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut CacheSnapshot) -> T) -> T {
        let mut working = (*self.snapshot()).clone();
        let result = f(&mut working);
        *self.inner.write().expect("cache lock poisoned") = Arc::new(working);
        result
    }

    /// Serialize the current snapshot into `store` and flush it to disk.
    pub fn save(&self, store: &mut dyn StateStore) -> std::io::Result<()> {
        let snapshot = self.snapshot();
        save_envelope(store, &snapshot);
        store.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::JsonFileStateStore;
    use bleemeo_core::Thresholds;

    fn sample_metric(uuid: &str) -> bleemeo_core::Metric {
        bleemeo_core::Metric {
            uuid: uuid.to_string(),
            label: "cpu_used".to_string(),
            labels: Default::default(),
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
    fn mutate_publishes_atomically_and_old_snapshot_is_unaffected() {
        let cache = ObjectCache::empty();
        let before = cache.snapshot();
        assert!(before.metrics.is_empty());

        cache.mutate(|snap| {
            snap.metrics.insert("u1".into(), sample_metric("u1"));
            snap.rebuild_indexes();
        });

        assert!(before.metrics.is_empty(), "previously taken snapshot must not see the mutation");
        assert_eq!(cache.snapshot().metrics.len(), 1);
    }

    #[test]
    fn save_then_load_round_trips_through_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let cache = ObjectCache::empty();
        cache.mutate(|snap| {
            snap.metrics.insert("u1".into(), sample_metric("u1"));
            snap.rebuild_indexes();
        });

        let mut store = JsonFileStateStore::open(&path).unwrap();
        cache.save(&mut store).unwrap();

        let mut reopened = JsonFileStateStore::open(&path).unwrap();
        let reloaded = ObjectCache::load(&mut reopened);
        assert_eq!(reloaded.snapshot().metrics.len(), 1);
    }

    #[test]
    fn first_start_with_no_state_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStateStore::open(dir.path().join("state.json")).unwrap();
        let cache = ObjectCache::load(&mut store);
        assert!(cache.snapshot().metrics.is_empty());
    }
}
