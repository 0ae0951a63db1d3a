//! The deferred queue: points whose `(label, item)` identity has not yet
//! been registered with the remote side.

use std::collections::VecDeque;
use std::sync::Mutex;

use bleemeo_core::model::MetricIdentity;

use crate::point::MetricPoint;

/// Hard cap on the deferred queue; crossing it triggers compaction down
/// to [`COMPACT_TARGET`] entries.
pub const MAX_DEFERRED: usize = 100_000;
pub const COMPACT_TARGET: usize = 90_000;

/// A point is dropped outright, rather than deferred, once it is older
/// than this.
pub const MAX_AGE_SECONDS: f64 = 7_200.0;

struct Entry {
    identity: MetricIdentity,
    point: MetricPoint,
}

/// FIFO-ordered buffer of points awaiting their identity's registration.
/// Insertion order is preserved, which doubles as time order since points
/// are pushed as they are observed.
#[derive(Default)]
pub struct DeferredQueue {
    entries: Mutex<VecDeque<Entry>>,
}

pub enum PushOutcome {
    Deferred,
    DroppedTooOld,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `point` unless it is already older than [`MAX_AGE_SECONDS`]
    /// relative to `wall_now`.
    pub fn push(&self, point: MetricPoint, wall_now: f64) -> PushOutcome {
        if wall_now - point.time > MAX_AGE_SECONDS {
            return PushOutcome::DroppedTooOld;
        }

        let identity = (point.label.clone(), point.item().to_string());
        let mut guard = self.entries.lock().expect("deferred queue lock poisoned");
        guard.push_back(Entry { identity, point });
        if guard.len() > MAX_DEFERRED {
            Self::compact(&mut guard);
        }
        PushOutcome::Deferred
    }

    fn compact(entries: &mut VecDeque<Entry>) {
        let drop_count = entries.len() - COMPACT_TARGET;
        tracing::warn!(dropped = drop_count, "deferred queue over capacity, compacting to most recent entries");
        entries.drain(..drop_count);
    }

    /// Remove and return every buffered point whose identity is now
    /// registered (present in `registered`), preserving arrival order
    /// among the survivors left behind.
    pub fn drain_registered(&self, registered: &dyn Fn(&MetricIdentity) -> bool) -> Vec<MetricPoint> {
        let mut guard = self.entries.lock().expect("deferred queue lock poisoned");
        let mut ready = Vec::new();
        let mut remaining = VecDeque::with_capacity(guard.len());
        for entry in guard.drain(..) {
            if registered(&entry.identity) {
                ready.push(entry.point);
            } else {
                remaining.push_back(entry);
            }
        }
        *guard = remaining;
        ready
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("deferred queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(label: &str, time: f64) -> MetricPoint {
        MetricPoint {
            label: label.to_string(),
            labels: Default::default(),
            value: 1.0,
            time,
            service_label: None,
            service_instance: None,
            container_name: None,
            status_of: None,
            status_code: None,
            problem_origin: None,
        }
    }

    #[test]
    fn stale_points_are_dropped_not_deferred() {
        let queue = DeferredQueue::new();
        let outcome = queue.push(point("cpu_used", 0.0), 7_201.0);
        assert!(matches!(outcome, PushOutcome::DroppedTooOld));
        assert!(queue.is_empty());
    }

    #[test]
    fn fresh_points_are_deferred() {
        let queue = DeferredQueue::new();
        let outcome = queue.push(point("cpu_used", 0.0), 7_199.0);
        assert!(matches!(outcome, PushOutcome::Deferred));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn overflow_compacts_to_the_most_recent_entries() {
        let queue = DeferredQueue::new();
        for i in 0..(MAX_DEFERRED + 1) {
            queue.push(point(&format!("m{i}"), 0.0), 0.0);
        }
        assert_eq!(queue.len(), COMPACT_TARGET);
        // The oldest entries are the ones dropped; the most recent push
        // must have survived.
        let ready = queue.drain_registered(&|_| true);
        assert_eq!(ready.last().unwrap().label, format!("m{MAX_DEFERRED}"));
    }

    #[test]
    fn drain_registered_only_removes_matching_identities() {
        let queue = DeferredQueue::new();
        queue.push(point("cpu_used", 0.0), 0.0);
        queue.push(point("mem_used", 0.0), 0.0);
        let ready = queue.drain_registered(&|id| id.0 == "cpu_used");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].label, "cpu_used");
        assert_eq!(queue.len(), 1);
    }
}
