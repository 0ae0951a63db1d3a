//! `emit(point)`: the entry point collectors call. Wires together whitelist gating, the pending-
//! registration tracker, the deferred queue and the outbound batch
//! buffer, and signals the reconciler when a brand-new identity appears.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use bleemeo_cache::ObjectCache;
use bleemeo_core::truncate::{truncate, API_METRIC_ITEM_LENGTH, API_SERVICE_INSTANCE_LENGTH};
use bleemeo_core::model::MetricIdentity;

use crate::batch::BatchBuffer;
use crate::deferred::{DeferredQueue, PushOutcome};
use crate::point::MetricPoint;
use crate::registration::RegistrationTracker;
use crate::render::{render, ServiceKillSignal};
use crate::whitelist::is_allowed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Sent straight to the outbound batch buffer: the identity is
    /// already registered.
    Enqueued,
    /// Buffered in the deferred queue pending registration.
    Deferred,
    /// Dropped: hold-off, whitelist/Docker gate, or too stale to defer.
    Dropped,
}

pub struct Emitter {
    cache: Arc<ObjectCache>,
    registrations: RegistrationTracker,
    deferred: DeferredQueue,
    batch: BatchBuffer,
    /// Set while the broker session is held off by duplicate-agent
    /// detection.
    hold_off: AtomicBool,
    /// Notified whenever a brand-new registration identity appears, so
    /// the reconciler's loop wakes up instead of waiting for its
    /// timeout.
    pub reconciler_wake: Notify,
}

impl Emitter {
    pub fn new(cache: Arc<ObjectCache>) -> Self {
        Self {
            cache,
            registrations: RegistrationTracker::new(),
            deferred: DeferredQueue::new(),
            batch: BatchBuffer::new(),
            hold_off: AtomicBool::new(false),
            reconciler_wake: Notify::new(),
        }
    }

    pub fn set_hold_off(&self, held: bool) {
        self.hold_off.store(held, Ordering::SeqCst);
    }

    pub fn registrations(&self) -> &RegistrationTracker {
        &self.registrations
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub fn batch(&self) -> &BatchBuffer {
        &self.batch
    }

    /// `emit(point)`. `now_mono` paces the
    /// registration tracker and reactivation windows; `wall_now` is
    /// compared against the point's own wall-clock `time` for the
    /// deferred-queue staleness check.
    pub fn emit(
        &self,
        point: MetricPoint,
        now_mono: f64,
        wall_now: f64,
        kill_signal: Option<ServiceKillSignal>,
    ) -> EmitOutcome {
        if self.hold_off.load(Ordering::SeqCst) {
            return EmitOutcome::Dropped;
        }

        let snapshot = self.cache.snapshot();
        if !is_allowed(snapshot.current_config.as_ref(), &point) {
            return EmitOutcome::Dropped;
        }

        if self.registrations.observe(&point, now_mono) {
            self.reconciler_wake.notify_one();
        }

        let identity = self.identity_of(&point);
        match snapshot.metrics_by_labelitem.get(&identity) {
            Some(metric) => {
                let rendered = render(metric, &point, now_mono, kill_signal);
                self.batch.push(rendered);
                EmitOutcome::Enqueued
            }
            None => match self.deferred.push(point, wall_now) {
                PushOutcome::Deferred => EmitOutcome::Deferred,
                PushOutcome::DroppedTooOld => EmitOutcome::Dropped,
            },
        }
    }

    /// `(label, truncated_item)`, truncating to 50 chars when the point
    /// names a service (the eventual metric will be service-attached) or
    /// 100 otherwise.
    fn identity_of(&self, point: &MetricPoint) -> MetricIdentity {
        let max = if point.service_label.is_some() { API_SERVICE_INSTANCE_LENGTH } else { API_METRIC_ITEM_LENGTH };
        (point.label.clone(), truncate(point.item(), max))
    }

    /// Called by the reconciler after a registration batch: move any
    /// deferred points whose identity now has a cache entry into the
    /// outbound batch buffer.
    pub fn replay_deferred(&self, now_mono: f64) {
        let snapshot = self.cache.snapshot();
        let ready = self.deferred.drain_registered(&|identity| snapshot.metrics_by_labelitem.contains_key(identity));
        for point in ready {
            let identity = self.identity_of(&point);
            if let Some(metric) = snapshot.metrics_by_labelitem.get(&identity) {
                let rendered = render(metric, &point, now_mono, None);
                self.batch.push(rendered);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bleemeo_core::{Metric, Thresholds};

    fn point(label: &str) -> MetricPoint {
        MetricPoint {
            label: label.to_string(),
            labels: Default::default(),
            value: 1.0,
            time: 1000.0,
            service_label: None,
            service_instance: None,
            container_name: None,
            status_of: None,
            status_code: None,
            problem_origin: None,
        }
    }

    fn cached_metric(uuid: &str, label: &str) -> Metric {
        Metric {
            uuid: uuid.to_string(),
            label: label.to_string(),
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
    fn unregistered_identity_is_deferred_and_wakes_reconciler() {
        let cache = Arc::new(ObjectCache::empty());
        let emitter = Emitter::new(cache);
        let outcome = emitter.emit(point("cpu_used"), 0.0, 1000.0, None);
        assert_eq!(outcome, EmitOutcome::Deferred);
        assert_eq!(emitter.deferred().len(), 1);
        assert_eq!(emitter.registrations().len(), 1);
    }

    #[test]
    fn registered_identity_goes_straight_to_the_batch() {
        let cache = Arc::new(ObjectCache::empty());
        cache.mutate(|snap| {
            snap.metrics.insert("u1".into(), cached_metric("u1", "cpu_used"));
            snap.rebuild_indexes();
        });
        let emitter = Emitter::new(cache);
        let outcome = emitter.emit(point("cpu_used"), 0.0, 1000.0, None);
        assert_eq!(outcome, EmitOutcome::Enqueued);
        assert_eq!(emitter.batch().len(), 1);
        assert!(emitter.deferred().is_empty());
    }

    #[test]
    fn hold_off_drops_everything() {
        let cache = Arc::new(ObjectCache::empty());
        let emitter = Emitter::new(cache);
        emitter.set_hold_off(true);
        let outcome = emitter.emit(point("cpu_used"), 0.0, 1000.0, None);
        assert_eq!(outcome, EmitOutcome::Dropped);
        assert!(emitter.deferred().is_empty());
    }

    #[test]
    fn replay_moves_newly_registered_points_into_the_batch() {
        let cache = Arc::new(ObjectCache::empty());
        let emitter = Emitter::new(cache.clone());
        emitter.emit(point("cpu_used"), 0.0, 1000.0, None);
        assert!(emitter.batch().is_empty());

        cache.mutate(|snap| {
            snap.metrics.insert("u1".into(), cached_metric("u1", "cpu_used"));
            snap.rebuild_indexes();
        });
        emitter.replay_deferred(10.0);
        assert_eq!(emitter.batch().len(), 1);
        assert!(emitter.deferred().is_empty());
    }
}
