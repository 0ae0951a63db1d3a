//! The reconciler's own task: the impure glue that runs the six ordered
//! phases each iteration, executing the plans the pure `*_sync` modules
//! compute against [`ApiClient`], publishing the result through
//! [`ObjectCache`], and pacing iterations with [`backoff`] /
//! [`error_escalation`].
//!
//! A long-lived struct built once from its collaborators, whose `run`
//! method owns a loop that waits on either an explicit wake event or a
//! timeout before doing work.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{watch, Notify, RwLock};
use tracing::{error, warn};

use bleemeo_api::ApiClient;
use bleemeo_cache::{CacheSnapshot, ObjectCache, StateStore};
use bleemeo_core::model::MetricIdentity;
use bleemeo_core::{wall_time, AgentFact, AgentIdentity, Clock, Container, ConnectorError, Metric, MetricRegistrationRequest, Result, Service, Thresholds};
use bleemeo_emission::Emitter;

use crate::agent_sync::{self, AccountMismatchWarned};
use crate::backoff;
use crate::containers_sync;
use crate::duplicate::{DuplicateDetector, IdentityFacts};
use crate::error_escalation::ErrorEscalation;
use crate::facts_sync;
use crate::metrics_sync::{self, LabelSupportProbe};
use crate::priority;
use crate::provider::LocalStateProvider;
use crate::services_sync::{self, ServiceFlip};

/// Narrow seam the reconciler needs from the broker session: forcing it
/// down for the duration of a duplicate-agent hold-off. Kept as
/// a trait, not a direct dependency on `bleemeo-broker`'s `rumqttc`-backed
/// session, so the reconciler never holds a live MQTT handle across a
/// cache-snapshot boundary.
pub trait BrokerControl: Send + Sync {
    fn set_hold_off(&self, held: bool);
}

const INACTIVATION_GRACE_PERIOD_STARTUP_SECONDS: f64 = 70.0 * 60.0;
const REGISTRATION_PRUNE_AGE_SECONDS: f64 = 70.0 * 60.0;

/// Account-wide configuration the reconciler needs at construction time;
/// everything else (credentials, uuid) lives in the shared [`AgentIdentity`].
pub struct ReconcilerConfig {
    pub account_id: String,
    pub display_name: String,
    pub fqdn: String,
}

/// State shared between [`ReconcilerLoop`] and its [`ReconcilerHandle`]:
/// the inbound-notification side effects
/// (`threshold-update`, `config-changed`, `config-will-change`) without
/// coupling this crate to `bleemeo-broker`'s wire types.
struct Shared {
    wake: Notify,
    update_metrics: StdMutex<HashSet<String>>,
    full_sync_requested: AtomicBool,
    config_will_change: AtomicBool,
}

/// A cheap, cloneable handle the broker task uses to poke the reconciler
/// loop when an inbound notification arrives.
#[derive(Clone)]
pub struct ReconcilerHandle {
    shared: Arc<Shared>,
}

impl ReconcilerHandle {
    pub fn mark_metric_for_refresh(&self, metric_uuid: String) {
        self.shared.update_metrics.lock().expect("update_metrics lock poisoned").insert(metric_uuid);
        self.shared.wake.notify_one();
    }

    pub fn request_full_sync(&self) {
        self.shared.full_sync_requested.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    pub fn mark_config_will_change(&self) {
        self.shared.config_will_change.store(true, Ordering::SeqCst);
    }
}

pub struct ReconcilerLoop {
    api: Arc<ApiClient>,
    cache: Arc<ObjectCache>,
    emitter: Arc<Emitter>,
    broker: Arc<dyn BrokerControl>,
    provider: Arc<dyn LocalStateProvider>,
    identity: Arc<RwLock<AgentIdentity>>,
    store: tokio::sync::Mutex<Box<dyn StateStore>>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    terminating: watch::Receiver<bool>,
    shared: Arc<Shared>,

    started_at_mono: f64,
    escalation: ErrorEscalation,
    duplicates: DuplicateDetector,
    account_mismatch: AccountMismatchWarned,
    label_support: LabelSupportProbe,
    cached_identity_facts: StdMutex<IdentityFacts>,
    last_containers_removed: StdMutex<Option<f64>>,
    next_full_sync_at: StdMutex<f64>,
}

impl ReconcilerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<ApiClient>,
        cache: Arc<ObjectCache>,
        emitter: Arc<Emitter>,
        broker: Arc<dyn BrokerControl>,
        provider: Arc<dyn LocalStateProvider>,
        identity: Arc<RwLock<AgentIdentity>>,
        store: Box<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
        terminating: watch::Receiver<bool>,
    ) -> (Self, ReconcilerHandle) {
        let shared = Arc::new(Shared {
            wake: Notify::new(),
            update_metrics: StdMutex::new(HashSet::new()),
            full_sync_requested: AtomicBool::new(false),
            config_will_change: AtomicBool::new(false),
        });
        let handle = ReconcilerHandle { shared: shared.clone() };
        let started_at_mono = clock.now();
        let this = Self {
            api,
            cache,
            emitter,
            broker,
            provider,
            identity,
            store: tokio::sync::Mutex::new(store),
            clock,
            config,
            terminating,
            shared,
            started_at_mono,
            escalation: ErrorEscalation::new(),
            duplicates: DuplicateDetector::new(),
            account_mismatch: AccountMismatchWarned::new(),
            label_support: LabelSupportProbe::new(),
            cached_identity_facts: StdMutex::new(IdentityFacts::default()),
            last_containers_removed: StdMutex::new(None),
            next_full_sync_at: StdMutex::new(0.0),
        };
        (this, handle)
    }

    /// The long-lived task body: initial jitter, then an iteration loop
    /// gated by the wake event / full-sync cadence / explicit termination.
    pub async fn run(mut self) {
        let cache_was_nonempty = !self.cache.snapshot().metrics.is_empty();
        if cache_was_nonempty {
            let jitter = backoff::initial_jitter(&mut rand::thread_rng());
            self.sleep_or_terminate(Duration::from_secs_f64(jitter)).await;
        }
        *self.next_full_sync_at.lock().unwrap() =
            self.clock.now() + backoff::full_sync_interval(&mut rand::thread_rng());

        loop {
            if *self.terminating.borrow() {
                return;
            }

            let iteration_result = self.run_iteration().await;
            let wait = match iteration_result {
                Ok(()) => {
                    self.escalation.record_success();
                    Duration::from_secs(30)
                }
                Err(err) if err.is_auth() => {
                    let n = self.escalation.record_auth_error();
                    let delay = backoff::auth_error_delay(&mut rand::thread_rng(), n);
                    error!(error = %err, fqdn = %self.config.fqdn, delay, "reconciler auth error, backing off");
                    Duration::from_secs_f64(delay)
                }
                Err(err) => {
                    error!(error = %err, "reconciler iteration failed");
                    let delay = self.escalation.record_phase_error(&err);
                    Duration::from_secs_f64(delay)
                }
            };

            tokio::select! {
                _ = self.terminating.changed() => {}
                _ = self.emitter.reconciler_wake.notified() => {}
                _ = self.shared.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn sleep_or_terminate(&mut self, duration: Duration) {
        tokio::select! {
            _ = self.terminating.changed() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// One pass through the six ordered phases. Later
    /// phases depend on earlier ones having registered their objects, so
    /// phases run strictly sequentially.
    async fn run_iteration(&mut self) -> Result<()> {
        let identity = self.identity.read().await.clone();
        if !identity.is_registered() {
            return Err(ConnectorError::Invariant("reconciler started before initial registration".to_string()));
        }

        let full_due = self.clock.now() >= *self.next_full_sync_at.lock().unwrap();
        let full_requested = self.shared.full_sync_requested.swap(false, Ordering::SeqCst);
        let mut full = full_due || full_requested || self.escalation.should_escalate();
        if full {
            *self.next_full_sync_at.lock().unwrap() =
                self.clock.now() + backoff::full_sync_interval(&mut rand::thread_rng());
            self.label_support.reset_for_full_sync();
        }

        if self.run_duplicate_check(&identity).await? {
            // Held off: every later phase this iteration is skipped, but
            // the loop itself keeps running so the hold-off can expire.
            return Ok(());
        }

        if let Err(err) = self.run_agent_sync(&identity, &mut full).await {
            warn!(error = %err, "agent sync phase failed, skipping remainder of this phase");
        }

        if let Err(err) = self.run_facts_sync(&identity).await {
            warn!(error = %err, "facts sync phase failed, skipping remainder of this phase");
        }

        if let Err(err) = self.run_services_sync(&identity, full).await {
            warn!(error = %err, "services sync phase failed, skipping remainder of this phase");
        }

        if let Err(err) = self.run_containers_sync(&identity, full).await {
            warn!(error = %err, "containers sync phase failed, skipping remainder of this phase");
        }

        self.run_metrics_sync(&identity, full).await?;

        Ok(())
    }

    /// Phase 1: duplicate-agent detection. Returns `true` if the loop should skip every other
    /// phase this iteration because a hold-off is now active.
    async fn run_duplicate_check(&mut self, identity: &AgentIdentity) -> Result<bool> {
        let observed = self.provider.identity_facts().await;
        let cached = self.cached_identity_facts.lock().unwrap().clone();

        if cached == IdentityFacts::default() {
            *self.cached_identity_facts.lock().unwrap() = observed;
            return Ok(false);
        }

        if !crate::duplicate::is_mismatch(&cached, &observed) {
            *self.cached_identity_facts.lock().unwrap() = observed;
            return Ok(false);
        }

        let now = self.clock.now();
        let hold_off = self.duplicates.record_detection(now, &mut rand::thread_rng());
        warn!(
            agent_uuid = identity.agent_uuid.as_deref().unwrap_or(""),
            hold_off_seconds = hold_off,
            "duplicate agent detected: another agent is using these credentials"
        );
        self.broker.set_hold_off(true);
        self.emitter.set_hold_off(true);

        // Persist immediately so a restart mid-hold-off does not
        // re-trigger detection against stale in-memory facts.
        {
            let mut store = self.store.lock().await;
            if let Err(err) = self.cache.save(&mut **store) {
                warn!(error = %err, "failed to persist cache during duplicate hold-off");
            }
        }

        let wait = Duration::from_secs_f64(hold_off);
        self.sleep_or_terminate(wait).await;
        self.broker.set_hold_off(false);
        self.emitter.set_hold_off(false);
        Ok(true)
    }

    /// Phase 2: agent record sync.
    async fn run_agent_sync(&mut self, identity: &AgentIdentity, full: &mut bool) -> Result<()> {
        let agent_uuid = identity.agent_uuid.as_deref().unwrap_or_default();
        let tags = self.cache.snapshot().tags.clone();
        let valid_tags = agent_sync::valid_tags(&tags);
        let body = json!({
            "tags": valid_tags.iter().map(|t| json!({"name": t})).collect::<Vec<_>>(),
        });
        let path = format!("/v1/agent/{agent_uuid}/");
        let response = self.api.patch(identity, &path, &body).await?;
        let parsed = agent_sync::parse_agent_patch_response(&response)?;

        if self.account_mismatch.observe(&self.config.account_id, &parsed.account) {
            warn!(
                configured = %self.config.account_id,
                server = %parsed.account,
                "agent record's account differs from the configured account; using the server's value"
            );
        }

        let mut current_config = None;
        if let Some(config_uuid) = &parsed.current_config_uuid {
            let accountconfig_path = format!("/v1/accountconfig/{config_uuid}/");
            let config_value = self.api.get_account_config(identity, &accountconfig_path).await?;
            current_config = Some(agent_sync::parse_account_config(config_uuid.clone(), &config_value)?);
        }

        let config_will_change = self.shared.config_will_change.swap(false, Ordering::SeqCst);
        if config_will_change {
            *full = true;
        }

        self.cache.mutate(|snap: &mut CacheSnapshot| {
            snap.tags = parsed.tags.clone();
            snap.next_config_at = parsed.next_config_at;
            snap.account_id = Some(parsed.account.clone());
            if let Some(config) = current_config {
                snap.current_config = Some(config);
            }
            snap.registration_at = parsed.created_at.or(snap.registration_at);
        });

        Ok(())
    }

    /// Phase 3: facts sync.
    async fn run_facts_sync(&mut self, identity: &AgentIdentity) -> Result<()> {
        let local = self.provider.facts().await;
        let snapshot = self.cache.snapshot();
        let docker_integration = snapshot.current_config.as_ref().map(|c| c.docker_integration).unwrap_or(true);
        let plan = facts_sync::plan_facts_sync(&local, &snapshot.facts_by_key, docker_integration);

        let agent_uuid = identity.agent_uuid.as_deref().unwrap_or_default();
        let mut created = Vec::new();
        for (key, value) in &plan.to_create {
            let body = json!({"agent": agent_uuid, "key": key, "value": value});
            let response = self.api.post(identity, "/v1/agentfact/", &body).await?;
            if let Some(uuid) = response.get("id").and_then(Value::as_str) {
                created.push(AgentFact { uuid: uuid.to_string(), key: key.clone(), value: value.clone() });
            }
        }

        for fact in &plan.to_delete {
            let path = format!("/v1/agentfact/{}/", fact.uuid);
            match self.api.delete(identity, &path).await {
                Ok(()) | Err(ConnectorError::NotFound { .. }) => {}
                Err(ConnectorError::Forbidden { .. }) => break,
                Err(err) => return Err(err),
            }
        }

        let deleted_uuids: HashSet<String> = plan.to_delete.iter().map(|f| f.uuid.clone()).collect();
        self.cache.mutate(|snap| {
            snap.facts.retain(|uuid, _| !deleted_uuids.contains(uuid));
            for fact in &created {
                snap.facts.insert(fact.uuid.clone(), fact.clone());
            }
            snap.rebuild_indexes();
        });

        Ok(())
    }

    /// Phase 4: services sync.
    async fn run_services_sync(&mut self, identity: &AgentIdentity, full: bool) -> Result<()> {
        let locals = self.provider.services().await;
        let snapshot = self.cache.snapshot();

        if full {
            let remote: Vec<Value> = self.api.paginate(identity, "/v1/service/").await?;
            let remote_services = parse_services(&remote)?;
            self.cache.mutate(|snap| {
                snap.services = remote_services.into_iter().map(|s| (s.uuid.clone(), s)).collect();
                snap.rebuild_indexes();
            });
        }

        let snapshot = self.cache.snapshot();
        let plan = services_sync::plan_services_sync(&locals, &snapshot.services_by_labelinstance, full);

        let agent_uuid = identity.agent_uuid.as_deref().unwrap_or_default();
        let mut upserted = Vec::new();
        for info in &plan.to_create {
            let addresses = services_sync::compute_listen_addresses(info);
            let body = service_body(agent_uuid, &self.config.account_id, info, &addresses);
            let response = self.api.post(identity, "/v1/service/", &body).await?;
            if let Some(uuid) = response.get("id").and_then(Value::as_str) {
                upserted.push(service_from_info(uuid.to_string(), info, addresses));
            }
        }
        for (uuid, info) in &plan.to_update {
            let addresses = services_sync::compute_listen_addresses(info);
            let body = service_body(agent_uuid, &self.config.account_id, info, &addresses);
            let path = format!("/v1/service/{uuid}/");
            match self.api.patch(identity, &path, &body).await {
                Ok(_) => upserted.push(service_from_info(uuid.clone(), info, addresses)),
                Err(ConnectorError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        let mut deleted_uuids = HashSet::new();
        for service in &plan.to_delete {
            let path = format!("/v1/service/{}/", service.uuid);
            match self.api.delete(identity, &path).await {
                Ok(()) | Err(ConnectorError::NotFound { .. }) => {
                    deleted_uuids.insert(service.uuid.clone());
                }
                Err(ConnectorError::Forbidden { .. }) => break,
                Err(err) => return Err(err),
            }
        }

        let now_wall = wall_time();
        self.cache.mutate(|snap| {
            snap.services.retain(|uuid, _| !deleted_uuids.contains(uuid));
            for service in &upserted {
                snap.services.insert(service.uuid.clone(), service.clone());
            }
            for flip in &plan.flips {
                let (uuid, deactivated_at) = match flip {
                    ServiceFlip::Activated { service_uuid } => (service_uuid, None),
                    ServiceFlip::Deactivated { service_uuid } => (service_uuid, Some(now_wall)),
                };
                for metric in snap.metrics.values_mut() {
                    if metric.service_uuid.as_deref() == Some(uuid.as_str()) {
                        metric.deactivated_at = deactivated_at;
                    }
                }
            }
            snap.rebuild_indexes();
        });

        Ok(())
    }

    /// Phase 5: containers sync.
    async fn run_containers_sync(&mut self, identity: &AgentIdentity, full: bool) -> Result<()> {
        let locals = self.provider.containers().await;

        if full {
            let remote: Vec<Value> = self.api.paginate(identity, "/v1/container/").await?;
            let remote_containers = parse_containers(&remote)?;
            self.cache.mutate(|snap| {
                snap.containers = remote_containers.into_iter().map(|c| (c.uuid.clone(), c)).collect();
                snap.rebuild_indexes();
            });
        }

        let snapshot = self.cache.snapshot();
        let plan = containers_sync::plan_containers_sync(&locals, &snapshot.containers_by_name, full);

        let agent_uuid = identity.agent_uuid.as_deref().unwrap_or_default();
        let mut upserted = Vec::new();
        for info in &plan.to_create {
            let hash = bleemeo_core::docker::inspect_hash(&info.inspect);
            let body = json!({"agent": agent_uuid, "name": info.name, "docker_id": info.docker_id});
            let response = self.api.post(identity, "/v1/container/", &body).await?;
            if let Some(uuid) = response.get("id").and_then(Value::as_str) {
                upserted.push(Container { uuid: uuid.to_string(), name: info.name.clone(), docker_id: info.docker_id.clone(), inspect_hash: hash });
            }
        }
        for (uuid, info, hash) in &plan.to_update {
            let body = json!({"agent": agent_uuid, "name": info.name, "docker_id": info.docker_id});
            let path = format!("/v1/container/{uuid}/");
            match self.api.patch(identity, &path, &body).await {
                Ok(_) => upserted.push(Container { uuid: uuid.clone(), name: info.name.clone(), docker_id: info.docker_id.clone(), inspect_hash: hash.clone() }),
                Err(ConnectorError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        let mut deleted_uuids = HashSet::new();
        for container in &plan.to_delete {
            let path = format!("/v1/container/{}/", container.uuid);
            match self.api.delete(identity, &path).await {
                Ok(()) | Err(ConnectorError::NotFound { .. }) => {
                    deleted_uuids.insert(container.uuid.clone());
                }
                Err(ConnectorError::Forbidden { .. }) => break,
                Err(err) => return Err(err),
            }
        }

        if !deleted_uuids.is_empty() {
            *self.last_containers_removed.lock().unwrap() = Some(self.clock.now());
        }

        self.cache.mutate(|snap| {
            snap.containers.retain(|uuid, _| !deleted_uuids.contains(uuid));
            for container in &upserted {
                snap.containers.insert(container.uuid.clone(), container.clone());
            }
            // Cascading delete: every metric referencing a removed
            // container is dropped in the same phase,
            // not merely on the next metrics phase.
            snap.metrics.retain(|_, metric| {
                metric.container_uuid.as_ref().map(|uuid| !deleted_uuids.contains(uuid)).unwrap_or(true)
            });
            snap.rebuild_indexes();
        });

        Ok(())
    }

    /// Phase 6: metric synchronization, the most intricate phase.
    async fn run_metrics_sync(&mut self, identity: &AgentIdentity, mut full: bool) -> Result<()> {
        let agent_uuid = identity.agent_uuid.as_deref().unwrap_or_default().to_string();
        let update_metrics: HashSet<String> = {
            let mut guard = self.shared.update_metrics.lock().unwrap();
            std::mem::take(&mut *guard)
        };

        let snapshot = self.cache.snapshot();
        let active_count = snapshot.metrics.values().filter(|m| m.is_active()).count();
        let pending = self.emitter.registrations().snapshot();

        let mut full_inactive = false;
        if metrics_sync::escalate_to_full(update_metrics.len(), active_count.max(1)) {
            full = true;
        }
        if metrics_sync::escalate_to_full_with_inactive(pending.len(), snapshot.metrics.len().max(1)) {
            full = true;
            full_inactive = true;
        }

        if full {
            let path = if full_inactive { "/v1/metric/" } else { "/v1/metric/?active=true" };
            let remote: Vec<Value> = self.api.paginate(identity, path).await?;
            let remote_metrics = parse_metrics(&remote)?;
            self.cache.mutate(|snap| {
                if full_inactive {
                    snap.metrics = remote_metrics.into_iter().map(|m| (m.uuid.clone(), m)).collect();
                } else {
                    let inactive: HashMap<String, Metric> =
                        snap.metrics.iter().filter(|(_, m)| !m.is_active()).map(|(k, v)| (k.clone(), v.clone())).collect();
                    snap.metrics = remote_metrics.into_iter().map(|m| (m.uuid.clone(), m)).collect();
                    snap.metrics.extend(inactive);
                }
                snap.rebuild_indexes();
            });
        } else {
            for metric_uuid in &update_metrics {
                let path = format!("/v1/metric/{metric_uuid}/");
                match self.api.get(identity, &path).await {
                    Ok(value) => {
                        if let Ok(metric) = parse_metric(&value) {
                            self.cache.mutate(|snap| {
                                snap.metrics.insert(metric.uuid.clone(), metric);
                                snap.rebuild_indexes();
                            });
                        }
                    }
                    Err(ConnectorError::NotFound { .. }) => {
                        self.cache.mutate(|snap| {
                            snap.metrics.remove(metric_uuid);
                            snap.rebuild_indexes();
                        });
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // Registration of pending identities.
        let snapshot = self.cache.snapshot();
        let prioritized = priority::prioritize(pending, &mut rand::thread_rng());
        let (ready, _still_deferred) = metrics_sync::resolve_registration_order(prioritized, &snapshot);

        for request in &ready {
            let item = request.labels.get("item").cloned().unwrap_or_default();
            let identity_key: MetricIdentity = (request.label.clone(), item);
            if let Some(metric) = snapshot.metrics_by_labelitem.get(&identity_key) {
                self.maybe_backfill_labels(identity, metric, request).await;
                self.emitter.registrations().remove(&identity_key);
                continue;
            }

            // Avoid duplicate-UUID creation races: check for an existing
            // remote object with this exact identity, filtered by
            // (agent, label, item), before POSTing a new one.
            let query = format!(
                "/v1/metric/?agent={agent_uuid}&label={}&item={}",
                urlencoding::encode(&request.label),
                urlencoding::encode(&identity_key.1),
            );
            let existing: Vec<Value> = self.api.paginate(identity, &query).await?;
            if let Some(first) = existing.into_iter().next() {
                if let Ok(metric) = parse_metric(&first) {
                    self.maybe_backfill_labels(identity, &metric, request).await;
                    self.cache.mutate(|snap| {
                        snap.metrics.insert(metric.uuid.clone(), metric);
                        snap.rebuild_indexes();
                    });
                    self.emitter.registrations().remove(&identity_key);
                    continue;
                }
            }

            match self.register_metric_with_retry(identity, &agent_uuid, request).await {
                Err(err) => {
                    warn!(label = %request.label, error = %err, "metric registration failed after retries");
                }
                Ok(metric) => {
                    self.maybe_backfill_labels(identity, &metric, request).await;
                    self.emitter.registrations().remove(&identity_key);
                }
            }
        }

        self.emitter.replay_deferred(self.clock.now());

        // Reactivation / inactivation / final pruning.
        self.run_metrics_lifecycle(identity).await?;

        // Ignore-check deletions.
        self.run_ignore_check_deletions(identity).await;

        self.emitter.registrations().prune_stale(self.clock.now(), REGISTRATION_PRUNE_AGE_SECONDS);

        Ok(())
    }

    /// PATCH `labels` onto `metric` when the local registration request
    /// carries labels the remote object doesn't have yet, and the account
    /// is known to support the field (probed once per full-sync window).
    async fn maybe_backfill_labels(&self, identity: &AgentIdentity, metric: &Metric, request: &MetricRegistrationRequest) {
        if !self.label_support.is_supported() || !metrics_sync::needs_label_backfill(metric, &request.labels) {
            return;
        }
        let path = format!("/v1/metric/{}/", metric.uuid);
        match self.api.patch(identity, &path, &json!({"labels": request.labels})).await {
            Ok(response) => {
                let had_labels = response.get("labels").is_some();
                self.label_support.observe(had_labels);
                if had_labels {
                    if let Ok(updated) = parse_metric(&response) {
                        self.cache.mutate(|snap| {
                            snap.metrics.insert(updated.uuid.clone(), updated);
                            snap.rebuild_indexes();
                        });
                    }
                }
            }
            Err(ConnectorError::NotFound { .. }) => {
                self.cache.mutate(|snap| {
                    snap.metrics.remove(&metric.uuid);
                    snap.rebuild_indexes();
                });
            }
            Err(err) => {
                warn!(metric = %metric.uuid, error = %err, "label backfill PATCH failed");
            }
        }
    }

    async fn register_metric_with_retry(
        &self,
        identity: &AgentIdentity,
        agent_uuid: &str,
        request: &MetricRegistrationRequest,
    ) -> Result<Metric> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut body = json!({
                "agent": agent_uuid,
                "label": request.label,
            });
            if let Some(item) = request.labels.get("item") {
                body["item"] = json!(item);
            }
            body["labels"] = json!(request.labels);
            if let Some(service_label) = &request.service_label {
                let snapshot = self.cache.snapshot();
                let instance = request.instance.clone().unwrap_or_default();
                if let Some(service) = snapshot.services_by_labelinstance.get(&(service_label.clone(), instance)) {
                    body["service"] = json!(service.uuid);
                }
            }
            if let Some(container_name) = &request.container_name {
                let snapshot = self.cache.snapshot();
                if let Some(container) = snapshot.containers_by_name.get(container_name) {
                    body["container"] = json!(container.uuid);
                }
            }
            if let Some(status_of_label) = &request.status_of_label {
                let snapshot = self.cache.snapshot();
                let item = request.labels.get("item").cloned().unwrap_or_default();
                if let Some(target) = snapshot.metrics_by_labelitem.get(&(status_of_label.clone(), item)) {
                    body["status_of"] = json!(target.uuid);
                }
            }
            if let Some(status) = request.last_status {
                body["status"] = json!(status);
            }

            match self.api.post(identity, "/v1/metric/", &body).await {
                Ok(response) => {
                    let metric = parse_metric(&response)?;
                    self.cache.mutate(|snap| {
                        snap.metrics.insert(metric.uuid.clone(), metric.clone());
                        snap.rebuild_indexes();
                    });
                    return Ok(metric);
                }
                Err(err @ (ConnectorError::NotFound { .. } | ConnectorError::Forbidden { .. })) => return Err(err),
                Err(err) if attempt >= backoff::MAX_METRIC_REGISTRATION_ATTEMPTS => return Err(err),
                Err(_) => {
                    let delay = backoff::metric_registration_retry_delay(attempt);
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
            }
        }
    }

    async fn run_metrics_lifecycle(&mut self, identity: &AgentIdentity) -> Result<()> {
        let now_mono = self.clock.now();
        let now_wall = wall_time();
        let uptime = now_mono - self.started_at_mono;
        let snapshot = self.cache.snapshot();

        let mut to_reactivate = Vec::new();
        let mut to_inactivate = Vec::new();
        let mut to_evict = Vec::new();

        for metric in snapshot.metrics.values() {
            if let Some(deactivated_at) = metric.deactivated_at {
                if metrics_sync::should_evict(deactivated_at, now_wall) {
                    to_evict.push(metric.uuid.clone());
                    continue;
                }
                let item = metric.labels.get("item").cloned().unwrap_or_default();
                let last_seen = self
                    .emitter
                    .registrations()
                    .snapshot()
                    .into_iter()
                    .find(|r| r.label == metric.label && r.labels.get("item").cloned().unwrap_or_default() == item)
                    .map(|r| r.last_seen);
                if let Some(last_seen) = last_seen {
                    if metrics_sync::should_reactivate(deactivated_at, now_wall, last_seen, now_mono) {
                        to_reactivate.push(metric.uuid.clone());
                    }
                }
            } else if uptime >= INACTIVATION_GRACE_PERIOD_STARTUP_SECONDS {
                let item = metric.labels.get("item").cloned().unwrap_or_default();
                let last_seen = self
                    .emitter
                    .registrations()
                    .snapshot()
                    .into_iter()
                    .find(|r| r.label == metric.label && r.labels.get("item").cloned().unwrap_or_default() == item)
                    .map(|r| r.last_seen);
                if metrics_sync::should_inactivate(&metric.label, last_seen, now_mono, uptime) {
                    to_inactivate.push(metric.uuid.clone());
                }
            }
        }

        for uuid in &to_reactivate {
            let path = format!("/v1/metric/{uuid}/");
            match self.api.patch(identity, &path, &json!({"active": true})).await {
                Ok(_) => self.cache.mutate(|snap| {
                    if let Some(m) = snap.metrics.get_mut(uuid) {
                        m.deactivated_at = None;
                    }
                    snap.rebuild_indexes();
                }),
                Err(ConnectorError::NotFound { .. }) => self.cache.mutate(|snap| {
                    snap.metrics.remove(uuid);
                    snap.rebuild_indexes();
                }),
                Err(err) => return Err(err),
            }
        }

        for uuid in &to_inactivate {
            let path = format!("/v1/metric/{uuid}/");
            match self.api.patch(identity, &path, &json!({"active": false})).await {
                Ok(_) => self.cache.mutate(|snap| {
                    if let Some(m) = snap.metrics.get_mut(uuid) {
                        m.deactivated_at = Some(now_wall);
                    }
                    snap.rebuild_indexes();
                }),
                Err(ConnectorError::NotFound { .. }) => self.cache.mutate(|snap| {
                    snap.metrics.remove(uuid);
                    snap.rebuild_indexes();
                }),
                Err(err) => return Err(err),
            }
        }

        if !to_evict.is_empty() {
            self.cache.mutate(|snap| {
                for uuid in &to_evict {
                    snap.metrics.remove(uuid);
                }
                snap.rebuild_indexes();
            });
        }

        Ok(())
    }

    /// Delete the `{service_label}_status` metric for every service
    /// flagged `ignore_check=true`. A 403 short-circuits the whole sub-phase for this
    /// loop, not just the one service.
    async fn run_ignore_check_deletions(&mut self, identity: &AgentIdentity) {
        let locals = self.provider.services().await;
        let snapshot = self.cache.snapshot();

        for info in locals.iter().filter(|s| s.ignore_check) {
            let status_label = format!("{}_status", info.label);
            let instance = info.instance.clone().unwrap_or_default();
            let truncated = bleemeo_core::truncate::truncate(&instance, bleemeo_core::truncate::API_SERVICE_INSTANCE_LENGTH);
            let identity_key: MetricIdentity = (status_label, truncated);
            let Some(metric) = snapshot.metrics_by_labelitem.get(&identity_key) else { continue };

            let path = format!("/v1/metric/{}/", metric.uuid);
            match self.api.delete(identity, &path).await {
                Ok(()) | Err(ConnectorError::NotFound { .. }) => {
                    let uuid = metric.uuid.clone();
                    self.cache.mutate(|snap| {
                        snap.metrics.remove(&uuid);
                        snap.rebuild_indexes();
                    });
                }
                Err(ConnectorError::Forbidden { .. }) => break,
                Err(_) => {}
            }
        }
    }
}

fn parse_metric(value: &Value) -> Result<Metric> {
    let uuid = value.get("id").and_then(Value::as_str).ok_or_else(|| ConnectorError::Invariant("metric missing id".to_string()))?;
    let label = value.get("label").and_then(Value::as_str).unwrap_or_default().to_string();
    let labels = value
        .get("labels")
        .and_then(Value::as_object)
        .map(|o| o.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default();
    Ok(Metric {
        uuid: uuid.to_string(),
        label,
        labels,
        service_uuid: value.get("service").and_then(Value::as_str).map(str::to_string),
        container_uuid: value.get("container").and_then(Value::as_str).map(str::to_string),
        status_of_uuid: value.get("status_of").and_then(Value::as_str).map(str::to_string),
        thresholds: Thresholds {
            low_warning: value.get("threshold_low_warning").and_then(Value::as_f64),
            low_critical: value.get("threshold_low_critical").and_then(Value::as_f64),
            high_warning: value.get("threshold_high_warning").and_then(Value::as_f64),
            high_critical: value.get("threshold_high_critical").and_then(Value::as_f64),
        },
        unit_code: value.get("unit").and_then(Value::as_i64),
        unit_text: value.get("unit_text").and_then(Value::as_str).map(str::to_string),
        deactivated_at: value.get("deactivated_at").and_then(Value::as_str).and_then(|s| bleemeo_core::datetime::api_datetime_to_time(Some(s))),
    })
}

fn parse_metrics(values: &[Value]) -> Result<Vec<Metric>> {
    values.iter().map(parse_metric).collect()
}

fn parse_services(values: &[Value]) -> Result<Vec<Service>> {
    values
        .iter()
        .map(|value| {
            let uuid = value.get("id").and_then(Value::as_str).ok_or_else(|| ConnectorError::Invariant("service missing id".to_string()))?;
            Ok(Service {
                uuid: uuid.to_string(),
                label: value.get("label").and_then(Value::as_str).unwrap_or_default().to_string(),
                instance: value.get("instance").and_then(Value::as_str).map(str::to_string),
                listen_addresses: value
                    .get("listen_addresses")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default(),
                exe_path: value.get("exe_path").and_then(Value::as_str).unwrap_or_default().to_string(),
                stack: value.get("stack").and_then(Value::as_str).unwrap_or_default().to_string(),
                active: value.get("active").and_then(Value::as_bool).unwrap_or(true),
            })
        })
        .collect()
}

fn parse_containers(values: &[Value]) -> Result<Vec<Container>> {
    values
        .iter()
        .map(|value| {
            let uuid = value.get("id").and_then(Value::as_str).ok_or_else(|| ConnectorError::Invariant("container missing id".to_string()))?;
            Ok(Container {
                uuid: uuid.to_string(),
                name: value.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                docker_id: value.get("docker_id").and_then(Value::as_str).unwrap_or_default().to_string(),
                inspect_hash: value.get("inspect_hash").and_then(Value::as_str).unwrap_or_default().to_string(),
            })
        })
        .collect()
}

fn service_from_info(uuid: String, info: &crate::services_sync::ServiceInfo, addresses: HashSet<String>) -> Service {
    Service {
        uuid,
        label: info.label.clone(),
        instance: info.instance.clone(),
        listen_addresses: addresses,
        exe_path: info.exe_path.clone(),
        stack: info.stack.clone(),
        active: info.active,
    }
}

fn service_body(agent_uuid: &str, account_id: &str, info: &crate::services_sync::ServiceInfo, addresses: &HashSet<String>) -> Value {
    json!({
        "agent": agent_uuid,
        "account": account_id,
        "label": info.label,
        "instance": info.instance,
        "listen_addresses": addresses.iter().cloned().collect::<Vec<_>>(),
        "exe_path": info.exe_path,
        "stack": info.stack,
        "active": info.active,
    })
}
