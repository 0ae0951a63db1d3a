//! Wires `bleemeo_broker::BrokerSession` into a long-lived task: connect,
//! subscribe, dispatch inbound notifications to the reconciler, flush the
//! emission path's outbound batch, and reconnect with backoff on drop.
//!
//! Owns its own loop that waits on inbound events or a timeout, the same
//! shape `bleemeo_reconciler::runner::ReconcilerLoop::run` uses.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rumqttc::{Event, Incoming};
use tokio::sync::watch;
use tracing::{info, warn};

use bleemeo_broker::{BrokerConfig, BrokerSession, DiagnosticGate, InboundMessage, OutboundGate, ReconnectPolicy};
use bleemeo_core::Clock;
use bleemeo_emission::Emitter;
use bleemeo_reconciler::{BrokerControl, ReconcilerHandle};

const EVENT_CAPACITY: usize = 64;

/// `Arc`-shared hold-off flag implementing [`BrokerControl`]; the
/// reconciler forces the broker down for the duration of a duplicate-agent
/// hold-off without holding a reference to the live
/// MQTT session itself.
#[derive(Default)]
pub struct BrokerControlGate(AtomicBool);

impl BrokerControlGate {
    pub fn is_held_off(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl BrokerControl for BrokerControlGate {
    fn set_hold_off(&self, held: bool) {
        self.0.store(held, Ordering::SeqCst);
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    config: BrokerConfig,
    agent_uuid: String,
    install_dir: String,
    api_base_url: String,
    upgrade_file: PathBuf,
    gate: Arc<BrokerControlGate>,
    handle: ReconcilerHandle,
    emitter: Arc<Emitter>,
    clock: Arc<dyn Clock>,
    mut terminating: watch::Receiver<bool>,
) {
    let mut reconnect = ReconnectPolicy::new();
    let mut diagnostics = DiagnosticGate::default();

    loop {
        if *terminating.borrow() {
            return;
        }

        if gate.is_held_off() {
            if wait_for(&mut terminating, std::time::Duration::from_secs(1)).await {
                return;
            }
            continue;
        }

        let (session, event_loop) = match BrokerSession::connect(&config, &agent_uuid, &install_dir, EVENT_CAPACITY) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "failed to build broker session");
                if wait_for(&mut terminating, std::time::Duration::from_secs(5)).await {
                    return;
                }
                continue;
            }
        };

        if let Err(err) = session.publish_connect("").await {
            warn!(error = %err, "failed to publish connect notice");
        }
        if let Err(err) = session.subscribe_notifications().await {
            warn!(error = %err, "failed to subscribe to notifications");
        }
        reconnect.record_connected();

        let outbound_gate = session.outbound_gate();
        let disconnect_cause =
            run_connection(&session, event_loop, &gate, &outbound_gate, &handle, &emitter, &mut terminating).await;

        let cause = if disconnect_cause == DisconnectCause::Terminating && upgrade_file.exists() {
            "Upgrade"
        } else {
            disconnect_cause.as_str()
        };
        session.publish_disconnect(cause).await.ok();
        drain_outbound_queue(&outbound_gate, std::time::Duration::from_secs(5)).await;
        session.disconnect().await;

        if disconnect_cause == DisconnectCause::Terminating {
            return;
        }

        reconnect.record_disconnect(clock.now());
        if diagnostics.should_run(clock.now()) {
            diagnostics.record_run(clock.now());
            let steps = bleemeo_broker::diagnostics::run_diagnostic(&config.host, config.port, &api_base_url).await;
            for step in steps {
                info!(?step, "broker-down diagnostic step");
            }
        }

        let delay = reconnect.next_delay(clock.now());
        if delay > std::time::Duration::ZERO && wait_for(&mut terminating, delay).await {
            return;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectCause {
    Terminating,
    Dropped,
    HeldOff,
}

impl DisconnectCause {
    fn as_str(&self) -> &'static str {
        match self {
            DisconnectCause::Terminating => "Clean shutdown",
            DisconnectCause::Dropped => "connection lost",
            DisconnectCause::HeldOff => "duplicate agent hold-off",
        }
    }
}

/// Drive one connection: poll the MQTT event loop, dispatch inbound
/// notifications, and flush the outbound batch buffer, until the
/// connection drops, a hold-off begins, or the process is terminating.
async fn run_connection(
    session: &BrokerSession,
    mut event_loop: rumqttc::EventLoop,
    gate: &Arc<BrokerControlGate>,
    outbound_gate: &Arc<OutboundGate>,
    handle: &ReconcilerHandle,
    emitter: &Arc<Emitter>,
    terminating: &mut watch::Receiver<bool>,
) -> DisconnectCause {
    loop {
        tokio::select! {
            _ = terminating.changed() => {
                if *terminating.borrow() {
                    return DisconnectCause::Terminating;
                }
            }
            batch = emitter.batch().next_batch() => {
                if gate.is_held_off() {
                    return DisconnectCause::HeldOff;
                }
                if !batch.is_empty() {
                    match serde_json::to_vec(&batch) {
                        Ok(payload) => {
                            if let Err(err) = session.publish_data(payload).await {
                                warn!(error = %err, "failed to publish data batch");
                            }
                        }
                        Err(err) => warn!(error = %err, "failed to serialize data batch"),
                    }
                }
            }
            event = event_loop.poll() => {
                match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        dispatch(&publish.payload, handle);
                    }
                    Ok(Event::Incoming(Incoming::PubAck(_))) | Ok(Event::Incoming(Incoming::PubComp(_))) => {
                        outbound_gate.record_ack();
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "broker event loop error");
                        return DisconnectCause::Dropped;
                    }
                }
            }
        }

        if gate.is_held_off() {
            return DisconnectCause::HeldOff;
        }
    }
}

fn dispatch(payload: &[u8], handle: &ReconcilerHandle) {
    match InboundMessage::parse(payload) {
        Some(InboundMessage::ThresholdUpdate { metric_uuid: Some(uuid) }) => handle.mark_metric_for_refresh(uuid),
        Some(InboundMessage::ThresholdUpdate { metric_uuid: None }) => handle.request_full_sync(),
        Some(InboundMessage::ConfigChanged) => handle.request_full_sync(),
        Some(InboundMessage::ConfigWillChange) => handle.mark_config_will_change(),
        Some(InboundMessage::Unknown { message_type }) => {
            warn!(message_type = %message_type, "unrecognized notification type");
        }
        None => {}
    }
}

/// Poll `gate.pending_count()` down to zero, giving up after `timeout`.
async fn drain_outbound_queue(gate: &Arc<OutboundGate>, timeout: std::time::Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while gate.pending_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

/// Wait up to `duration` for termination, returning `true` if it fired.
async fn wait_for(terminating: &mut watch::Receiver<bool>, duration: std::time::Duration) -> bool {
    tokio::select! {
        _ = terminating.changed() => *terminating.borrow(),
        _ = tokio::time::sleep(duration) => false,
    }
}
