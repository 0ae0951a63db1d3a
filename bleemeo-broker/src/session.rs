//! The persistent MQTT session itself.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use rumqttc::{AsyncClient, LastWill, MqttOptions, QoS, TlsConfiguration, Transport};
use serde::Deserialize;
use tracing::warn;

use bleemeo_core::{wall_time, ConnectorError, Result};

use crate::config::BrokerConfig;

/// Outbound publishes are capped per session at pending-plus-in-flight
/// count. `force=true` publishes (the connect/disconnect notices) are
/// never subject to the cap.
pub const MAX_OUTBOUND_PUBLISHES: u64 = 2_000;

const KEEP_ALIVE: Duration = Duration::from_secs(45);

/// A topic's well-known payload, parsed for the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ThresholdUpdate { metric_uuid: Option<String> },
    ConfigChanged,
    ConfigWillChange,
    Unknown { message_type: String },
}

#[derive(Deserialize)]
struct NotificationPayload {
    message_type: String,
    metric_uuid: Option<String>,
}

impl InboundMessage {
    /// Classify a publish on the `v1/agent/{uuid}/notification` topic by
    /// its `message_type` field.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        // Notification payloads are capped at 64 KiB on the wire; a larger one is almost certainly not well-formed JSON and
        // is not worth the allocation to find out.
        if payload.len() > 64 * 1024 {
            return None;
        }
        let decoded: NotificationPayload = serde_json::from_slice(payload).ok()?;
        match decoded.message_type.as_str() {
            "threshold-update" => Some(InboundMessage::ThresholdUpdate { metric_uuid: decoded.metric_uuid }),
            "config-changed" => Some(InboundMessage::ConfigChanged),
            "config-will-change" => Some(InboundMessage::ConfigWillChange),
            other => Some(InboundMessage::Unknown { message_type: other.to_string() }),
        }
    }
}

/// Tracks in-flight-plus-pending outbound publishes against the
/// [`MAX_OUTBOUND_PUBLISHES`] cap, and the wall-clock time of the agent's
/// last acknowledged report.
#[derive(Debug, Default)]
pub struct OutboundGate {
    pending: AtomicU64,
    last_report: AtomicU64,
}

impl OutboundGate {
    /// Reserve a publish slot. Returns `false` (caller must silently drop
    /// the message) when the cap is reached and `force` is not set.
    pub fn try_reserve(&self, force: bool) -> bool {
        if force {
            self.pending.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        loop {
            let current = self.pending.load(Ordering::SeqCst);
            if current >= MAX_OUTBOUND_PUBLISHES {
                return false;
            }
            if self
                .pending
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Called from the broker event loop when a publish is acknowledged.
    /// Must do no blocking work.
    pub fn record_ack(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        let now_bits = wall_time().to_bits();
        self.last_report.store(now_bits, Ordering::SeqCst);
    }

    pub fn pending_count(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<f64> {
        let bits = self.last_report.load(Ordering::SeqCst);
        if bits == 0 {
            None
        } else {
            Some(f64::from_bits(bits))
        }
    }
}

pub struct BrokerSession {
    client: AsyncClient,
    gate: Arc<OutboundGate>,
    topic_prefix: String,
}

impl BrokerSession {
    /// Build the session for `agent_uuid`. The last-will publishes a
    /// retained `disconnect` notice with cause `disconnect-will` on
    /// `v1/agent/{uuid}/disconnect`, so other observers see this agent go
    /// offline even on an unclean disconnect.
    pub fn connect(
        config: &BrokerConfig,
        agent_uuid: &str,
        install_dir: &str,
        event_capacity: usize,
    ) -> Result<(Self, rumqttc::EventLoop)> {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_credentials(config.username.clone(), config.password.clone());

        let topic_prefix = format!("v1/agent/{agent_uuid}");
        let will_topic = format!("{topic_prefix}/disconnect");
        let will_payload = serde_json::json!({"disconnect-cause": "disconnect-will"}).to_string();
        options.set_last_will(LastWill::new(will_topic, will_payload, QoS::AtLeastOnce, true));

        if config.ssl {
            if config.verify_tls {
                let ca_file = config
                    .resolved_ca_file(install_dir)
                    .ok_or_else(|| ConnectorError::Invariant("SSL enabled but no CA file configured".to_string()))?;
                let ca = std::fs::read(&ca_file)
                    .map_err(|err| ConnectorError::Invariant(format!("reading CA file {}: {err}", ca_file.display())))?;
                options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: None,
                }));
            } else {
                warn!("broker TLS certificate validation disabled; only safe for on-prem/test deployments");
                options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(insecure_tls_config()))));
            }
        }

        let (client, event_loop) = AsyncClient::new(options, event_capacity);
        let session = Self {
            client,
            gate: Arc::new(OutboundGate::default()),
            topic_prefix,
        };
        Ok((session, event_loop))
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    pub fn outbound_gate(&self) -> Arc<OutboundGate> {
        Arc::clone(&self.gate)
    }

    /// `v1/agent/{uuid}/connect` with the agent's current public IP,
    /// published immediately after a successful connection. Always
    /// forced — connect/disconnect notices bypass the outbound cap.
    pub async fn publish_connect(&self, public_ip: &str) -> Result<()> {
        let topic = format!("{}/connect", self.topic_prefix);
        let payload = serde_json::json!({"public_ip": public_ip}).to_string().into_bytes();
        self.publish_raw(&topic, QoS::AtLeastOnce, false, payload, true).await
    }

    /// `v1/agent/{uuid}/disconnect`, retained, with an explicit cause
    /// (`"Upgrade"` or `"Clean shutdown"` on graceful termination).
    /// Always forced.
    pub async fn publish_disconnect(&self, cause: &str) -> Result<()> {
        let topic = format!("{}/disconnect", self.topic_prefix);
        let payload = serde_json::json!({"disconnect-cause": cause}).to_string().into_bytes();
        self.publish_raw(&topic, QoS::AtLeastOnce, true, payload, true).await
    }

    /// `v1/agent/{uuid}/data`: a JSON array of rendered metric messages,
    /// subject to the outbound cap (not forced).
    pub async fn publish_data(&self, payload_json: Vec<u8>) -> Result<bool> {
        let topic = format!("{}/data", self.topic_prefix);
        self.publish_gated(&topic, QoS::AtLeastOnce, false, payload_json).await
    }

    /// `v1/agent/{uuid}/top_info`: zlib-compressed JSON host snapshot,
    /// subject to the outbound cap.
    pub async fn publish_top_info(&self, json: &[u8]) -> Result<bool> {
        let topic = format!("{}/top_info", self.topic_prefix);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(json)
            .map_err(|err| ConnectorError::Invariant(format!("zlib compression: {err}")))?;
        let compressed = encoder
            .finish()
            .map_err(|err| ConnectorError::Invariant(format!("zlib compression: {err}")))?;
        self.publish_gated(&topic, QoS::AtLeastOnce, false, compressed).await
    }

    pub async fn subscribe_notifications(&self) -> Result<()> {
        let topic = format!("{}/notification", self.topic_prefix);
        self.client.subscribe(topic, QoS::AtLeastOnce).await.map_err(|err| ConnectorError::Transport(err.to_string()))
    }

    /// Publish subject to the outbound-cap gate: returns `Ok(false)`
    /// without sending anything when the cap is reached.
    async fn publish_gated(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<bool> {
        if !self.gate.try_reserve(false) {
            return Ok(false);
        }
        match self.publish_raw(topic, qos, retain, payload, false).await {
            Ok(()) => Ok(true),
            Err(err) => {
                // The publish never reached the wire; release the slot we
                // reserved so it isn't leaked.
                self.gate.record_ack();
                Err(err)
            }
        }
    }

    async fn publish_raw(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>, force: bool) -> Result<()> {
        if force {
            self.gate.try_reserve(true);
        }
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|err| ConnectorError::Transport(err.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

/// A `rustls` client config that accepts any server certificate, for the
/// broker's optional insecure TLS mode. Never used unless the operator sets
/// `verify_tls = false` explicitly.
fn insecure_tls_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        .with_no_client_auth()
}

struct NoCertificateVerification;

impl rustls::client::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_update_decodes_metric_uuid() {
        let payload = br#"{"message_type": "threshold-update", "metric_uuid": "11111111-1111-1111-1111-111111111111"}"#;
        let parsed = InboundMessage::parse(payload);
        assert_eq!(
            parsed,
            Some(InboundMessage::ThresholdUpdate { metric_uuid: Some("11111111-1111-1111-1111-111111111111".to_string()) })
        );
    }

    #[test]
    fn threshold_update_without_metric_requests_full_sync() {
        let payload = br#"{"message_type": "threshold-update"}"#;
        assert_eq!(InboundMessage::parse(payload), Some(InboundMessage::ThresholdUpdate { metric_uuid: None }));
    }

    #[test]
    fn config_topics_need_no_payload_fields() {
        assert_eq!(
            InboundMessage::parse(br#"{"message_type": "config-changed"}"#),
            Some(InboundMessage::ConfigChanged)
        );
        assert_eq!(
            InboundMessage::parse(br#"{"message_type": "config-will-change"}"#),
            Some(InboundMessage::ConfigWillChange)
        );
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let huge = vec![b'a'; 70 * 1024];
        assert_eq!(InboundMessage::parse(&huge), None);
    }

    #[tokio::test]
    async fn outbound_gate_drops_beyond_cap_unless_forced() {
        let gate = OutboundGate::default();
        for _ in 0..MAX_OUTBOUND_PUBLISHES {
            assert!(gate.try_reserve(false));
        }
        assert!(!gate.try_reserve(false), "cap reached, non-forced reservation must fail");
        assert!(gate.try_reserve(true), "forced reservation always succeeds");
    }

    #[tokio::test]
    async fn ack_advances_last_report_and_frees_a_slot() {
        let gate = OutboundGate::default();
        assert!(gate.try_reserve(false));
        assert_eq!(gate.pending_count(), 1);
        assert!(gate.last_report().is_none());
        gate.record_ack();
        assert_eq!(gate.pending_count(), 0);
        assert!(gate.last_report().is_some());
    }
}
