//! Persistent MQTT session to the Bleemeo broker.
//!
//! Wraps `rumqttc` with the will-message, TLS and outbound-cap behavior
//! the connector needs, plus a reconnection backoff policy tuned to avoid
//! hammering the broker during sustained flapping.

pub mod config;
pub mod diagnostics;
pub mod reconnect;
pub mod session;

pub use config::BrokerConfig;
pub use diagnostics::{DiagnosticGate, DiagnosticStep};
pub use reconnect::ReconnectPolicy;
pub use session::{BrokerSession, InboundMessage, OutboundGate, MAX_OUTBOUND_PUBLISHES};
