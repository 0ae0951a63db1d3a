//! Explicit, owned identity of the running agent.
//!
//! Credentials and account identity are collected into a single value
//! owned by the connector and passed by reference to every component,
//! rather than threaded through as loose strings or read back from a
//! global.

use serde::{Deserialize, Serialize};

/// Credentials and account identity for one running agent process.
///
/// `agent_uuid`/`password` are `None` until the initial registration
/// (`POST v1/agent/`) succeeds; every other field is known from
/// configuration up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub account_id: String,
    pub registration_key: String,
    pub agent_uuid: Option<String>,
    pub password: Option<String>,
}

impl AgentIdentity {
    pub fn new(account_id: impl Into<String>, registration_key: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            registration_key: registration_key.into(),
            agent_uuid: None,
            password: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.agent_uuid.is_some() && self.password.is_some()
    }

    /// MQTT/JWT username derived from the agent UUID, e.g.
    /// `03d9c...@bleemeo.com`.
    pub fn agent_username(&self) -> Option<String> {
        self.agent_uuid.as_ref().map(|uuid| format!("{uuid}@bleemeo.com"))
    }
}
