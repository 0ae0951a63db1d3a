//! Typed configuration value for the binary.
//!
//! Loading from a file is the only behavior in scope here: the full
//! agent-wide configuration file format, with its dozens of collector
//! toggles, belongs to an excluded collaborator. This struct is the
//! narrow slice `bleemeo-connector` itself needs to construct the cache,
//! API client, broker session and reconciler.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use bleemeo_core::{ConnectorError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    pub account_id: String,
    pub registration_key: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default)]
    pub fqdn: String,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_true")]
    pub verify_tls: bool,

    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_true")]
    pub broker_ssl: bool,
    #[serde(default)]
    pub broker_ca_file: Option<String>,
    /// When `false`, the broker's certificate chain is never validated.
    /// Only meant for on-prem/test deployments pointing at a self-signed
    /// broker.
    #[serde(default = "default_true")]
    pub broker_verify_tls: bool,
    #[serde(default = "default_install_dir")]
    pub install_dir: String,

    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Presence of this file marks an in-progress agent upgrade; the
    /// broker reports it as the disconnect cause instead of a plain
    /// clean shutdown.
    #[serde(default = "default_upgrade_file")]
    pub upgrade_file: PathBuf,

    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_format_json: bool,
}

fn default_display_name() -> String {
    "bleemeo-connector".to_string()
}
fn default_api_base_url() -> String {
    "https://api.bleemeo.com".to_string()
}
fn default_broker_port() -> u16 {
    8883
}
fn default_install_dir() -> String {
    "/etc/bleemeo".to_string()
}
fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/bleemeo/state.json")
}
fn default_upgrade_file() -> PathBuf {
    PathBuf::from("/var/lib/bleemeo/upgrade")
}
fn default_true() -> bool {
    true
}

impl ConnectorConfig {
    /// Parse a TOML configuration file and validate the fields that have
    /// no sane default.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConnectorError::Invariant(format!("reading config {}: {err}", path.display())))?;
        let config: ConnectorConfig = toml::from_str(&contents)
            .map_err(|err| ConnectorError::Invariant(format!("parsing config {}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() {
            return Err(ConnectorError::Invariant("account_id must not be empty".to_string()));
        }
        if self.registration_key.trim().is_empty() {
            return Err(ConnectorError::Invariant("registration_key must not be empty".to_string()));
        }
        if self.broker_host.trim().is_empty() {
            return Err(ConnectorError::Invariant("broker_host must not be empty".to_string()));
        }
        Ok(())
    }

    /// Override the configured state file's directory, implementing
    /// `--state-dir` without touching the file name.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let file_name = self.state_file.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("state.json"));
        self.state_file = dir.into().join(file_name);
        self
    }
}
