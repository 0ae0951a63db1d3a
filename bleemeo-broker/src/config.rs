//! Broker connection configuration.

use std::path::PathBuf;

/// Connection parameters for the MQTT broker, resolved from agent
/// configuration. `ca_file` may reference `$INSTDIR`, expanded against
/// the connector's install directory (a Windows-agent compatibility knob).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub ca_file: Option<String>,
    pub ssl: bool,
    /// When `false` with `ssl` enabled, the broker's certificate chain is
    /// never validated. Only meant for on-prem/test deployments pointing at
    /// a self-signed broker.
    pub verify_tls: bool,
}

impl BrokerConfig {
    /// Expand a literal `$INSTDIR` prefix in `ca_file` against
    /// `install_dir`, returning the resolved path (or the path unchanged
    /// if there's nothing to expand).
    pub fn resolved_ca_file(&self, install_dir: &str) -> Option<PathBuf> {
        let ca_file = self.ca_file.as_ref()?;
        if let Some(rest) = ca_file.strip_prefix("$INSTDIR") {
            Some(PathBuf::from(install_dir).join(rest.trim_start_matches(['/', '\\'])))
        } else {
            Some(PathBuf::from(ca_file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ca_file: Option<&str>) -> BrokerConfig {
        BrokerConfig {
            host: "mqtt.bleemeo.com".to_string(),
            port: 8883,
            client_id: "agent-1".to_string(),
            username: "agent-1@bleemeo.com".to_string(),
            password: "secret".to_string(),
            ca_file: ca_file.map(str::to_string),
            ssl: true,
            verify_tls: true,
        }
    }

    #[test]
    fn instdir_prefix_expands_against_install_dir() {
        let cfg = config(Some("$INSTDIR/cacert.pem"));
        assert_eq!(cfg.resolved_ca_file("C:/Program Files/Bleemeo"), Some(PathBuf::from("C:/Program Files/Bleemeo/cacert.pem")));
    }

    #[test]
    fn absolute_path_passes_through_unchanged() {
        let cfg = config(Some("/etc/ssl/certs/ca-certificates.crt"));
        assert_eq!(cfg.resolved_ca_file("/opt/bleemeo"), Some(PathBuf::from("/etc/ssl/certs/ca-certificates.crt")));
    }

    #[test]
    fn no_ca_file_configured() {
        let cfg = config(None);
        assert_eq!(cfg.resolved_ca_file("/opt/bleemeo"), None);
    }
}
