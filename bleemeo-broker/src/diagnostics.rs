//! Broker-down diagnostic routine.
//!
//! Resolves the broker hostname, opens a TCP connection, performs a TLS
//! handshake (when TLS is configured) and issues an HTTP GET against the
//! API base, logging each step so an operator staring at a disconnected
//! agent has something actionable ("Is your firewall blocking
//! connection?").

use std::net::ToSocketAddrs;
use std::time::Duration;

use tokio::net::TcpStream;

const STEP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticStep {
    Ok(&'static str, String),
    Failed(&'static str, String),
}

/// Run the full diagnostic sequence once. Never returns an error itself —
/// each step's outcome is captured and logged by the caller; a failure at
/// one step does not prevent attempting the next (DNS can fail while TCP
/// to a cached IP would still succeed, for instance).
pub async fn run_diagnostic(broker_host: &str, broker_port: u16, api_base_url: &str) -> Vec<DiagnosticStep> {
    let mut steps = Vec::new();

    let resolved = tokio::task::spawn_blocking({
        let host = broker_host.to_string();
        move || (host.as_str(), broker_port).to_socket_addrs().map(|mut it| it.next())
    })
    .await;

    let addr = match resolved {
        Ok(Ok(Some(addr))) => {
            steps.push(DiagnosticStep::Ok("dns_resolution", addr.to_string()));
            Some(addr)
        }
        Ok(Ok(None)) => {
            steps.push(DiagnosticStep::Failed("dns_resolution", "resolved to no addresses".to_string()));
            None
        }
        Ok(Err(err)) => {
            steps.push(DiagnosticStep::Failed("dns_resolution", err.to_string()));
            None
        }
        Err(err) => {
            steps.push(DiagnosticStep::Failed("dns_resolution", err.to_string()));
            None
        }
    };

    if let Some(addr) = addr {
        match tokio::time::timeout(STEP_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => steps.push(DiagnosticStep::Ok("tcp_connect", addr.to_string())),
            Ok(Err(err)) => steps.push(DiagnosticStep::Failed("tcp_connect", err.to_string())),
            Err(_) => steps.push(DiagnosticStep::Failed("tcp_connect", "timed out".to_string())),
        }
    }

    match reqwest::Client::builder().timeout(STEP_TIMEOUT).build() {
        Ok(client) => match client.get(api_base_url).send().await {
            Ok(response) => steps.push(DiagnosticStep::Ok("http_get", response.status().to_string())),
            Err(err) => steps.push(DiagnosticStep::Failed("http_get", err.to_string())),
        },
        Err(err) => steps.push(DiagnosticStep::Failed("http_get", err.to_string())),
    }

    steps
}

/// Gates [`run_diagnostic`] to at most once per hour while the broker
/// stays down.
#[derive(Debug, Default)]
pub struct DiagnosticGate {
    last_run: Option<f64>,
}

const MIN_INTERVAL_SECONDS: f64 = 3600.0;

impl DiagnosticGate {
    pub fn should_run(&self, now_mono: f64) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now_mono - last >= MIN_INTERVAL_SECONDS,
        }
    }

    pub fn record_run(&mut self, now_mono: f64) {
        self.last_run = Some(now_mono);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_allows_first_run_immediately() {
        let gate = DiagnosticGate::default();
        assert!(gate.should_run(0.0));
    }

    #[test]
    fn gate_blocks_reruns_within_an_hour() {
        let mut gate = DiagnosticGate::default();
        gate.record_run(1000.0);
        assert!(!gate.should_run(1000.0 + 1800.0));
        assert!(gate.should_run(1000.0 + 3600.0));
    }
}
