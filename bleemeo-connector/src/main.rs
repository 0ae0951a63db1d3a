//! Entry point: loads configuration, registers the agent if needed, then
//! starts the broker session, reconciler and emission-path tasks and waits
//! for a shutdown signal.
//!
//! A minimal `clap` `Parser` exposing `--config`/`--state-dir`, no
//! subcommands — the full agent CLI is out of scope here.

mod broker_task;
mod config;
mod provider;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rand::Rng;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};

use bleemeo_api::ApiClient;
use bleemeo_broker::BrokerConfig;
use bleemeo_cache::{JsonFileStateStore, ObjectCache, StateStore};
use bleemeo_core::{AgentIdentity, Clock, ConnectorError, Result, SystemClock};
use bleemeo_emission::Emitter;
use bleemeo_reconciler::{BrokerControl, ReconcilerConfig, ReconcilerLoop};

use crate::broker_task::BrokerControlGate;
use crate::config::ConnectorConfig;
use crate::provider::StaticStateProvider;

/// Monitoring agent connector: reconciles local state against the
/// Bleemeo API and streams metric points over a persistent MQTT session.
#[derive(Parser, Debug)]
#[command(name = "bleemeo-connector", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Override the configured state file's directory.
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

const AGENT_IDENTITY_KEY: &str = "agent_identity";

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let config = match ConnectorConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };
    let config = match cli.state_dir {
        Some(dir) => config.with_state_dir(dir),
        None => config,
    };

    bleemeo_telemetry::init(
        bleemeo_telemetry::TelemetryConfig::from_env()
            .with_log_level(config.log_level.as_deref().unwrap_or("info")),
    );

    match run(config).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "connector exited with an error");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(config: ConnectorConfig) -> Result<()> {
    if let Some(parent) = config.state_file.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| ConnectorError::Invariant(format!("creating state directory: {err}")))?;
    }
    let mut store = JsonFileStateStore::open(&config.state_file)
        .map_err(|err| ConnectorError::Invariant(format!("opening state file: {err}")))?;
    let cache = Arc::new(ObjectCache::load(&mut store));

    let mut identity = load_identity(&store, &config);
    let api = Arc::new(ApiClient::with_tls_verification(config.api_base_url.clone(), config.verify_tls)?);

    if !identity.is_registered() {
        register_with_retry(&api, &mut identity, &config).await?;
        store.set_raw(AGENT_IDENTITY_KEY, serde_json::to_value(&identity).expect("AgentIdentity always serializes"));
        store
            .persist()
            .map_err(|err| ConnectorError::Invariant(format!("persisting agent identity: {err}")))?;
    }

    let agent_uuid = identity.agent_uuid.clone().expect("registration guarantees agent_uuid");
    let agent_username = identity.agent_username().expect("registration guarantees agent_uuid");
    let agent_password = identity.password.clone().expect("registration guarantees password");

    let state_store: Box<dyn StateStore> = Box::new(store);
    let identity_lock = Arc::new(RwLock::new(identity));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let emitter = Arc::new(Emitter::new(cache.clone()));
    let broker_gate = Arc::new(BrokerControlGate::default());
    let provider = Arc::new(StaticStateProvider::new(config.fqdn.clone()));

    let (terminating_tx, terminating_rx) = watch::channel(false);

    let reconciler_config = ReconcilerConfig {
        account_id: config.account_id.clone(),
        display_name: config.display_name.clone(),
        fqdn: config.fqdn.clone(),
    };
    let (reconciler, reconciler_handle) = ReconcilerLoop::new(
        api.clone(),
        cache.clone(),
        emitter.clone(),
        broker_gate.clone() as Arc<dyn BrokerControl>,
        provider,
        identity_lock,
        state_store,
        clock.clone(),
        reconciler_config,
        terminating_rx.clone(),
    );

    let broker_config = BrokerConfig {
        host: config.broker_host.clone(),
        port: config.broker_port,
        client_id: agent_uuid.clone(),
        username: agent_username,
        password: agent_password,
        ca_file: config.broker_ca_file.clone(),
        ssl: config.broker_ssl,
        verify_tls: config.broker_verify_tls,
    };

    let broker_handle = tokio::spawn(broker_task::run(
        broker_config,
        agent_uuid,
        config.install_dir.clone(),
        config.api_base_url.clone(),
        config.upgrade_file.clone(),
        broker_gate,
        reconciler_handle,
        emitter,
        clock,
        terminating_rx,
    ));
    let reconciler_handle_task = tokio::spawn(reconciler.run());

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, terminating");
    let _ = terminating_tx.send(true);

    let _ = tokio::join!(broker_handle, reconciler_handle_task);
    Ok(())
}

fn load_identity(store: &dyn StateStore, config: &ConnectorConfig) -> AgentIdentity {
    store
        .get_raw(AGENT_IDENTITY_KEY)
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_else(|| AgentIdentity::new(config.account_id.clone(), config.registration_key.clone()))
}

/// Retry the initial `POST v1/agent/` with exponential backoff
/// (10, 20, 40, ... capped at 600s) until it succeeds.
async fn register_with_retry(api: &ApiClient, identity: &mut AgentIdentity, config: &ConnectorConfig) -> Result<()> {
    let initial_password: String =
        rand::thread_rng().sample_iter(&rand::distributions::Alphanumeric).take(32).map(char::from).collect();

    let mut attempt: u32 = 0;
    loop {
        match api.register_agent(identity, &initial_password, &config.display_name, &config.fqdn).await {
            Ok(response) => {
                let agent_uuid = response
                    .get("id")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| ConnectorError::Invariant("registration response missing id".to_string()))?;
                identity.agent_uuid = Some(agent_uuid.to_string());
                identity.password = Some(initial_password);
                info!(agent_uuid, "agent registered");
                return Ok(());
            }
            Err(err) if err.is_auth() => return Err(err),
            Err(err) => {
                let delay = bleemeo_reconciler::backoff::registration_retry_delay(attempt);
                attempt += 1;
                error!(error = %err, attempt, delay, "agent registration failed, retrying");
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
