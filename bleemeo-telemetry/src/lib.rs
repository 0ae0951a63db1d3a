//! Logging initialization for the connector binary.
//!
//! Ships a single backend: an `EnvFilter`-gated console layer. No OTLP or
//! remote span-exporter plumbing — the connector has nothing to export to.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// What to log and how verbosely.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Default level when `RUST_LOG` is unset, e.g. `"info"`.
    pub default_level: Option<String>,
    /// Extra `target=level` directives layered on top of the default.
    pub log_directives: Vec<String>,
    /// Emit machine-readable JSON lines instead of the human-readable
    /// format; set from `--log-format json`.
    pub json: bool,
}

impl TelemetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.default_level = Some(level.into());
        self
    }

    pub fn with_log_directive(mut self, directive: impl Into<String>) -> Self {
        self.log_directives.push(directive.into());
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    /// `RUST_LOG` and `BLEEMEO_LOG_FORMAT` are read directly by `EnvFilter`
    /// and this function respectively; everything else comes from the CLI.
    pub fn from_env() -> Self {
        let json = std::env::var("BLEEMEO_LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
        Self { default_level: None, log_directives: Vec::new(), json }
    }
}

/// Install the global `tracing` subscriber. Idempotent: later calls after
/// the first in a process are no-ops.
pub fn init(config: TelemetryConfig) {
    INIT.call_once(|| {
        let mut filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(config.default_level.as_deref().unwrap_or("info")))
            .expect("invalid default log filter");

        for directive in &config.log_directives {
            filter = filter.add_directive(directive.parse().expect("invalid log directive"));
        }

        let registry = tracing_subscriber::registry().with(filter);

        if config.json {
            registry.with(fmt::layer().json().with_target(true)).init();
        } else {
            registry.with(fmt::layer().with_target(true)).init();
        }

        tracing::info!(log.level = config.default_level.as_deref().unwrap_or("env"), "logging initialized");
    });
}

/// Convenience entry point for the common case: default level only.
pub fn init_with_level(level: &str) {
    init(TelemetryConfig::new().with_log_level(level));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder_accumulates_directives() {
        let config = TelemetryConfig::new().with_log_level("debug").with_log_directive("bleemeo_broker=trace");
        assert_eq!(config.default_level.as_deref(), Some("debug"));
        assert_eq!(config.log_directives, vec!["bleemeo_broker=trace".to_string()]);
    }

    #[test]
    fn init_does_not_panic_when_called_twice() {
        init_with_level("error");
        init_with_level("error");
    }
}
