//! Tracing subscriber setup
//!
//! The filter comes from `RUST_LOG` when set, otherwise from
//! [`TelemetryConfig::filter`]. Metrics are emitted through the `metrics`
//! facade and stay no-ops until the host installs a recorder.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub filter: String,
    /// One JSON object per event instead of human-readable lines
    pub json: bool,
    pub with_target: bool,
    pub with_thread_ids: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
            with_target: true,
            with_thread_ids: false,
        }
    }
}

impl TelemetryConfig {
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Filter from `RUST_LOG`, falling back to the configured directives
    ///
    /// # Errors
    /// `Telemetry` if the configured directives do not parse
    pub fn env_filter(&self) -> CoreResult<EnvFilter> {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .map_err(|e| CoreError::Telemetry(e.to_string()))
    }
}

/// Install the global tracing subscriber
///
/// # Errors
/// `Telemetry` if the filter is invalid or a subscriber is already installed
pub fn init_tracing(config: &TelemetryConfig) -> CoreResult<()> {
    let filter = config.env_filter()?;

    let json = config.json.then(|| {
        fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_thread_ids(config.with_thread_ids)
            .with_span_events(fmt::format::FmtSpan::CLOSE)
    });
    let text = (!config.json).then(|| {
        fmt::layer()
            .with_target(config.with_target)
            .with_thread_ids(config.with_thread_ids)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .map_err(|e| CoreError::Telemetry(e.to_string()))?;

    tracing::debug!(json = config.json, "tracing initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_directives_are_reported() {
        let config = TelemetryConfig::default().with_filter("provenant=notalevel");
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(matches!(config.env_filter(), Err(CoreError::Telemetry(_))));
        }
    }

    #[test]
    fn second_init_fails() {
        let config = TelemetryConfig::default().with_filter("warn");
        // Another test may have installed a subscriber first
        let _ = init_tracing(&config);
        assert!(matches!(init_tracing(&config), Err(CoreError::Telemetry(_))));
    }
}
