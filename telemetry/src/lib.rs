//! Logging and metrics setup for the ReBAC engine
//!
//! The engine itself only emits `tracing` events and `metrics` measurements;
//! this crate installs the global subscriber and recorder that collect them.
//!
//! - **Logs**: `tracing-subscriber` with an `EnvFilter`, pretty or JSON
//! - **Metrics**: Prometheus recorder via `metrics-exporter-prometheus`
//!
//! # Example
//!
//! ```rust,no_run
//! use telemetry::{init_tracing, install_metrics_recorder, TelemetryConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_tracing(&TelemetryConfig::default())?;
//!     let prometheus = install_metrics_recorder()?;
//!     println!("{}", prometheus.render());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod metrics;

pub use crate::metrics::{install_metrics_recorder, render_metrics};
pub use error::{Result, TelemetryError};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or
    /// `rebac_engine=debug,info`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Install the Prometheus recorder.
    pub metrics: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            metrics: true,
        }
    }
}

impl TelemetryConfig {
    /// The effective filter: `RUST_LOG` wins over the configured level.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFilter` when the configured level does not parse.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|e| TelemetryError::InvalidFilter {
            filter: self.level.clone(),
            reason: e.to_string(),
        })
    }
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns `InvalidFilter` for a bad level and `TracingAlreadyInstalled`
/// when a global subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let env_filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if config.json {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .json(),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init()
    };
    installed.map_err(|_| TelemetryError::TracingAlreadyInstalled)?;

    tracing::info!(level = %config.level, json = config.json, "Tracing initialized");
    Ok(())
}

/// Install logging and, when enabled, metrics.
///
/// # Errors
///
/// See [`init_tracing`] and [`install_metrics_recorder`].
pub fn init(config: &TelemetryConfig) -> Result<()> {
    init_tracing(config)?;
    if config.metrics {
        install_metrics_recorder()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.json);
        assert!(config.metrics);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: TelemetryConfig = serde_json::from_str(r#"{"json": true}"#).unwrap();
        assert!(config.json);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_invalid_level_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = TelemetryConfig {
            level: "rebac_engine=loud".to_string(),
            ..TelemetryConfig::default()
        };
        assert!(matches!(
            config.env_filter(),
            Err(TelemetryError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_second_install_reports_conflict() {
        let config = TelemetryConfig::default();
        let _ = init_tracing(&config);
        assert!(matches!(
            init_tracing(&config),
            Err(TelemetryError::TracingAlreadyInstalled)
        ));
    }
}
