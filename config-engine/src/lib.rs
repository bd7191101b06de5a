//! Layered configuration for the ReBAC engine
//!
//! Settings are merged from, lowest precedence first:
//! - built-in defaults
//! - an optional YAML or TOML file
//! - `REBAC_` environment variables, with `__` separating nested keys
//!
//! ```yaml
//! engine:
//!   max_depth: 32
//!   fan_out_limit: 8
//!   request_timeout_ms: 500
//! telemetry:
//!   level: "rebac_engine=debug,info"
//!   json: true
//! ```
//!
//! The same values from the environment:
//! - `REBAC_ENGINE__MAX_DEPTH=32`
//! - `REBAC_ENGINE__REQUEST_TIMEOUT_MS=500`
//! - `REBAC_TELEMETRY__JSON=true`

pub mod error;

pub use error::{ConfigError, Result};

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use rebac_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use telemetry::TelemetryConfig;

pub const ENV_PREFIX: &str = "REBAC_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub telemetry: TelemetryConfig,
}

impl Settings {
    /// # Errors
    ///
    /// Returns `Validation` when an engine limit is out of range.
    pub fn validate(&self) -> Result<()> {
        self.engine
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }
}

/// The provider stack behind [`load`], exposed for callers that merge
/// further sources on top.
///
/// # Errors
///
/// Returns `NotFound` or `UnsupportedFormat` for a bad file path.
pub fn figment(path: Option<&Path>) -> Result<Figment> {
    let mut figment = Figment::from(Serialized::defaults(Settings::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        figment = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
            Some("toml") => figment.merge(Toml::file(path)),
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
    }

    Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

/// Load and validate settings.
///
/// # Errors
///
/// Fails when the file is missing or malformed, a value has the wrong type,
/// or a limit is out of range.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let settings: Settings = figment(path)?.extract()?;
    settings.validate()?;

    tracing::info!(
        source = ?path,
        max_depth = settings.engine.max_depth,
        fan_out_limit = settings.engine.fan_out_limit,
        "Configuration loaded"
    );
    Ok(settings)
}
