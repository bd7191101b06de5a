use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Tracing subscriber already installed")]
    TracingAlreadyInstalled,

    #[error("Metrics recorder installation failed: {0}")]
    MetricsRecorder(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
