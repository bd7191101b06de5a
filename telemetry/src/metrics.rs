//! Prometheus recorder and the engine's metric catalogue.

use crate::error::{Result, TelemetryError};
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub const REQUESTS_TOTAL: &str = "rebac_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "rebac_request_duration_seconds";
pub const STORE_QUERIES_TOTAL: &str = "rebac_store_queries_total";
pub const CACHE_HITS_TOTAL: &str = "rebac_cache_hits_total";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Safe to call more than once; later calls reuse the installed handle.
///
/// # Errors
///
/// Returns `MetricsRecorder` when another recorder is already installed.
pub fn install_metrics_recorder() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::MetricsRecorder(e.to_string()))?;
    describe_metrics();

    let handle = PROMETHEUS_HANDLE.get_or_init(|| handle);
    tracing::info!("Metrics recorder installed");
    Ok(handle.clone())
}

/// Current metrics in Prometheus text format, if a recorder is installed.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

fn describe_metrics() {
    describe_counter!(
        REQUESTS_TOTAL,
        Unit::Count,
        "Engine requests by operation and outcome"
    );
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Engine request latency by operation"
    );
    describe_counter!(
        STORE_QUERIES_TOTAL,
        Unit::Count,
        "Relationship store queries issued"
    );
    describe_counter!(
        CACHE_HITS_TOTAL,
        Unit::Count,
        "Sub-evaluations answered from the request cache"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_renders_engine_metrics() {
        let handle = install_metrics_recorder().unwrap();
        metrics::counter!(STORE_QUERIES_TOTAL).increment(3);

        let rendered = handle.render();
        assert!(rendered.contains(STORE_QUERIES_TOTAL));
        assert!(render_metrics().is_some());

        // A second install hands back the same recorder.
        assert!(install_metrics_recorder().is_ok());
    }
}
