use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Evaluation limits for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Recursion budget of one top-level request.
    pub max_depth: u32,
    /// Concurrent children per combinator node.
    pub fan_out_limit: usize,
    /// Concurrent store queries across all requests of the engine.
    pub max_concurrent_queries: usize,
    /// Results buffered ahead of a slow lookup consumer.
    pub lookup_buffer: usize,
    /// Deadline applied to every request when set.
    pub request_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            fan_out_limit: default_fan_out_limit(),
            max_concurrent_queries: default_max_concurrent_queries(),
            lookup_buffer: default_lookup_buffer(),
            request_timeout_ms: None,
        }
    }
}

fn default_max_depth() -> u32 {
    50
}

fn default_fan_out_limit() -> usize {
    16
}

fn default_max_concurrent_queries() -> usize {
    128
}

fn default_lookup_buffer() -> usize {
    64
}

impl EngineConfig {
    /// # Errors
    ///
    /// Returns `InvalidConfig` when a limit is zero.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("max_depth", self.max_depth == 0),
            ("fan_out_limit", self.fan_out_limit == 0),
            ("max_concurrent_queries", self.max_concurrent_queries == 0),
            ("lookup_buffer", self.lookup_buffer == 0),
            ("request_timeout_ms", self.request_timeout_ms == Some(0)),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(EngineError::InvalidConfig(format!(
                "`{name}` must be greater than zero"
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}
