//! State shared by every sub-evaluation of one top-level request.

use crate::{
    cache::RequestCache,
    config::EngineConfig,
    context::OverlayReader,
    error::{EngineError, Result},
    models::{CheckMetadata, Tuple, TupleFilter},
    schema::Schema,
    snapshot::SnapshotToken,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct RequestScope {
    pub(crate) schema: Arc<Schema>,
    reader: OverlayReader,
    snapshot: SnapshotToken,
    pub(crate) cache: RequestCache,
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
    max_depth: u32,
    fan_out_limit: usize,
    dispatches: AtomicU64,
    queries: AtomicU64,
}

impl RequestScope {
    pub(crate) fn new(
        schema: Arc<Schema>,
        reader: OverlayReader,
        snapshot: SnapshotToken,
        limiter: Arc<Semaphore>,
        cancel: CancellationToken,
        config: &EngineConfig,
    ) -> Self {
        Self {
            schema,
            reader,
            snapshot,
            cache: RequestCache::new(),
            limiter,
            cancel,
            max_depth: config.max_depth,
            fan_out_limit: config.fan_out_limit,
            dispatches: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> SnapshotToken {
        self.snapshot
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn fan_out_limit(&self) -> usize {
        self.fan_out_limit
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metadata(&self) -> CheckMetadata {
        CheckMetadata {
            dispatch_count: self.dispatches.load(Ordering::Relaxed),
            cache_hits: self.cache.hits(),
            store_queries: self.queries.load(Ordering::Relaxed),
        }
    }

    /// Read tuples at the pinned snapshot through the engine-wide worker
    /// pool. Races the request's cancellation signal.
    pub async fn query(&self, filter: &TupleFilter) -> Result<Vec<Tuple>> {
        self.ensure_active()?;

        let _permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = self.limiter.acquire() => permit.map_err(|_| {
                EngineError::Internal(anyhow::anyhow!("store worker pool closed"))
            })?,
        };

        self.queries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rebac_store_queries_total").increment(1);

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(EngineError::Cancelled),
            result = self.reader.query(filter, &self.snapshot) => result.map_err(|e| {
                if matches!(e, EngineError::StoreUnavailable(_) | EngineError::StoreError(_)) {
                    warn!(error = %e, snapshot = %self.snapshot, "Relationship store query failed");
                }
                e
            }),
        }
    }
}
