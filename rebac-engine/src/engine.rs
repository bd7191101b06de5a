use crate::{
    check::CheckEngine,
    config::EngineConfig,
    context::{ContextualTuples, OverlayReader},
    error::{EngineError, Result},
    expand::{ExpandEngine, UsersetTree},
    graph::ReverseIndex,
    lookup::{paginate, LookupStream},
    lookup_entity::LookupEntityEngine,
    lookup_subject::LookupSubjectEngine,
    models::*,
    repository::RelationshipReader,
    schema::Schema,
    scope::RequestScope,
    snapshot::{SnapshotToken, SnapshotTokenService},
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Relationship-based permission engine
///
/// Holds the read-only schema and the store handles shared by every request.
/// Each call gets its own [`RequestScope`] pinned to one snapshot, so
/// concurrent requests never share cached results or contextual tuples.
pub struct Engine {
    /// Authorization model, shared by all requests without locking
    schema: Arc<Schema>,

    /// Reverse edges of the schema, used by entity lookups
    reverse_index: Arc<ReverseIndex>,

    /// Relationship store reads
    reader: Arc<dyn RelationshipReader>,

    /// Issues and validates snapshot tokens
    tokens: Arc<dyn SnapshotTokenService>,

    /// Caps concurrent store queries across all requests
    limiter: Arc<Semaphore>,

    config: EngineConfig,
}

impl Engine {
    /// Create an engine over a validated schema with the default limits.
    pub fn new(
        schema: Schema,
        reader: Arc<dyn RelationshipReader>,
        tokens: Arc<dyn SnapshotTokenService>,
    ) -> Self {
        let config = EngineConfig::default();
        let reverse_index = Arc::new(ReverseIndex::build(&schema));
        info!(
            entity_types = schema.entity_types().count(),
            "Permission engine initialised"
        );

        Self {
            schema: Arc::new(schema),
            reverse_index,
            reader,
            tokens,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_queries)),
            config,
        }
    }

    /// Create an engine over a store that also issues snapshot tokens,
    /// such as [`MemoryRelationshipStore`](crate::MemoryRelationshipStore).
    pub fn with_store<S>(schema: Schema, store: Arc<S>) -> Self
    where
        S: RelationshipReader + SnapshotTokenService + 'static,
    {
        Self::new(schema, store.clone(), store)
    }

    /// Replace the evaluation limits.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when a limit is zero.
    pub fn with_config(mut self, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        self.limiter = Arc::new(Semaphore::new(config.max_concurrent_queries));
        self.config = config;
        Ok(self)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =============================================================================
    // Check
    // =============================================================================

    /// Decide whether the subject holds the permission or relation on the
    /// entity.
    pub async fn check(&self, request: CheckRequest) -> Result<CheckResponse> {
        self.check_cancellable(request, CancellationToken::new()).await
    }

    #[instrument(
        name = "check",
        skip_all,
        fields(entity = %request.entity, permission = %request.permission, subject = %request.subject)
    )]
    pub async fn check_cancellable(
        &self,
        request: CheckRequest,
        cancel: CancellationToken,
    ) -> Result<CheckResponse> {
        let started = Instant::now();
        let cancel = cancel.child_token();
        let result = self
            .guarded(&cancel, async {
                let scope = self
                    .open_scope(request.snapshot, request.contextual_tuples, cancel.clone())
                    .await?;
                let decision = CheckEngine::new(&scope)
                    .run(request.entity, &request.permission, request.subject)
                    .await?;
                Ok(CheckResponse {
                    decision,
                    snapshot: scope.snapshot(),
                    metadata: scope.metadata(),
                })
            })
            .await;

        if let Ok(response) = &result {
            debug!(
                decision = %response.decision,
                dispatches = response.metadata.dispatch_count,
                queries = response.metadata.store_queries,
                "Check complete"
            );
        }
        record("check", started, &result);
        result
    }

    // =============================================================================
    // Expand
    // =============================================================================

    /// Materialise the userset tree behind a permission or relation.
    pub async fn expand(&self, request: ExpandRequest) -> Result<UsersetTree> {
        self.expand_cancellable(request, CancellationToken::new()).await
    }

    #[instrument(
        name = "expand",
        skip_all,
        fields(entity = %request.entity, permission = %request.permission)
    )]
    pub async fn expand_cancellable(
        &self,
        request: ExpandRequest,
        cancel: CancellationToken,
    ) -> Result<UsersetTree> {
        let started = Instant::now();
        let cancel = cancel.child_token();
        let result = self
            .guarded(&cancel, async {
                let scope = self
                    .open_scope(request.snapshot, request.contextual_tuples, cancel.clone())
                    .await?;
                ExpandEngine::new(&scope)
                    .run(request.entity, &request.permission)
                    .await
            })
            .await;

        record("expand", started, &result);
        result
    }

    // =============================================================================
    // Lookups
    // =============================================================================

    /// Stream the ids of entities of `entity_type` on which the subject holds
    /// the permission.
    ///
    /// # Errors
    ///
    /// Fails up front when the snapshot or contextual tuples are invalid;
    /// evaluation errors arrive through the stream.
    pub async fn lookup_entity(&self, request: LookupEntityRequest) -> Result<LookupStream> {
        self.lookup_entity_cancellable(request, CancellationToken::new())
            .await
    }

    #[instrument(
        name = "lookup_entity",
        skip_all,
        fields(entity_type = %request.entity_type, permission = %request.permission, subject = %request.subject)
    )]
    pub async fn lookup_entity_cancellable(
        &self,
        request: LookupEntityRequest,
        cancel: CancellationToken,
    ) -> Result<LookupStream> {
        let LookupEntityRequest {
            entity_type,
            permission,
            subject,
            snapshot,
            contextual_tuples,
        } = request;
        let scope = self
            .open_scope(snapshot, contextual_tuples, cancel.child_token())
            .await?;
        let index = self.reverse_index.clone();

        Ok(self.spawn_lookup("lookup_entity", scope, move |scope, sink| async move {
            LookupEntityEngine::new(&scope, &index)
                .run(&entity_type, &permission, &subject, &sink)
                .await
        }))
    }

    /// Stream the ids of subjects of `subject_type` holding the permission on
    /// the entity.
    ///
    /// # Errors
    ///
    /// Fails up front when the snapshot or contextual tuples are invalid;
    /// evaluation errors arrive through the stream.
    pub async fn lookup_subject(&self, request: LookupSubjectRequest) -> Result<LookupStream> {
        self.lookup_subject_cancellable(request, CancellationToken::new())
            .await
    }

    #[instrument(
        name = "lookup_subject",
        skip_all,
        fields(entity = %request.entity, permission = %request.permission, subject_type = %request.subject_type)
    )]
    pub async fn lookup_subject_cancellable(
        &self,
        request: LookupSubjectRequest,
        cancel: CancellationToken,
    ) -> Result<LookupStream> {
        let LookupSubjectRequest {
            entity,
            permission,
            subject_type,
            snapshot,
            contextual_tuples,
        } = request;
        let scope = self
            .open_scope(snapshot, contextual_tuples, cancel.child_token())
            .await?;

        Ok(self.spawn_lookup("lookup_subject", scope, move |scope, sink| async move {
            LookupSubjectEngine::new(&scope)
                .run(&entity, &permission, &subject_type, &sink)
                .await
        }))
    }

    /// One page of [`lookup_entity`](Self::lookup_entity) results, ordered by
    /// id. Pass the returned continuation, and the returned snapshot, to get
    /// the next page.
    pub async fn lookup_entity_page(
        &self,
        request: LookupEntityRequest,
        page: PageRequest,
    ) -> Result<LookupPage> {
        let stream = self.lookup_entity(request).await?;
        let snapshot = stream.snapshot();
        paginate(stream.collect_sorted().await?, &page, snapshot)
    }

    /// One page of [`lookup_subject`](Self::lookup_subject) results.
    pub async fn lookup_subject_page(
        &self,
        request: LookupSubjectRequest,
        page: PageRequest,
    ) -> Result<LookupPage> {
        let stream = self.lookup_subject(request).await?;
        let snapshot = stream.snapshot();
        paginate(stream.collect_sorted().await?, &page, snapshot)
    }

    // =============================================================================
    // Request plumbing
    // =============================================================================

    /// Pin the snapshot and validate contextual tuples for one request.
    async fn open_scope(
        &self,
        snapshot: Option<SnapshotToken>,
        contextual_tuples: Vec<Tuple>,
        cancel: CancellationToken,
    ) -> Result<Arc<RequestScope>> {
        for tuple in &contextual_tuples {
            self.validate_contextual(tuple)?;
        }

        let snapshot = match snapshot {
            Some(token) => {
                self.tokens.validate_token(&token).await?;
                token
            }
            None => self.tokens.head_token().await?,
        };

        let reader = OverlayReader::new(
            self.reader.clone(),
            ContextualTuples::new(contextual_tuples),
        );
        Ok(Arc::new(RequestScope::new(
            self.schema.clone(),
            reader,
            snapshot,
            self.limiter.clone(),
            cancel,
            &self.config,
        )))
    }

    fn validate_contextual(&self, tuple: &Tuple) -> Result<()> {
        let relation = self
            .schema
            .relation(&tuple.entity.entity_type, &tuple.relation)
            .map_err(|e| EngineError::InvalidTuple(format!("{tuple}: {e}")))?;
        if !relation.allows(&tuple.subject.subject_type, tuple.subject.relation.as_deref()) {
            return Err(EngineError::InvalidTuple(format!(
                "{tuple}: subject not allowed on relation '{}'",
                relation.name
            )));
        }
        Ok(())
    }

    /// Run `work` under the request's cancellation signal and the configured
    /// deadline. Either one surfaces as `Cancelled`.
    async fn guarded<T>(
        &self,
        cancel: &CancellationToken,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        run_guarded(cancel, self.config.request_timeout(), work).await
    }

    /// Drive a lookup on its own task, feeding a bounded channel. Dropping the
    /// returned stream cancels the lookup.
    fn spawn_lookup<F, Fut>(
        &self,
        operation: &'static str,
        scope: Arc<RequestScope>,
        work: F,
    ) -> LookupStream
    where
        F: FnOnce(Arc<RequestScope>, mpsc::Sender<Result<String>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (sink, receiver) = mpsc::channel(self.config.lookup_buffer);
        let cancel = scope.cancellation().clone();
        let guard = cancel.clone().drop_guard();
        let snapshot = scope.snapshot();
        let timeout = self.config.request_timeout();

        tokio::spawn(async move {
            let started = Instant::now();
            let result = run_guarded(&cancel, timeout, work(scope, sink.clone())).await;
            record(operation, started, &result);
            if let Err(e) = result {
                // The consumer may already be gone.
                let _ = sink.send(Err(e)).await;
            }
        });

        LookupStream::new(receiver, snapshot, guard)
    }
}

async fn run_guarded<T>(
    cancel: &CancellationToken,
    timeout: Option<std::time::Duration>,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    let work = async {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(EngineError::Cancelled),
            result = work => result,
        }
    };

    match timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = limit.as_millis(), "Request deadline exceeded");
                cancel.cancel();
                Err(EngineError::Cancelled)
            }
        },
        None => work.await,
    }
}

fn record<T>(operation: &'static str, started: Instant, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!("rebac_requests_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
    metrics::histogram!("rebac_request_duration_seconds", "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}
