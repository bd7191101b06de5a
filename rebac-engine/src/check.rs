use crate::{
    cache::CheckKey,
    error::{EngineError, Result},
    models::{Decision, EntityRef, SubjectRef, TupleFilter},
    schema::{Definition, PermissionExpression},
    scope::RequestScope,
};
use ahash::AHashSet;
use futures::future::{self, BoxFuture, Either, FutureExt};
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

/// One step of a traversal: does `subject` hold `name` on `entity`?
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub entity: EntityRef,
    pub name: String,
    pub subject: SubjectRef,
    pub remaining_depth: u32,
}

impl EvaluationRequest {
    pub fn new(
        entity: EntityRef,
        name: impl Into<String>,
        subject: SubjectRef,
        remaining_depth: u32,
    ) -> Self {
        Self {
            entity,
            name: name.into(),
            subject,
            remaining_depth,
        }
    }

    /// The request for a recursive step, one level deeper.
    pub fn descend(&self, entity: EntityRef, name: &str) -> Self {
        Self {
            entity,
            name: name.to_string(),
            subject: self.subject.clone(),
            remaining_depth: self.remaining_depth.saturating_sub(1),
        }
    }

    /// The subject is exactly the userset `entity#name`.
    fn is_self_userset(&self) -> bool {
        self.subject.relation.as_deref() == Some(self.name.as_str())
            && self.subject.subject_type == self.entity.entity_type
            && self.subject.id == self.entity.id
    }

    pub(crate) fn depth_exceeded(&self, expression: impl ToString) -> EngineError {
        EngineError::DepthExceeded {
            entity: self.entity.to_string(),
            permission: self.name.clone(),
            subject: self.subject.to_string(),
            expression: expression.to_string(),
        }
    }
}

type DecisionFuture<'s> = BoxFuture<'s, Result<Decision>>;

/// Forward evaluator resolving a permission or relation for one subject.
///
/// Combinator children run concurrently, at most `fan_out_limit` at a time
/// per node. Children are plain futures owned by their parent: once the
/// parent's result is settled the remaining children are dropped.
#[derive(Clone, Copy)]
pub struct CheckEngine<'s> {
    scope: &'s RequestScope,
}

impl<'s> CheckEngine<'s> {
    pub fn new(scope: &'s RequestScope) -> Self {
        Self { scope }
    }

    /// Top-level entry using the scope's full depth budget.
    pub async fn run(self, entity: EntityRef, name: &str, subject: SubjectRef) -> Result<Decision> {
        let request = EvaluationRequest::new(entity, name, subject, self.scope.max_depth());
        self.check(request).await
    }

    pub fn check(self, request: EvaluationRequest) -> DecisionFuture<'s> {
        async move {
            let scope = self.scope;
            scope.ensure_active()?;
            scope.record_dispatch();

            let key = CheckKey {
                entity: request.entity.clone(),
                name: request.name.clone(),
                subject: request.subject.clone(),
            };
            if let Some(decision) = scope.cache.get_check(&key) {
                return Ok(decision);
            }

            let definition = scope
                .schema
                .resolve(&request.entity.entity_type, &request.name)?;

            if request.is_self_userset() {
                return Ok(Decision::Allowed);
            }

            if request.remaining_depth == 0 {
                warn!(
                    entity = %request.entity,
                    permission = %request.name,
                    subject = %request.subject,
                    "Evaluation depth exhausted"
                );
                return Err(request.depth_exceeded(describe(&definition)));
            }
            if scope.cache.is_exhausted(&key, request.remaining_depth) {
                debug!(
                    entity = %request.entity,
                    permission = %request.name,
                    remaining_depth = request.remaining_depth,
                    "Depth already exhausted at a larger budget"
                );
                return Err(request.depth_exceeded(describe(&definition)));
            }

            let evaluated = match definition {
                Definition::Relation(_) => self.check_relation(&request).await,
                Definition::Permission(permission) => {
                    self.check_expression(request.clone(), &permission.expression)
                        .await
                }
            };
            let decision = match evaluated {
                Ok(decision) => decision,
                Err(e) => {
                    if e.is_path_termination() {
                        scope.cache.put_exhausted(key, request.remaining_depth);
                    }
                    return Err(e);
                }
            };

            debug!(
                entity = %request.entity,
                permission = %request.name,
                subject = %request.subject,
                %decision,
                "Resolved"
            );
            scope.cache.put_check(key, decision);
            Ok(decision)
        }
        .boxed()
    }

    async fn check_relation(self, request: &EvaluationRequest) -> Result<Decision> {
        let filter = TupleFilter::for_relation(&request.entity, &request.name);
        let tuples = self.scope.query(&filter).await?;

        let mut usersets = Vec::new();
        for tuple in tuples {
            if tuple.subject == request.subject {
                return Ok(Decision::Allowed);
            }
            if let Some(relation) = &tuple.subject.relation {
                usersets.push(self.check(request.descend(tuple.subject.entity(), relation)));
            }
        }

        self.union(usersets).await
    }

    fn check_expression(
        self,
        request: EvaluationRequest,
        expression: &'s PermissionExpression,
    ) -> DecisionFuture<'s> {
        async move {
            let entity_type = &request.entity.entity_type;
            match expression {
                PermissionExpression::Relation { name } => {
                    self.scope.schema.relation(entity_type, name)?;
                    self.check(request.descend(request.entity.clone(), name)).await
                }
                PermissionExpression::Permission { name } => {
                    self.scope.schema.permission(entity_type, name)?;
                    self.check(request.descend(request.entity.clone(), name)).await
                }
                PermissionExpression::Union { children } => {
                    let children = children
                        .iter()
                        .map(|child| self.check_expression(request.clone(), child))
                        .collect();
                    self.union(children).await
                }
                PermissionExpression::Intersection { children } => {
                    let children = children
                        .iter()
                        .map(|child| self.check_expression(request.clone(), child))
                        .collect();
                    self.intersection(children).await
                }
                PermissionExpression::Exclusion { base, subtrahend } => {
                    let base = self.check_expression(request.clone(), base);
                    let subtrahend = self.check_expression(request, subtrahend);
                    Self::exclusion(base, subtrahend).await
                }
                PermissionExpression::Indirect { tupleset, computed } => {
                    self.check_indirect(&request, tupleset, computed).await
                }
            }
        }
        .boxed()
    }

    async fn check_indirect(
        self,
        request: &EvaluationRequest,
        tupleset: &str,
        computed: &str,
    ) -> Result<Decision> {
        self.scope.schema.relation(&request.entity.entity_type, tupleset)?;
        let filter = TupleFilter::for_relation(&request.entity, tupleset);
        let tuples = self.scope.query(&filter).await?;

        let mut seen = AHashSet::new();
        let children = tuples
            .into_iter()
            .map(|tuple| tuple.subject.entity())
            .filter(|related| seen.insert(related.clone()))
            .map(|related| self.check(request.descend(related, computed)))
            .collect();

        self.union(children).await
    }

    /// `Allowed` as soon as any child allows.
    async fn union(self, children: Vec<DecisionFuture<'s>>) -> Result<Decision> {
        let mut pending = stream::iter(children).buffer_unordered(self.scope.fan_out_limit());
        let mut deferred = None;

        while let Some(result) = pending.next().await {
            match result {
                Ok(Decision::Allowed) => return Ok(Decision::Allowed),
                Ok(Decision::Denied) => {}
                Err(e) if e.is_path_termination() => {
                    deferred.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        deferred.map_or(Ok(Decision::Denied), Err)
    }

    /// `Denied` as soon as any child denies. Empty intersections deny.
    async fn intersection(self, children: Vec<DecisionFuture<'s>>) -> Result<Decision> {
        if children.is_empty() {
            return Ok(Decision::Denied);
        }

        let mut pending = stream::iter(children).buffer_unordered(self.scope.fan_out_limit());
        let mut deferred = None;

        while let Some(result) = pending.next().await {
            match result {
                Ok(Decision::Denied) => return Ok(Decision::Denied),
                Ok(Decision::Allowed) => {}
                Err(e) if e.is_path_termination() => {
                    deferred.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        deferred.map_or(Ok(Decision::Allowed), Err)
    }

    /// `base and not subtrahend`; settles on whichever side finishes first
    /// when that side alone determines the result.
    async fn exclusion(base: DecisionFuture<'s>, subtrahend: DecisionFuture<'s>) -> Result<Decision> {
        match future::select(base, subtrahend).await {
            Either::Left((base, subtrahend)) => match base {
                Ok(Decision::Denied) => Ok(Decision::Denied),
                Ok(Decision::Allowed) => Ok(negate(subtrahend.await?)),
                Err(e) if e.is_path_termination() => match subtrahend.await? {
                    Decision::Allowed => Ok(Decision::Denied),
                    Decision::Denied => Err(e),
                },
                Err(e) => Err(e),
            },
            Either::Right((subtrahend, base)) => match subtrahend {
                Ok(Decision::Allowed) => Ok(Decision::Denied),
                Ok(Decision::Denied) => base.await,
                Err(e) if e.is_path_termination() => match base.await? {
                    Decision::Denied => Ok(Decision::Denied),
                    Decision::Allowed => Err(e),
                },
                Err(e) => Err(e),
            },
        }
    }
}

fn describe(definition: &Definition<'_>) -> String {
    match definition {
        Definition::Relation(relation) => relation.name.clone(),
        Definition::Permission(permission) => permission.expression.to_string(),
    }
}

fn negate(decision: Decision) -> Decision {
    match decision {
        Decision::Allowed => Decision::Denied,
        Decision::Denied => Decision::Allowed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineConfig,
        repository::MockRelationshipReader,
        schema::{EntityTypeDefinition, PermissionExpression as E, Schema},
        test_support::{scope, store, tuples, workspace_schema},
    };
    use std::sync::Arc;

    const SCENARIO: &[&str] = &[
        "workspace:w#owner@user:alice",
        "workspace:w#member@user:bob",
        "page:p#workspace@workspace:w",
        "page:p#reader@user:bob",
    ];

    async fn check_in(scope: &RequestScope, entity: &str, name: &str, subject: &str) -> Result<Decision> {
        CheckEngine::new(scope)
            .run(entity.parse().unwrap(), name, subject.parse().unwrap())
            .await
    }

    async fn check(notation: &[&str], entity: &str, name: &str, subject: &str) -> Result<Decision> {
        let scope = scope(workspace_schema(), store(notation), Vec::new(), &EngineConfig::default());
        check_in(&scope, entity, name, subject).await
    }

    #[tokio::test]
    async fn test_owner_reads_page_through_workspace() {
        let decision = check(SCENARIO, "page:p", "read", "user:alice").await.unwrap();
        assert_eq!(decision, Decision::Allowed);
    }

    #[tokio::test]
    async fn test_direct_reader_allowed() {
        let decision = check(SCENARIO, "page:p", "read", "user:bob").await.unwrap();
        assert_eq!(decision, Decision::Allowed);
    }

    #[tokio::test]
    async fn test_unrelated_subject_denied() {
        let decision = check(SCENARIO, "page:p", "read", "user:charlie").await.unwrap();
        assert_eq!(decision, Decision::Denied);
    }

    #[tokio::test]
    async fn test_relation_checked_directly() {
        assert_eq!(
            check(SCENARIO, "workspace:w", "owner", "user:alice").await.unwrap(),
            Decision::Allowed
        );
        assert_eq!(
            check(SCENARIO, "workspace:w", "owner", "user:bob").await.unwrap(),
            Decision::Denied
        );
    }

    #[tokio::test]
    async fn test_nested_group_membership() {
        let notation = &[
            "group:eng#member@user:dana",
            "group:all#member@group:eng#member",
            "workspace:w#member@group:all#member",
            "page:p#workspace@workspace:w",
        ];
        assert_eq!(
            check(notation, "page:p", "read", "user:dana").await.unwrap(),
            Decision::Allowed
        );
        assert_eq!(
            check(notation, "page:p", "read", "group:eng#member").await.unwrap(),
            Decision::Allowed
        );
    }

    #[tokio::test]
    async fn test_userset_subject_matches_itself() {
        let decision = check(&[], "group:eng", "member", "group:eng#member").await.unwrap();
        assert_eq!(decision, Decision::Allowed);
    }

    #[tokio::test]
    async fn test_intersection_and_exclusion() {
        let notation = &[
            "workspace:w#admin@user:erin",
            "workspace:w#member@user:erin",
            "workspace:w#admin@user:frank",
            "workspace:w#admin@user:gina",
            "workspace:w#member@user:gina",
            "workspace:w#banned@user:gina",
            "page:p#workspace@workspace:w",
        ];
        assert_eq!(check(notation, "page:p", "edit", "user:erin").await.unwrap(), Decision::Allowed);
        // Admin without membership.
        assert_eq!(check(notation, "page:p", "edit", "user:frank").await.unwrap(), Decision::Denied);
        assert_eq!(check(notation, "page:p", "edit", "user:gina").await.unwrap(), Decision::Denied);
    }

    #[tokio::test]
    async fn test_contextual_tuple_grants_access() {
        let scope = scope(
            workspace_schema(),
            store(SCENARIO),
            tuples(&["page:ctx#reader@user:bob"]),
            &EngineConfig::default(),
        );
        let decision = check_in(&scope, "page:ctx", "read", "user:bob").await.unwrap();
        assert_eq!(decision, Decision::Allowed);
    }

    #[tokio::test]
    async fn test_undefined_names_fail() {
        let err = check(SCENARIO, "page:p", "delete", "user:bob").await.unwrap_err();
        assert!(matches!(err, EngineError::PermissionUndefined { .. }));

        let err = check(SCENARIO, "folder:f", "read", "user:bob").await.unwrap_err();
        assert!(matches!(err, EngineError::EntityTypeUndefined { .. }));
    }

    #[tokio::test]
    async fn test_parent_cycle_exceeds_depth() {
        let notation = &["page:a#parent@page:b", "page:b#parent@page:a"];
        let err = check(notation, "page:a", "read", "user:zed").await.unwrap_err();
        match err {
            EngineError::DepthExceeded { entity, permission, .. } => {
                assert!(entity.starts_with("page:"));
                assert!(!permission.is_empty());
            }
            other => panic!("expected DepthExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_allowed_sibling_beats_depth_exhaustion() {
        let notation = &[
            "page:a#parent@page:b",
            "page:b#parent@page:a",
            "page:a#reader@user:zed",
        ];
        let decision = check(notation, "page:a", "read", "user:zed").await.unwrap();
        assert_eq!(decision, Decision::Allowed);
    }

    #[tokio::test]
    async fn test_depth_budget_bounds_chain_length() {
        let notation = &[
            "page:c#parent@page:b",
            "page:b#parent@page:a",
            "page:a#reader@user:zed",
        ];
        let config = EngineConfig::default().with_max_depth(2);
        let scope = scope(workspace_schema(), store(notation), Vec::new(), &config);
        let err = check_in(&scope, "page:c", "read", "user:zed").await.unwrap_err();
        assert!(matches!(err, EngineError::DepthExceeded { .. }));

        let config = EngineConfig::default().with_max_depth(8);
        let scope = scope_with(notation, &config);
        let decision = check_in(&scope, "page:c", "read", "user:zed").await.unwrap();
        assert_eq!(decision, Decision::Allowed);
    }

    fn scope_with(notation: &[&str], config: &EngineConfig) -> RequestScope {
        scope(workspace_schema(), store(notation), Vec::new(), config)
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let mut reader = MockRelationshipReader::new();
        reader
            .expect_query_relationships()
            .returning(|_, _| Err(EngineError::StoreUnavailable("connection refused".into())));

        let scope = scope(workspace_schema(), Arc::new(reader), Vec::new(), &EngineConfig::default());
        let err = check_in(&scope, "page:p", "read", "user:bob").await.unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_cancelled_scope_fails_without_querying() {
        let mut reader = MockRelationshipReader::new();
        reader.expect_query_relationships().never();

        let scope = scope(workspace_schema(), Arc::new(reader), Vec::new(), &EngineConfig::default());
        scope.cancellation().cancel();
        let err = check_in(&scope, "page:p", "read", "user:bob").await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_diamond_is_served_from_cache() {
        let schema = Schema::new([
            EntityTypeDefinition::new("user"),
            EntityTypeDefinition::new("doc")
                .relation("viewer", &["user"])
                .unwrap()
                .permission("view", E::relation("viewer"))
                .permission("read", E::union([E::permission("view"), E::permission("view")]))
                .permission(
                    "audit",
                    E::intersection([E::permission("read"), E::permission("view")]),
                ),
        ])
        .unwrap();
        let scope = scope(schema, store(&[]), Vec::new(), &EngineConfig::default());

        let decision = check_in(&scope, "doc:d", "audit", "user:u").await.unwrap();
        assert_eq!(decision, Decision::Denied);
        let metadata = scope.metadata();
        assert!(metadata.store_queries <= 2);
        assert!(metadata.dispatch_count >= 3);
    }

    #[tokio::test]
    async fn test_empty_union_denies() {
        let schema = Schema::new([
            EntityTypeDefinition::new("user"),
            EntityTypeDefinition::new("doc").permission("nobody", E::union([])),
        ])
        .unwrap();
        let scope = scope(schema, store(&[]), Vec::new(), &EngineConfig::default());
        let decision = check_in(&scope, "doc:d", "nobody", "user:u").await.unwrap();
        assert_eq!(decision, Decision::Denied);
    }

    #[tokio::test]
    async fn test_instance_cycle_fails_fast_at_default_depth() {
        let notation = &[
            "page:a#parent@page:b",
            "page:a#parent@page:c",
            "page:b#parent@page:a",
            "page:b#parent@page:c",
            "page:c#parent@page:a",
            "page:c#parent@page:b",
        ];
        let scope = scope_with(notation, &EngineConfig::default());

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            check_in(&scope, "page:a", "read", "user:zed"),
        )
        .await
        .expect("cyclic check did not finish");
        assert!(matches!(result, Err(EngineError::DepthExceeded { .. })));
    }

    /// `looped` recurses through `doc:d#parent@doc:d` until the depth
    /// budget runs out.
    fn looping_schema() -> Schema {
        Schema::new([
            EntityTypeDefinition::new("user"),
            EntityTypeDefinition::new("doc")
                .relation("parent", &["doc"])
                .unwrap()
                .relation("granted", &["user"])
                .unwrap()
                .relation("banned", &["user"])
                .unwrap()
                .permission("looped", E::indirect("parent", "looped"))
                .permission(
                    "gated",
                    E::intersection([E::permission("looped"), E::relation("granted")]),
                )
                .permission(
                    "looped_unless_banned",
                    E::exclusion(E::permission("looped"), E::relation("banned")),
                )
                .permission(
                    "granted_unless_looped",
                    E::exclusion(E::relation("granted"), E::permission("looped")),
                ),
        ])
        .unwrap()
    }

    async fn check_looping(name: &str, subject: &str) -> Result<Decision> {
        let notation = &[
            "doc:d#parent@doc:d",
            "doc:d#granted@user:ann",
            "doc:d#banned@user:ann",
        ];
        let scope = scope(looping_schema(), store(notation), Vec::new(), &EngineConfig::default());
        check_in(&scope, "doc:d", name, subject).await
    }

    #[tokio::test]
    async fn test_intersection_denied_sibling_beats_depth_exhaustion() {
        let decision = check_looping("gated", "user:bob").await.unwrap();
        assert_eq!(decision, Decision::Denied);
    }

    #[tokio::test]
    async fn test_intersection_surfaces_depth_exhaustion_when_others_allow() {
        let err = check_looping("gated", "user:ann").await.unwrap_err();
        assert!(matches!(err, EngineError::DepthExceeded { .. }));
    }

    #[tokio::test]
    async fn test_exclusion_allowed_subtrahend_beats_depth_exhaustion() {
        let decision = check_looping("looped_unless_banned", "user:ann").await.unwrap();
        assert_eq!(decision, Decision::Denied);
    }

    #[tokio::test]
    async fn test_exclusion_needs_subtrahend_when_base_allows() {
        let err = check_looping("granted_unless_looped", "user:ann").await.unwrap_err();
        assert!(matches!(err, EngineError::DepthExceeded { .. }));

        let decision = check_looping("granted_unless_looped", "user:bob").await.unwrap();
        assert_eq!(decision, Decision::Denied);
    }
}
