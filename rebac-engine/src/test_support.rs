//! Fixtures shared by the unit tests.

use crate::{
    config::EngineConfig,
    context::{ContextualTuples, OverlayReader},
    models::Tuple,
    repository::{MemoryRelationshipStore, RelationshipReader},
    schema::{EntityTypeDefinition, PermissionExpression as E, Schema},
    scope::RequestScope,
    snapshot::SnapshotToken,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Workspace and page model: pages inherit readers from their workspace.
pub fn workspace_schema() -> Schema {
    Schema::new([
        EntityTypeDefinition::new("user"),
        EntityTypeDefinition::new("group")
            .relation("member", &["user", "group#member"])
            .unwrap(),
        EntityTypeDefinition::new("workspace")
            .relation("owner", &["user"])
            .unwrap()
            .relation("admin", &["user"])
            .unwrap()
            .relation("member", &["user", "group#member"])
            .unwrap()
            .relation("guest", &["user"])
            .unwrap()
            .relation("banned", &["user"])
            .unwrap()
            .permission(
                "read",
                E::union([
                    E::relation("member"),
                    E::relation("owner"),
                    E::relation("admin"),
                    E::relation("guest"),
                ]),
            )
            .permission(
                "manage",
                E::exclusion(
                    E::intersection([E::relation("admin"), E::relation("member")]),
                    E::relation("banned"),
                ),
            ),
        EntityTypeDefinition::new("page")
            .relation("workspace", &["workspace"])
            .unwrap()
            .relation("reader", &["user", "group#member"])
            .unwrap()
            .relation("parent", &["page"])
            .unwrap()
            .permission(
                "read",
                E::union([
                    E::relation("reader"),
                    E::indirect("workspace", "read"),
                    E::indirect("parent", "read"),
                ]),
            )
            .permission("edit", E::indirect("workspace", "manage")),
    ])
    .unwrap()
}

pub fn store(notation: &[&str]) -> Arc<MemoryRelationshipStore> {
    Arc::new(MemoryRelationshipStore::from_notation(notation.iter().copied()).unwrap())
}

pub fn tuples(notation: &[&str]) -> Vec<Tuple> {
    notation.iter().map(|t| t.parse().unwrap()).collect()
}

pub fn scope(
    schema: Schema,
    reader: Arc<dyn RelationshipReader>,
    contextual: Vec<Tuple>,
    config: &EngineConfig,
) -> RequestScope {
    RequestScope::new(
        Arc::new(schema),
        OverlayReader::new(reader, ContextualTuples::new(contextual)),
        SnapshotToken::from_revision(1),
        Arc::new(Semaphore::new(config.max_concurrent_queries)),
        CancellationToken::new(),
        config,
    )
}
