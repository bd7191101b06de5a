//! Shared fixtures for the integration tests.

#![allow(dead_code)]

pub mod notion;

use rebac_engine::{
    CheckRequest, Engine, EngineConfig, EntityRef, EntityTypeDefinition, MemoryRelationshipStore,
    PermissionExpression as E, Schema, SubjectRef, Tuple,
};
use std::sync::Arc;

/// Workspaces own pages; pages nest under parent pages and inherit readers.
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
                    E::union([E::relation("owner"), E::relation("admin")]),
                    E::relation("banned"),
                ),
            ),
        EntityTypeDefinition::new("page")
            .relation("workspace", &["workspace"])
            .unwrap()
            .relation("parent", &["page"])
            .unwrap()
            .relation("reader", &["user", "group#member"])
            .unwrap()
            .relation("writer", &["user"])
            .unwrap()
            .permission(
                "read",
                E::union([
                    E::relation("reader"),
                    E::permission("write"),
                    E::indirect("workspace", "read"),
                    E::indirect("parent", "read"),
                ]),
            )
            .permission(
                "write",
                E::union([E::relation("writer"), E::indirect("workspace", "manage")]),
            )
            .permission(
                "share",
                E::intersection([E::permission("write"), E::indirect("workspace", "read")]),
            ),
    ])
    .unwrap()
}

/// The four tuples of the basic workspace/page scenario.
pub const SCENARIO: &[&str] = &[
    "workspace:w#owner@user:alice",
    "workspace:w#member@user:bob",
    "page:p#workspace@workspace:w",
    "page:p#reader@user:bob",
];

/// A richer graph: nested groups, page hierarchy, a banned admin.
pub const HIERARCHY: &[&str] = &[
    "workspace:acme#owner@user:alice",
    "workspace:acme#admin@user:erin",
    "workspace:acme#admin@user:gina",
    "workspace:acme#banned@user:gina",
    "workspace:acme#member@group:eng#member",
    "workspace:acme#guest@user:hank",
    "group:eng#member@user:dana",
    "group:eng#member@group:platform#member",
    "group:platform#member@user:frank",
    "workspace:other#member@user:ivan",
    "page:home#workspace@workspace:acme",
    "page:design#parent@page:home",
    "page:rfc#parent@page:design",
    "page:notes#workspace@workspace:other",
    "page:notes#reader@user:dana",
    "page:draft#writer@user:jane",
    "page:draft#workspace@workspace:other",
];

pub const USERS: &[&str] = &[
    "alice", "bob", "dana", "erin", "frank", "gina", "hank", "ivan", "jane", "zed",
];

pub const PAGES: &[&str] = &["home", "design", "rfc", "notes", "draft", "p"];

pub fn store(notation: &[&str]) -> Arc<MemoryRelationshipStore> {
    Arc::new(MemoryRelationshipStore::from_notation(notation.iter().copied()).unwrap())
}

pub fn engine(notation: &[&str]) -> (Engine, Arc<MemoryRelationshipStore>) {
    let store = store(notation);
    (Engine::with_store(workspace_schema(), store.clone()), store)
}

pub fn engine_with(notation: &[&str], config: EngineConfig) -> Engine {
    Engine::with_store(workspace_schema(), store(notation))
        .with_config(config)
        .unwrap()
}

pub fn tuple(notation: &str) -> Tuple {
    notation.parse().unwrap()
}

pub fn page(id: &str) -> EntityRef {
    EntityRef::new("page", id)
}

pub fn user(id: &str) -> SubjectRef {
    SubjectRef::user(id)
}

pub fn check_request(entity: &str, permission: &str, subject: &str) -> CheckRequest {
    CheckRequest::new(entity.parse().unwrap(), permission, subject.parse().unwrap())
}
