//! Relationship-based permission engine
//!
//! Answers four questions against a typed authorization model and a store of
//! relationship tuples:
//! - **Check**: does a subject hold a permission on an entity?
//! - **Expand**: what userset tree does a permission resolve to?
//! - **Lookup entity**: which entities of a type may a subject act on?
//! - **Lookup subject**: which subjects of a type may act on an entity?
//!
//! # Core Concepts
//!
//! - **Entity**: a typed, identified object (`page:readme`)
//! - **Relation**: a stored association between an entity and a subject
//! - **Permission**: a boolean expression over relations and permissions,
//!   evaluated on demand
//! - **Userset**: the subjects holding a relation on an entity
//!   (`workspace:acme#member`), usable as a subject itself
//! - **Snapshot token**: pins every read of one request to the same point
//!   in the store's history
//!
//! # Example
//!
//! ```rust
//! use rebac_engine::{
//!     CheckRequest, Engine, EntityRef, EntityTypeDefinition, MemoryRelationshipStore,
//!     PermissionExpression as E, Schema, SubjectRef,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schema = Schema::new([
//!         EntityTypeDefinition::new("user"),
//!         EntityTypeDefinition::new("workspace")
//!             .relation("member", &["user"])?
//!             .permission("read", E::relation("member")),
//!         EntityTypeDefinition::new("page")
//!             .relation("workspace", &["workspace"])?
//!             .relation("reader", &["user"])?
//!             .permission(
//!                 "read",
//!                 E::union([E::relation("reader"), E::indirect("workspace", "read")]),
//!             ),
//!     ])?;
//!
//!     let store = Arc::new(MemoryRelationshipStore::from_notation([
//!         "workspace:acme#member@user:alice",
//!         "page:readme#workspace@workspace:acme",
//!     ])?);
//!     let engine = Engine::with_store(schema, store);
//!
//!     let response = engine
//!         .check(CheckRequest::new(
//!             EntityRef::new("page", "readme"),
//!             "read",
//!             SubjectRef::user("alice"),
//!         ))
//!         .await?;
//!     assert!(response.is_allowed());
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod check;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod expand;
pub mod graph;
pub mod lookup;
pub mod lookup_entity;
pub mod lookup_subject;
pub mod models;
pub mod repository;
pub mod schema;
pub mod scope;
pub mod snapshot;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use expand::{ExpandNode, UsersetTree};
pub use lookup::LookupStream;
pub use models::*;
pub use repository::{MemoryRelationshipStore, RelationshipReader};
pub use schema::*;
pub use snapshot::{SnapshotToken, SnapshotTokenService};
