//! Userset tree materialization for audit and debugging.

use crate::{
    cache::ExpandKey,
    error::{EngineError, Result},
    models::{EntityRef, SubjectRef, TupleFilter},
    schema::{Definition, PermissionExpression},
    scope::RequestScope,
};
use ahash::AHashSet;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Resolved tree behind `entity#name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsersetTree {
    pub entity: EntityRef,
    pub name: String,
    pub node: ExpandNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpandNode {
    /// Subjects stored directly on a relation, usersets included.
    Leaf { subjects: Vec<SubjectRef> },
    Union { children: Vec<UsersetTree> },
    Intersection { children: Vec<UsersetTree> },
    Exclusion {
        base: Box<UsersetTree>,
        subtrahend: Box<UsersetTree>,
    },
}

impl UsersetTree {
    fn new(entity: EntityRef, name: impl Into<String>, node: ExpandNode) -> Self {
        Self {
            entity,
            name: name.into(),
            node,
        }
    }

    /// Concrete (non-userset) subjects the tree grants, with intersections
    /// and exclusions applied.
    pub fn subjects(&self) -> BTreeSet<SubjectRef> {
        match &self.node {
            ExpandNode::Leaf { subjects } => subjects
                .iter()
                .filter(|s| !s.is_userset())
                .cloned()
                .collect(),
            ExpandNode::Union { children } => {
                children.iter().flat_map(UsersetTree::subjects).collect()
            }
            ExpandNode::Intersection { children } => {
                let mut children = children.iter().map(UsersetTree::subjects);
                let first = children.next().unwrap_or_default();
                children.fold(first, |acc, next| acc.intersection(&next).cloned().collect())
            }
            ExpandNode::Exclusion { base, subtrahend } => {
                let excluded = subtrahend.subjects();
                base.subjects()
                    .into_iter()
                    .filter(|s| !excluded.contains(s))
                    .collect()
            }
        }
    }
}

type TreeFuture<'s> = BoxFuture<'s, Result<UsersetTree>>;

/// Expands permissions into [`UsersetTree`]s using the same traversal rules
/// as [`CheckEngine`](crate::check::CheckEngine), collecting subjects rather
/// than testing one.
#[derive(Clone, Copy)]
pub struct ExpandEngine<'s> {
    scope: &'s RequestScope,
}

impl<'s> ExpandEngine<'s> {
    pub fn new(scope: &'s RequestScope) -> Self {
        Self { scope }
    }

    pub async fn run(self, entity: EntityRef, name: &str) -> Result<UsersetTree> {
        self.expand(entity, name.to_string(), self.scope.max_depth())
            .await
    }

    fn expand(self, entity: EntityRef, name: String, remaining_depth: u32) -> TreeFuture<'s> {
        async move {
            let scope = self.scope;
            scope.ensure_active()?;
            scope.record_dispatch();

            let key = ExpandKey {
                entity: entity.clone(),
                name: name.clone(),
            };
            if let Some(tree) = scope.cache.get_expand(&key) {
                return Ok(tree);
            }

            let definition = scope.schema.resolve(&entity.entity_type, &name)?;
            if remaining_depth == 0 {
                let expression = match definition {
                    Definition::Relation(relation) => relation.name.clone(),
                    Definition::Permission(permission) => permission.expression.to_string(),
                };
                return Err(EngineError::DepthExceeded {
                    entity: entity.to_string(),
                    permission: name,
                    subject: "*".to_string(),
                    expression,
                });
            }

            let tree = match definition {
                Definition::Relation(_) => {
                    self.expand_relation(entity, &name, remaining_depth - 1)
                        .await?
                }
                Definition::Permission(permission) => {
                    let depth = remaining_depth - 1;
                    self.expand_expression(entity, &permission.name, &permission.expression, depth)
                        .await?
                }
            };

            debug!(entity = %tree.entity, name = %tree.name, "Expanded");
            scope.cache.put_expand(key, tree.clone());
            Ok(tree)
        }
        .boxed()
    }

    async fn expand_relation(self, entity: EntityRef, name: &str, depth: u32) -> Result<UsersetTree> {
        let tuples = self
            .scope
            .query(&TupleFilter::for_relation(&entity, name))
            .await?;

        let mut seen = AHashSet::new();
        let subjects: Vec<SubjectRef> = tuples
            .into_iter()
            .map(|t| t.subject)
            .filter(|s| seen.insert(s.clone()))
            .collect();

        let nested: Vec<TreeFuture<'s>> = subjects
            .iter()
            .filter_map(|s| {
                s.relation
                    .as_ref()
                    .map(|relation| self.expand(s.entity(), relation.clone(), depth))
            })
            .collect();

        let leaf = UsersetTree::new(entity.clone(), name, ExpandNode::Leaf { subjects });
        if nested.is_empty() {
            return Ok(leaf);
        }

        let mut children = vec![leaf];
        children.extend(self.collect(nested).await?);
        Ok(UsersetTree::new(entity, name, ExpandNode::Union { children }))
    }

    fn expand_expression(
        self,
        entity: EntityRef,
        name: &'s str,
        expression: &'s PermissionExpression,
        depth: u32,
    ) -> TreeFuture<'s> {
        async move {
            let node = match expression {
                PermissionExpression::Relation { name: leaf }
                | PermissionExpression::Permission { name: leaf } => {
                    return self.expand(entity, leaf.clone(), depth).await;
                }
                PermissionExpression::Union { children } => ExpandNode::Union {
                    children: self.expand_children(&entity, name, children, depth).await?,
                },
                PermissionExpression::Intersection { children } => ExpandNode::Intersection {
                    children: self.expand_children(&entity, name, children, depth).await?,
                },
                PermissionExpression::Exclusion { base, subtrahend } => {
                    let (base, subtrahend) = future::try_join(
                        self.expand_expression(entity.clone(), name, base, depth),
                        self.expand_expression(entity.clone(), name, subtrahend, depth),
                    )
                    .await?;
                    ExpandNode::Exclusion {
                        base: Box::new(base),
                        subtrahend: Box::new(subtrahend),
                    }
                }
                PermissionExpression::Indirect { tupleset, computed } => {
                    self.scope.schema.relation(&entity.entity_type, tupleset)?;
                    let tuples = self
                        .scope
                        .query(&TupleFilter::for_relation(&entity, tupleset))
                        .await?;
                    let mut seen = AHashSet::new();
                    let related: Vec<TreeFuture<'s>> = tuples
                        .into_iter()
                        .map(|t| t.subject.entity())
                        .filter(|e| seen.insert(e.clone()))
                        .map(|e| self.expand(e, computed.clone(), depth))
                        .collect();
                    ExpandNode::Union {
                        children: self.collect(related).await?,
                    }
                }
            };
            Ok(UsersetTree::new(entity, name, node))
        }
        .boxed()
    }

    async fn expand_children(
        self,
        entity: &EntityRef,
        name: &'s str,
        children: &'s [PermissionExpression],
        depth: u32,
    ) -> Result<Vec<UsersetTree>> {
        let pending = children
            .iter()
            .map(|child| self.expand_expression(entity.clone(), name, child, depth))
            .collect();
        self.collect(pending).await
    }

    /// Runs `pending` with bounded concurrency, keeping declaration order.
    async fn collect(self, pending: Vec<TreeFuture<'s>>) -> Result<Vec<UsersetTree>> {
        stream::iter(pending)
            .buffered(self.scope.fan_out_limit())
            .try_collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineConfig,
        test_support::{scope, store, workspace_schema},
    };

    fn users(ids: &[&str]) -> BTreeSet<SubjectRef> {
        ids.iter().map(|id| SubjectRef::user(*id)).collect()
    }

    async fn expand(notation: &[&str], entity: &str, name: &str) -> Result<UsersetTree> {
        let scope = scope(workspace_schema(), store(notation), Vec::new(), &EngineConfig::default());
        ExpandEngine::new(&scope).run(entity.parse().unwrap(), name).await
    }

    #[tokio::test]
    async fn test_expand_relation_leaf() {
        let tree = expand(
            &["workspace:w#owner@user:alice", "workspace:w#owner@user:bob"],
            "workspace:w",
            "owner",
        )
        .await
        .unwrap();

        assert_eq!(
            tree.node,
            ExpandNode::Leaf {
                subjects: vec![SubjectRef::user("alice"), SubjectRef::user("bob")]
            }
        );
    }

    #[tokio::test]
    async fn test_expand_follows_usersets_and_indirection() {
        let tree = expand(
            &[
                "group:eng#member@user:dana",
                "workspace:w#member@group:eng#member",
                "workspace:w#owner@user:alice",
                "page:p#workspace@workspace:w",
                "page:p#reader@user:bob",
            ],
            "page:p",
            "read",
        )
        .await
        .unwrap();

        assert_eq!(tree.entity, EntityRef::new("page", "p"));
        assert!(matches!(tree.node, ExpandNode::Union { ref children } if children.len() == 3));
        assert_eq!(tree.subjects(), users(&["alice", "bob", "dana"]));
    }

    #[tokio::test]
    async fn test_flatten_applies_exclusion() {
        let tree = expand(
            &[
                "workspace:w#admin@user:erin",
                "workspace:w#member@user:erin",
                "workspace:w#admin@user:gina",
                "workspace:w#member@user:gina",
                "workspace:w#banned@user:gina",
                "workspace:w#admin@user:frank",
            ],
            "workspace:w",
            "manage",
        )
        .await
        .unwrap();

        assert!(matches!(tree.node, ExpandNode::Exclusion { .. }));
        assert_eq!(tree.subjects(), users(&["erin"]));
    }

    #[tokio::test]
    async fn test_expand_cycle_exceeds_depth() {
        let err = expand(&["page:a#parent@page:b", "page:b#parent@page:a"], "page:a", "read")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DepthExceeded { .. }));
    }
}
