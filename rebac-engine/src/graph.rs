//! Reverse edges of the schema, used to walk from a subject towards the
//! entities it can reach.

use crate::schema::{PermissionExpression, Schema};
use std::collections::HashMap;

/// How a reached node `T:id#name` (or a plain subject `T:id`) unlocks
/// further nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReverseEdge {
    /// `entity_type#relation` stores the node as a subject.
    Stored {
        entity_type: String,
        relation: String,
    },
    /// `permission` on the same entity references the node's name.
    Computed { permission: String },
    /// `entity_type#permission` contains `tupleset.<name>` and `tupleset`
    /// stores the node's entity.
    TupleToUserset {
        entity_type: String,
        tupleset: String,
        permission: String,
    },
}

type NodeKey = (String, Option<String>);

/// Edges keyed by `(subject type, subject relation)`. Built once per schema.
#[derive(Debug, Default)]
pub struct ReverseIndex {
    edges: HashMap<NodeKey, Vec<ReverseEdge>>,
}

impl ReverseIndex {
    pub fn build(schema: &Schema) -> Self {
        let mut index = Self::default();

        for definition in schema.entity_types() {
            for relation in &definition.relations {
                for allowed in &relation.allowed_subjects {
                    index.add(
                        &allowed.entity_type,
                        allowed.relation.as_deref(),
                        ReverseEdge::Stored {
                            entity_type: definition.name.clone(),
                            relation: relation.name.clone(),
                        },
                    );
                }
            }

            for permission in &definition.permissions {
                permission.expression.visit(&mut |node| match node {
                    PermissionExpression::Relation { name }
                    | PermissionExpression::Permission { name } => index.add(
                        &definition.name,
                        Some(name),
                        ReverseEdge::Computed {
                            permission: permission.name.clone(),
                        },
                    ),
                    PermissionExpression::Indirect { tupleset, computed } => {
                        let related = definition
                            .find_relation(tupleset)
                            .map(|r| r.allowed_subjects.as_slice())
                            .unwrap_or_default();
                        for reference in related.iter().filter(|r| r.relation.is_none()) {
                            index.add(
                                &reference.entity_type,
                                Some(computed),
                                ReverseEdge::TupleToUserset {
                                    entity_type: definition.name.clone(),
                                    tupleset: tupleset.clone(),
                                    permission: permission.name.clone(),
                                },
                            );
                        }
                    }
                    PermissionExpression::Union { .. }
                    | PermissionExpression::Intersection { .. }
                    | PermissionExpression::Exclusion { .. } => {}
                });
            }
        }

        index
    }

    pub fn edges(&self, subject_type: &str, relation: Option<&str>) -> &[ReverseEdge] {
        self.edges
            .get(&(subject_type.to_string(), relation.map(str::to_string)))
            .map_or(&[], Vec::as_slice)
    }

    fn add(&mut self, subject_type: &str, relation: Option<&str>, edge: ReverseEdge) {
        let edges = self
            .edges
            .entry((subject_type.to_string(), relation.map(str::to_string)))
            .or_default();
        if !edges.contains(&edge) {
            edges.push(edge);
        }
    }
}
