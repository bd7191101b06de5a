use crate::{
    error::Result,
    graph::{ReverseEdge, ReverseIndex},
    lookup::{confirm, Candidate, Sink},
    models::{EntityRef, SubjectRef, TupleFilter},
    scope::RequestScope,
};
use ahash::AHashSet;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

/// Finds the entities of one type a subject holds a permission on.
///
/// Walks the [`ReverseIndex`] outwards from the subject, one level at a
/// time, using store queries filtered by subject. Every userset node
/// `T:id#name` reached with the requested type and permission is a
/// candidate; candidates are confirmed with a forward check so that
/// intersections and exclusions are honoured.
#[derive(Clone, Copy)]
pub struct LookupEntityEngine<'s> {
    scope: &'s RequestScope,
    index: &'s ReverseIndex,
}

impl<'s> LookupEntityEngine<'s> {
    pub fn new(scope: &'s RequestScope, index: &'s ReverseIndex) -> Self {
        Self { scope, index }
    }

    pub(crate) async fn run(
        self,
        entity_type: &str,
        permission: &str,
        subject: &SubjectRef,
        sink: &Sink,
    ) -> Result<()> {
        let schema = &self.scope.schema;
        schema.resolve(entity_type, permission)?;
        schema.entity_type(&subject.subject_type)?;

        let is_target = |node: &SubjectRef| {
            node.subject_type == entity_type && node.relation.as_deref() == Some(permission)
        };

        let mut visited = AHashSet::new();
        visited.insert(subject.clone());
        let mut frontier = vec![subject.clone()];
        let mut emitted = AHashSet::new();
        let mut pending = Vec::new();
        if is_target(subject) {
            emitted.insert(subject.id.clone());
            pending.push(candidate(entity_type, &subject.id, subject));
        }

        let mut level = 0_u32;
        while !frontier.is_empty() {
            self.scope.ensure_active()?;

            let current = std::mem::take(&mut frontier);
            let reached: Vec<Vec<SubjectRef>> = stream::iter(
                current
                    .into_iter()
                    .map(move |node| async move { self.neighbours(&node).await }),
            )
            .buffer_unordered(self.scope.fan_out_limit())
            .try_collect()
            .await?;

            for node in reached.into_iter().flatten() {
                if !visited.insert(node.clone()) {
                    continue;
                }
                if is_target(&node) && emitted.insert(node.id.clone()) {
                    pending.push(candidate(entity_type, &node.id, subject));
                }
                frontier.push(node);
            }

            debug!(
                level,
                frontier = frontier.len(),
                candidates = pending.len(),
                "Lookup entity level walked"
            );
            level += 1;

            if !confirm(self.scope, permission, std::mem::take(&mut pending), sink).await? {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Nodes reachable from `node` in one reverse step.
    async fn neighbours(self, node: &SubjectRef) -> Result<Vec<SubjectRef>> {
        let mut reached = Vec::new();

        for edge in self.index.edges(&node.subject_type, node.relation.as_deref()) {
            match edge {
                ReverseEdge::Stored {
                    entity_type,
                    relation,
                } => {
                    let mut filter = TupleFilter::new()
                        .entity_type(entity_type)
                        .relation(relation)
                        .subject_type(&node.subject_type)
                        .subject_id(&node.id);
                    if let Some(subject_relation) = &node.relation {
                        filter = filter.subject_relation(subject_relation);
                    }
                    let tuples = self.scope.query(&filter).await?;
                    reached.extend(
                        tuples
                            .into_iter()
                            .filter(|t| t.subject == *node)
                            .map(|t| SubjectRef::userset(t.entity.entity_type, t.entity.id, relation)),
                    );
                }
                ReverseEdge::Computed { permission } => {
                    reached.push(SubjectRef::userset(
                        &node.subject_type,
                        &node.id,
                        permission,
                    ));
                }
                ReverseEdge::TupleToUserset {
                    entity_type,
                    tupleset,
                    permission,
                } => {
                    let filter = TupleFilter::new()
                        .entity_type(entity_type)
                        .relation(tupleset)
                        .subject_type(&node.subject_type)
                        .subject_id(&node.id);
                    let tuples = self.scope.query(&filter).await?;
                    reached.extend(tuples.into_iter().map(|t| {
                        SubjectRef::userset(t.entity.entity_type, t.entity.id, permission)
                    }));
                }
            }
        }

        Ok(reached)
    }
}

fn candidate(entity_type: &str, id: &str, subject: &SubjectRef) -> Candidate {
    Candidate {
        id: id.to_string(),
        entity: EntityRef::new(entity_type, id),
        subject: subject.clone(),
    }
}
