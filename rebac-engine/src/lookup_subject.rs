use crate::{
    error::Result,
    lookup::{confirm, Candidate, Sink},
    models::{EntityRef, SubjectRef, TupleFilter},
    schema::{Definition, PermissionExpression},
    scope::RequestScope,
};
use ahash::AHashSet;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

/// A relation or permission on one entity, reached while walking forward.
type Node = (EntityRef, String);

#[derive(Debug, Default)]
struct Step {
    nodes: Vec<Node>,
    subjects: Vec<String>,
}

/// Finds the subjects of one type that hold a permission on an entity.
///
/// Walks the permission's expression forward from the entity, following
/// stored usersets and tupleset indirections, and collects every concrete
/// subject of the requested type it meets. Each one is then confirmed
/// with a forward check.
#[derive(Clone, Copy)]
pub struct LookupSubjectEngine<'s> {
    scope: &'s RequestScope,
}

impl<'s> LookupSubjectEngine<'s> {
    pub fn new(scope: &'s RequestScope) -> Self {
        Self { scope }
    }

    pub(crate) async fn run(
        self,
        entity: &EntityRef,
        permission: &str,
        subject_type: &str,
        sink: &Sink,
    ) -> Result<()> {
        let schema = &self.scope.schema;
        schema.resolve(&entity.entity_type, permission)?;
        schema.entity_type(subject_type)?;

        let start = (entity.clone(), permission.to_string());
        let mut visited = AHashSet::new();
        visited.insert(start.clone());
        let mut frontier = vec![start];
        let mut seen_subjects = AHashSet::new();

        while !frontier.is_empty() {
            self.scope.ensure_active()?;

            let current = std::mem::take(&mut frontier);
            let steps: Vec<Step> = stream::iter(current.into_iter().map(move |node| async move {
                self.successors(&node, subject_type).await
            }))
            .buffer_unordered(self.scope.fan_out_limit())
            .try_collect()
            .await?;

            let mut pending = Vec::new();
            for step in steps {
                for id in step.subjects {
                    if seen_subjects.insert(id.clone()) {
                        pending.push(Candidate {
                            entity: entity.clone(),
                            subject: SubjectRef::new(subject_type, &id),
                            id,
                        });
                    }
                }
                frontier.extend(step.nodes.into_iter().filter(|n| visited.insert(n.clone())));
            }

            debug!(
                frontier = frontier.len(),
                candidates = pending.len(),
                "Lookup subject level walked"
            );

            if !confirm(self.scope, permission, pending, sink).await? {
                return Ok(());
            }
        }

        Ok(())
    }

    async fn successors(self, node: &Node, subject_type: &str) -> Result<Step> {
        let (entity, name) = node;
        let mut step = Step::default();

        match self.scope.schema.resolve(&entity.entity_type, name)? {
            Definition::Relation(_) => {
                let tuples = self
                    .scope
                    .query(&TupleFilter::for_relation(entity, name))
                    .await?;
                for tuple in tuples {
                    let subject = tuple.subject;
                    match subject.relation {
                        Some(relation) => {
                            let related = EntityRef::new(subject.subject_type, subject.id);
                            step.nodes.push((related, relation));
                        }
                        None if subject.subject_type == subject_type => step.subjects.push(subject.id),
                        None => {}
                    }
                }
            }
            Definition::Permission(permission) => {
                let mut indirections = Vec::new();
                permission.expression.visit(&mut |expression| match expression {
                    PermissionExpression::Relation { name }
                    | PermissionExpression::Permission { name } => {
                        step.nodes.push((entity.clone(), name.clone()));
                    }
                    PermissionExpression::Indirect { tupleset, computed } => {
                        indirections.push((tupleset, computed));
                    }
                    PermissionExpression::Union { .. }
                    | PermissionExpression::Intersection { .. }
                    | PermissionExpression::Exclusion { .. } => {}
                });

                for (tupleset, computed) in indirections {
                    let tuples = self
                        .scope
                        .query(&TupleFilter::for_relation(entity, tupleset))
                        .await?;
                    step.nodes.extend(
                        tuples
                            .into_iter()
                            .map(|t| (t.subject.entity(), computed.clone())),
                    );
                }
            }
        }

        Ok(step)
    }
}
