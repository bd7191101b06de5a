use crate::{error::EngineError, snapshot::SnapshotToken};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A typed, identified object in the authorization model (`page:readme`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_type, id) = s
            .split_once(':')
            .ok_or_else(|| EngineError::InvalidTuple(format!("expected `type:id`, got `{s}`")))?;
        if entity_type.is_empty() || id.is_empty() {
            return Err(EngineError::InvalidTuple(format!(
                "entity type and id must be non-empty in `{s}`"
            )));
        }
        Ok(Self::new(entity_type, id))
    }
}

/// A subject: either a concrete individual (`user:alice`) or a userset
/// (`workspace:acme#member`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectRef {
    pub subject_type: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
}

impl SubjectRef {
    pub fn new(subject_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            subject_type: subject_type.into(),
            id: id.into(),
            relation: None,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new("user", id)
    }

    pub fn userset(
        subject_type: impl Into<String>,
        id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            subject_type: subject_type.into(),
            id: id.into(),
            relation: Some(relation.into()),
        }
    }

    pub fn is_userset(&self) -> bool {
        self.relation.is_some()
    }

    /// The entity part of the subject, dropping any relation.
    pub fn entity(&self) -> EntityRef {
        EntityRef::new(self.subject_type.clone(), self.id.clone())
    }
}

impl From<EntityRef> for SubjectRef {
    fn from(entity: EntityRef) -> Self {
        Self {
            subject_type: entity.entity_type,
            id: entity.id,
            relation: None,
        }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(relation) => write!(f, "{}:{}#{}", self.subject_type, self.id, relation),
            None => write!(f, "{}:{}", self.subject_type, self.id),
        }
    }
}

impl FromStr for SubjectRef {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity, relation) = match s.split_once('#') {
            Some((entity, relation)) if !relation.is_empty() => (entity, Some(relation)),
            Some(_) => {
                return Err(EngineError::InvalidTuple(format!(
                    "empty subject relation in `{s}`"
                )))
            }
            None => (s, None),
        };
        let entity: EntityRef = entity.parse()?;
        Ok(Self {
            subject_type: entity.entity_type,
            id: entity.id,
            relation: relation.map(str::to_string),
        })
    }
}

/// One relationship fact: `subject` holds `relation` on `entity`.
///
/// Written as `page:readme#reader@user:alice` or, for usersets,
/// `page:readme#reader@workspace:acme#member`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tuple {
    pub entity: EntityRef,
    pub relation: String,
    pub subject: SubjectRef,
}

impl Tuple {
    pub fn new(entity: EntityRef, relation: impl Into<String>, subject: SubjectRef) -> Self {
        Self {
            entity,
            relation: relation.into(),
            subject,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.entity, self.relation, self.subject)
    }
}

impl FromStr for Tuple {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (left, subject) = s
            .split_once('@')
            .ok_or_else(|| EngineError::InvalidTuple(format!("missing `@` in `{s}`")))?;
        let (entity, relation) = left
            .split_once('#')
            .ok_or_else(|| EngineError::InvalidTuple(format!("missing relation in `{s}`")))?;
        if relation.is_empty() {
            return Err(EngineError::InvalidTuple(format!("empty relation in `{s}`")));
        }
        Ok(Self {
            entity: entity.parse()?,
            relation: relation.to_string(),
            subject: subject.parse()?,
        })
    }
}

/// Selects relationship tuples. Unset fields and empty id lists match
/// anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleFilter {
    pub entity_type: Option<String>,
    pub entity_ids: Vec<String>,
    pub relation: Option<String>,
    pub subject_type: Option<String>,
    pub subject_ids: Vec<String>,
    pub subject_relation: Option<String>,
}

impl TupleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tuples stored on `entity` under `relation`.
    pub fn for_relation(entity: &EntityRef, relation: &str) -> Self {
        Self::new()
            .entity_type(&entity.entity_type)
            .entity_id(&entity.id)
            .relation(relation)
    }

    #[must_use]
    pub fn entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    #[must_use]
    pub fn entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_ids.push(id.into());
        self
    }

    #[must_use]
    pub fn relation(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    #[must_use]
    pub fn subject_type(mut self, subject_type: impl Into<String>) -> Self {
        self.subject_type = Some(subject_type.into());
        self
    }

    #[must_use]
    pub fn subject_id(mut self, id: impl Into<String>) -> Self {
        self.subject_ids.push(id.into());
        self
    }

    #[must_use]
    pub fn subject_relation(mut self, relation: impl Into<String>) -> Self {
        self.subject_relation = Some(relation.into());
        self
    }

    pub fn matches(&self, tuple: &Tuple) -> bool {
        fn field(expected: Option<&String>, actual: &str) -> bool {
            expected.map_or(true, |e| e == actual)
        }
        fn ids(expected: &[String], actual: &str) -> bool {
            expected.is_empty() || expected.iter().any(|e| e == actual)
        }

        field(self.entity_type.as_ref(), &tuple.entity.entity_type)
            && ids(&self.entity_ids, &tuple.entity.id)
            && field(self.relation.as_ref(), &tuple.relation)
            && field(self.subject_type.as_ref(), &tuple.subject.subject_type)
            && ids(&self.subject_ids, &tuple.subject.id)
            && self
                .subject_relation
                .as_ref()
                .map_or(true, |r| tuple.subject.relation.as_ref() == Some(r))
    }
}

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Self::Allowed
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allowed => f.write_str("allowed"),
            Self::Denied => f.write_str("denied"),
        }
    }
}

/// Authorization check request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub entity: EntityRef,
    pub permission: String,
    pub subject: SubjectRef,
    /// Read at this snapshot; the store head when absent.
    #[serde(default)]
    pub snapshot: Option<SnapshotToken>,
    #[serde(default)]
    pub contextual_tuples: Vec<Tuple>,
}

impl CheckRequest {
    pub fn new(entity: EntityRef, permission: impl Into<String>, subject: SubjectRef) -> Self {
        Self {
            entity,
            permission: permission.into(),
            subject,
            snapshot: None,
            contextual_tuples: Vec::new(),
        }
    }

    #[must_use]
    pub fn at_snapshot(mut self, snapshot: SnapshotToken) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    #[must_use]
    pub fn with_contextual_tuples(mut self, tuples: Vec<Tuple>) -> Self {
        self.contextual_tuples = tuples;
        self
    }
}

/// Authorization check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub decision: Decision,
    /// The snapshot every read of this check was pinned to.
    pub snapshot: SnapshotToken,
    pub metadata: CheckMetadata,
}

impl CheckResponse {
    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckMetadata {
    /// Number of sub-evaluations dispatched, including the root.
    pub dispatch_count: u64,
    pub cache_hits: u64,
    pub store_queries: u64,
}

/// Expand request: the full userset tree behind a permission or relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandRequest {
    pub entity: EntityRef,
    pub permission: String,
    #[serde(default)]
    pub snapshot: Option<SnapshotToken>,
    #[serde(default)]
    pub contextual_tuples: Vec<Tuple>,
}

impl ExpandRequest {
    pub fn new(entity: EntityRef, permission: impl Into<String>) -> Self {
        Self {
            entity,
            permission: permission.into(),
            snapshot: None,
            contextual_tuples: Vec::new(),
        }
    }

    #[must_use]
    pub fn at_snapshot(mut self, snapshot: SnapshotToken) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    #[must_use]
    pub fn with_contextual_tuples(mut self, tuples: Vec<Tuple>) -> Self {
        self.contextual_tuples = tuples;
        self
    }
}

/// Which entities of `entity_type` may `subject` act on with `permission`?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupEntityRequest {
    pub entity_type: String,
    pub permission: String,
    pub subject: SubjectRef,
    #[serde(default)]
    pub snapshot: Option<SnapshotToken>,
    #[serde(default)]
    pub contextual_tuples: Vec<Tuple>,
}

impl LookupEntityRequest {
    pub fn new(
        entity_type: impl Into<String>,
        permission: impl Into<String>,
        subject: SubjectRef,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            permission: permission.into(),
            subject,
            snapshot: None,
            contextual_tuples: Vec::new(),
        }
    }

    #[must_use]
    pub fn at_snapshot(mut self, snapshot: SnapshotToken) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    #[must_use]
    pub fn with_contextual_tuples(mut self, tuples: Vec<Tuple>) -> Self {
        self.contextual_tuples = tuples;
        self
    }
}

/// Which subjects of `subject_type` may act on `entity` with `permission`?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupSubjectRequest {
    pub entity: EntityRef,
    pub permission: String,
    pub subject_type: String,
    #[serde(default)]
    pub snapshot: Option<SnapshotToken>,
    #[serde(default)]
    pub contextual_tuples: Vec<Tuple>,
}

impl LookupSubjectRequest {
    pub fn new(
        entity: EntityRef,
        permission: impl Into<String>,
        subject_type: impl Into<String>,
    ) -> Self {
        Self {
            entity,
            permission: permission.into(),
            subject_type: subject_type.into(),
            snapshot: None,
            contextual_tuples: Vec::new(),
        }
    }

    #[must_use]
    pub fn at_snapshot(mut self, snapshot: SnapshotToken) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    #[must_use]
    pub fn with_contextual_tuples(mut self, tuples: Vec<Tuple>) -> Self {
        self.contextual_tuples = tuples;
        self
    }
}

/// Page selector for the paged lookup variants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageRequest {
    pub page_size: usize,
    /// Marker returned with the previous page.
    #[serde(default)]
    pub continuation: Option<String>,
}

impl PageRequest {
    pub fn first(page_size: usize) -> Self {
        Self {
            page_size,
            continuation: None,
        }
    }

    pub fn after(page_size: usize, continuation: impl Into<String>) -> Self {
        Self {
            page_size,
            continuation: Some(continuation.into()),
        }
    }
}

/// One page of lookup results, ordered by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupPage {
    pub ids: Vec<String>,
    /// Present when more ids follow.
    pub continuation: Option<String>,
    pub snapshot: SnapshotToken,
}
