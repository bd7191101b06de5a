use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Typed authorization model: entity types with their relations and
/// permissions.
///
/// A `Schema` is always structurally valid; construction runs
/// [`Schema::validate`]. It is immutable afterwards and shared between
/// concurrent evaluations behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<EntityTypeDefinition>", into = "Vec<EntityTypeDefinition>")]
pub struct Schema {
    entity_types: HashMap<String, EntityTypeDefinition>,
}

impl Schema {
    /// Build and validate a schema from its entity type definitions.
    pub fn new(entity_types: impl IntoIterator<Item = EntityTypeDefinition>) -> Result<Self> {
        let mut map = HashMap::new();
        for definition in entity_types {
            if map.contains_key(&definition.name) {
                return Err(EngineError::InvalidSchema(format!(
                    "entity type '{}' defined twice",
                    definition.name
                )));
            }
            map.insert(definition.name.clone(), definition);
        }

        let schema = Self { entity_types: map };
        schema.validate()?;
        Ok(schema)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &EntityTypeDefinition> {
        self.entity_types.values()
    }

    pub fn entity_type(&self, name: &str) -> Result<&EntityTypeDefinition> {
        self.entity_types
            .get(name)
            .ok_or_else(|| EngineError::EntityTypeUndefined {
                entity_type: name.to_string(),
            })
    }

    /// Resolve a permission-or-relation name on an entity type.
    pub fn resolve(&self, entity_type: &str, name: &str) -> Result<Definition<'_>> {
        let definition = self.entity_type(entity_type)?;
        definition
            .find(name)
            .ok_or_else(|| EngineError::PermissionUndefined {
                entity_type: entity_type.to_string(),
                permission: name.to_string(),
            })
    }

    pub fn relation(&self, entity_type: &str, relation: &str) -> Result<&RelationDefinition> {
        self.entity_type(entity_type)?
            .find_relation(relation)
            .ok_or_else(|| EngineError::RelationUndefined {
                entity_type: entity_type.to_string(),
                relation: relation.to_string(),
            })
    }

    pub fn permission(&self, entity_type: &str, permission: &str) -> Result<&PermissionDefinition> {
        self.entity_type(entity_type)?
            .find_permission(permission)
            .ok_or_else(|| EngineError::PermissionUndefined {
                entity_type: entity_type.to_string(),
                permission: permission.to_string(),
            })
    }

    /// Validate that every reference in the schema points at something that
    /// exists.
    pub fn validate(&self) -> Result<()> {
        for (key, entity_type) in &self.entity_types {
            if key != &entity_type.name {
                return Err(EngineError::InvalidSchema(format!(
                    "entity type key '{}' doesn't match name '{}'",
                    key, entity_type.name
                )));
            }
            entity_type.check_unique_names()?;

            for relation in &entity_type.relations {
                for reference in &relation.allowed_subjects {
                    self.validate_reference(entity_type, relation, reference)?;
                }
            }

            for permission in &entity_type.permissions {
                let mut problem = None;
                permission.expression.visit(&mut |node| {
                    if problem.is_none() {
                        problem = self.validate_node(entity_type, node).err();
                    }
                });
                if let Some(message) = problem {
                    return Err(EngineError::InvalidSchema(format!(
                        "permission '{}#{}': {}",
                        entity_type.name, permission.name, message
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_reference(
        &self,
        owner: &EntityTypeDefinition,
        relation: &RelationDefinition,
        reference: &RelationReference,
    ) -> Result<()> {
        let target = self.entity_types.get(&reference.entity_type).ok_or_else(|| {
            EngineError::InvalidSchema(format!(
                "relation '{}#{}' references unknown entity type '{}'",
                owner.name, relation.name, reference.entity_type
            ))
        })?;
        if let Some(subject_relation) = &reference.relation {
            if target.find(subject_relation).is_none() {
                return Err(EngineError::InvalidSchema(format!(
                    "relation '{}#{}' references unknown '{}'",
                    owner.name, relation.name, reference
                )));
            }
        }
        Ok(())
    }

    fn validate_node(
        &self,
        owner: &EntityTypeDefinition,
        node: &PermissionExpression,
    ) -> std::result::Result<(), String> {
        match node {
            PermissionExpression::Relation { name } => owner
                .find_relation(name)
                .map(|_| ())
                .ok_or_else(|| format!("unknown relation '{name}'")),
            PermissionExpression::Permission { name } => owner
                .find_permission(name)
                .map(|_| ())
                .ok_or_else(|| format!("unknown permission '{name}'")),
            PermissionExpression::Indirect { tupleset, computed } => {
                let relation = owner
                    .find_relation(tupleset)
                    .ok_or_else(|| format!("unknown tupleset relation '{tupleset}'"))?;
                for reference in &relation.allowed_subjects {
                    if reference.relation.is_some() {
                        return Err(format!(
                            "tupleset relation '{tupleset}' must reference plain entity types, found '{reference}'"
                        ));
                    }
                    let target = self
                        .entity_types
                        .get(&reference.entity_type)
                        .ok_or_else(|| format!("unknown entity type '{}'", reference.entity_type))?;
                    if target.find(computed).is_none() {
                        return Err(format!(
                            "'{}' has no relation or permission '{computed}'",
                            reference.entity_type
                        ));
                    }
                }
                Ok(())
            }
            PermissionExpression::Union { .. }
            | PermissionExpression::Intersection { .. }
            | PermissionExpression::Exclusion { .. } => Ok(()),
        }
    }
}

impl TryFrom<Vec<EntityTypeDefinition>> for Schema {
    type Error = EngineError;

    fn try_from(value: Vec<EntityTypeDefinition>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Schema> for Vec<EntityTypeDefinition> {
    fn from(schema: Schema) -> Self {
        let mut types: Vec<_> = schema.entity_types.into_values().collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }
}

/// A resolved permission-or-relation name.
#[derive(Debug, Clone, Copy)]
pub enum Definition<'a> {
    Relation(&'a RelationDefinition),
    Permission(&'a PermissionDefinition),
}

/// Definition of an entity type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityTypeDefinition {
    pub name: String,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
    #[serde(default)]
    pub permissions: Vec<PermissionDefinition>,
}

impl EntityTypeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relations: Vec::new(),
            permissions: Vec::new(),
        }
    }

    /// Add a relation. Subject references are written `user` or
    /// `workspace#member`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchema` when a reference is malformed.
    pub fn relation(mut self, name: impl Into<String>, allowed_subjects: &[&str]) -> Result<Self> {
        let allowed_subjects = allowed_subjects
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<RelationReference>>>()?;
        self.relations.push(RelationDefinition {
            name: name.into(),
            allowed_subjects,
        });
        Ok(self)
    }

    #[must_use]
    pub fn permission(mut self, name: impl Into<String>, expression: PermissionExpression) -> Self {
        self.permissions.push(PermissionDefinition {
            name: name.into(),
            expression,
        });
        self
    }

    pub fn find(&self, name: &str) -> Option<Definition<'_>> {
        self.find_relation(name)
            .map(Definition::Relation)
            .or_else(|| self.find_permission(name).map(Definition::Permission))
    }

    pub fn find_relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn find_permission(&self, name: &str) -> Option<&PermissionDefinition> {
        self.permissions.iter().find(|p| p.name == name)
    }

    fn check_unique_names(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        let names = self
            .relations
            .iter()
            .map(|r| &r.name)
            .chain(self.permissions.iter().map(|p| &p.name));
        for name in names {
            if !seen.insert(name) {
                return Err(EngineError::InvalidSchema(format!(
                    "'{}' defined twice on entity type '{}'",
                    name, self.name
                )));
            }
        }
        Ok(())
    }
}

/// Definition of a stored relation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: String,
    pub allowed_subjects: Vec<RelationReference>,
}

impl RelationDefinition {
    /// Whether a tuple with this subject type and subject relation may be
    /// stored under the relation.
    pub fn allows(&self, subject_type: &str, subject_relation: Option<&str>) -> bool {
        self.allowed_subjects
            .iter()
            .any(|r| r.entity_type == subject_type && r.relation.as_deref() == subject_relation)
    }
}

/// Allowed subject of a relation: `user`, or `workspace#member`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationReference {
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
}

impl fmt::Display for RelationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(relation) => write!(f, "{}#{}", self.entity_type, relation),
            None => f.write_str(&self.entity_type),
        }
    }
}

impl FromStr for RelationReference {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (entity_type, relation) = match s.split_once('#') {
            Some((entity_type, relation)) => (entity_type, Some(relation)),
            None => (s, None),
        };
        if entity_type.is_empty() || relation.is_some_and(str::is_empty) {
            return Err(EngineError::InvalidSchema(format!(
                "malformed subject reference '{s}'"
            )));
        }
        Ok(Self {
            entity_type: entity_type.to_string(),
            relation: relation.map(str::to_string),
        })
    }
}

/// Definition of a computed permission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDefinition {
    pub name: String,
    pub expression: PermissionExpression,
}

/// Boolean expression over relations and permissions of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PermissionExpression {
    /// A stored relation on the same entity.
    Relation { name: String },
    /// Another permission on the same entity.
    Permission { name: String },
    Union { children: Vec<PermissionExpression> },
    Intersection { children: Vec<PermissionExpression> },
    Exclusion {
        base: Box<PermissionExpression>,
        subtrahend: Box<PermissionExpression>,
    },
    /// `tupleset.computed`: follow `tupleset` to related entities and
    /// evaluate `computed` there.
    Indirect { tupleset: String, computed: String },
}

impl PermissionExpression {
    pub fn relation(name: impl Into<String>) -> Self {
        Self::Relation { name: name.into() }
    }

    pub fn permission(name: impl Into<String>) -> Self {
        Self::Permission { name: name.into() }
    }

    pub fn union(children: impl IntoIterator<Item = Self>) -> Self {
        Self::Union {
            children: children.into_iter().collect(),
        }
    }

    pub fn intersection(children: impl IntoIterator<Item = Self>) -> Self {
        Self::Intersection {
            children: children.into_iter().collect(),
        }
    }

    pub fn exclusion(base: Self, subtrahend: Self) -> Self {
        Self::Exclusion {
            base: Box::new(base),
            subtrahend: Box::new(subtrahend),
        }
    }

    pub fn indirect(tupleset: impl Into<String>, computed: impl Into<String>) -> Self {
        Self::Indirect {
            tupleset: tupleset.into(),
            computed: computed.into(),
        }
    }

    /// Pre-order walk over every node.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a PermissionExpression)) {
        f(self);
        match self {
            Self::Union { children } | Self::Intersection { children } => {
                for child in children {
                    child.visit(f);
                }
            }
            Self::Exclusion { base, subtrahend } => {
                base.visit(f);
                subtrahend.visit(f);
            }
            Self::Relation { .. } | Self::Permission { .. } | Self::Indirect { .. } => {}
        }
    }

    fn is_leaf(&self) -> bool {
        matches!(
            self,
            Self::Relation { .. } | Self::Permission { .. } | Self::Indirect { .. }
        )
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_leaf() {
            write!(f, "{self}")
        } else {
            write!(f, "({self})")
        }
    }

    fn fmt_joined(children: &[Self], op: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                write!(f, " {op} ")?;
            }
            child.fmt_operand(f)?;
        }
        Ok(())
    }
}

impl fmt::Display for PermissionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relation { name } | Self::Permission { name } => f.write_str(name),
            Self::Union { children } => Self::fmt_joined(children, "or", f),
            Self::Intersection { children } => Self::fmt_joined(children, "and", f),
            Self::Exclusion { base, subtrahend } => {
                base.fmt_operand(f)?;
                f.write_str(" not ")?;
                subtrahend.fmt_operand(f)
            }
            Self::Indirect { tupleset, computed } => write!(f, "{tupleset}.{computed}"),
        }
    }
}
