use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Entity type not defined: {entity_type}")]
    EntityTypeUndefined { entity_type: String },

    #[error("Relation '{relation}' not defined on entity type '{entity_type}'")]
    RelationUndefined {
        entity_type: String,
        relation: String,
    },

    #[error("Permission '{permission}' not defined on entity type '{entity_type}'")]
    PermissionUndefined {
        entity_type: String,
        permission: String,
    },

    #[error("Relationship store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Relationship store error: {0}")]
    StoreError(String),

    #[error(
        "Maximum evaluation depth exceeded while checking {entity}#{permission} for {subject} (at `{expression}`)"
    )]
    DepthExceeded {
        entity: String,
        permission: String,
        subject: String,
        expression: String,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid snapshot token: {0}")]
    InvalidSnapshotToken(String),

    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid continuation token: {0}")]
    InvalidContinuation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Depth exhaustion only terminates one traversal path; sibling branches
    /// may still settle the enclosing combinator.
    pub fn is_path_termination(&self) -> bool {
        matches!(self, Self::DepthExceeded { .. })
    }

    /// Short label used for the `outcome` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EntityTypeUndefined { .. } => "entity_type_undefined",
            Self::RelationUndefined { .. } => "relation_undefined",
            Self::PermissionUndefined { .. } => "permission_undefined",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::StoreError(_) => "store_error",
            Self::DepthExceeded { .. } => "depth_exceeded",
            Self::Cancelled => "cancelled",
            Self::InvalidSnapshotToken(_) => "invalid_snapshot_token",
            Self::InvalidTuple(_) => "invalid_tuple",
            Self::InvalidSchema(_) => "invalid_schema",
            Self::InvalidContinuation(_) => "invalid_continuation",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
