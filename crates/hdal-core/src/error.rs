use hdal_schema::SchemaError;
use hdal_store::StoreError;

/// Errors surfaced by persistent objects and query lists.
#[derive(Debug, thiserror::Error)]
pub enum DalError {
    /// A row, or the target of one of its relations, is missing.
    #[error("{type_name} with guid {guid} {detail}")]
    ObjectNotFound {
        type_name: String,
        guid: String,
        detail: &'static str,
    },

    #[error("{type_name} is missing mandatory fields: {}", fields.join(", "))]
    MissingFields {
        type_name: String,
        fields: Vec<String>,
    },

    #[error("{type_name}.{field} allows {}, {given} given", allowed.join(" | "))]
    TypeMismatch {
        type_name: String,
        field: String,
        allowed: Vec<String>,
        given: String,
    },

    #[error("the value of {type_name}.{field} is already claimed by another object")]
    UniqueConstraintViolation { type_name: String, field: String },

    /// Fields changed both locally and in the store while the conflict
    /// policy was [`ConflictPolicy::Raise`](crate::ConflictPolicy::Raise).
    #[error("{type_name} has conflicting concurrent changes on: {}", fields.join(", "))]
    Concurrency {
        type_name: String,
        fields: Vec<String>,
    },

    #[error("{type_name} {guid}: gave up after {attempts} attempts (last conflict on {})", last_conflict.as_deref().unwrap_or("unknown key"))]
    RaceCondition {
        type_name: String,
        guid: String,
        attempts: u32,
        last_conflict: Option<String>,
    },

    #[error("{type_name} is still linked through {relation} ({count} objects)")]
    LinkedObject {
        type_name: String,
        relation: String,
        count: usize,
    },

    #[error("{type_name}.{relation} is singular but {count} objects point at it")]
    MultipleRelation {
        type_name: String,
        relation: String,
        count: usize,
    },

    /// A distributed mutex was not acquired within its wait budget.
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("{type_name} instance is volatile and cannot be {action}")]
    VolatileObject {
        type_name: String,
        action: &'static str,
    },

    #[error("no dynamic function bound for {type_name}.{name}")]
    UnboundDynamic { type_name: String, name: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("{0}")]
    Value(String),

    #[error("index {index} out of range for list of length {len}")]
    Index { index: isize, len: usize },

    #[error("{type_name} has no attribute {name}")]
    UnknownAttribute { type_name: String, name: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for DalError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LockUnavailable(key) => Self::LockUnavailable(key),
            other => Self::Store(other),
        }
    }
}

impl From<serde_json::Error> for DalError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for DalError {
    fn from(e: std::io::Error) -> Self {
        Self::Store(StoreError::Io(e))
    }
}

impl DalError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound { .. })
    }
}

/// Result alias for DAL operations.
pub type DalResult<T> = Result<T, DalError>;
