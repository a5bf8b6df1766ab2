use hdal_types::TypeError;

/// Errors raised while declaring or resolving a schema.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("type {0} declared more than once")]
    DuplicateType(String),

    #[error("type {type_name} declares attribute {name} more than once")]
    DuplicateAttribute { type_name: String, name: String },

    #[error("type {type_name}: attribute name {name:?} is reserved")]
    ReservedAttribute { type_name: String, name: String },

    #[error("unknown type {0}")]
    UnknownType(String),

    /// A relation points at a type that has no resolvable implementation.
    #[error("relation {type_name}.{relation} targets unknown type {target}")]
    UnresolvedRelation {
        type_name: String,
        relation: String,
        target: String,
    },

    #[error("type {type_name} extends {base}, which is itself an extension")]
    NestedExtension { type_name: String, base: String },

    #[error("type {base} is extended by both {first} and {second}")]
    ConflictingExtensions {
        base: String,
        first: String,
        second: String,
    },

    #[error("type {type_name}: property {property} cannot be {flag}: {reason}")]
    InvalidFlag {
        type_name: String,
        property: String,
        flag: &'static str,
        reason: String,
    },

    #[error("type {type_name}: reverse relation {name} clashes with an existing attribute")]
    ForeignNameClash { type_name: String, name: String },

    #[error("schema parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;
