use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid guid: {0}")]
    InvalidGuid(String),

    #[error("invalid type name {name:?}: {reason}")]
    InvalidTypeName { name: String, reason: String },

    #[error("malformed key: {0}")]
    MalformedKey(String),
}
