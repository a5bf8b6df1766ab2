/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The key does not exist (plain read, or `must_exist` delete).
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A transactional assertion did not hold.
    #[error("assertion failed on key: {0}")]
    AssertFailed(String),

    /// A distributed mutex could not be acquired within the wait budget.
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal lock was poisoned by a panicking writer.
    #[error("store lock poisoned: {0}")]
    Poisoned(String),
}

impl StoreError {
    /// The key named by a transactional conflict, if this is one.
    pub fn conflict_key(&self) -> Option<&str> {
        match self {
            Self::KeyNotFound(key) | Self::AssertFailed(key) => Some(key),
            _ => None,
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
