use std::time::Duration;

use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::transaction::Transaction;

/// Fast, lossy key-value cache (memcached-like).
///
/// Implementations may evict any entry at any time. A `ttl` of `None` means
/// "no explicit expiry".
pub trait VolatileStore: Send + Sync {
    /// Read a key. Returns `Ok(None)` on a miss or after expiry.
    fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Write a key unconditionally.
    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()>;

    /// Write a key only if it is absent. Returns `true` if written.
    ///
    /// This is the primitive the distributed mutex is built on.
    fn add(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<bool>;

    /// Remove a key. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Durable transactional key-value store (Arakoon-like).
///
/// Implementations must satisfy these invariants:
/// - [`apply_transaction`](Self::apply_transaction) is atomic: all operations
///   apply or none do.
/// - Operations run in recorded order; assertions observe earlier writes of
///   the same transaction.
/// - Conflicts surface as [`StoreError::AssertFailed`] or
///   [`StoreError::KeyNotFound`] naming the offending key.
/// - Prefix enumeration is in ascending key order.
pub trait PersistentStore: Send + Sync {
    /// Read a key, failing with [`StoreError::KeyNotFound`] if absent.
    fn get(&self, key: &str) -> StoreResult<Value>;

    /// All keys starting with `prefix`, ascending.
    fn prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// All key-value pairs whose key starts with `prefix`, ascending.
    fn prefix_entries(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>>;

    /// Apply a transaction atomically.
    fn apply_transaction(&self, transaction: Transaction) -> StoreResult<()>;

    /// Read several keys at once, preserving order.
    ///
    /// With `must_exist` the first missing key fails the whole call;
    /// otherwise missing keys yield `None`.
    fn get_multi(&self, keys: &[String], must_exist: bool) -> StoreResult<Vec<Option<Value>>> {
        keys.iter()
            .map(|key| match self.get(key) {
                Ok(value) => Ok(Some(value)),
                Err(StoreError::KeyNotFound(_)) if !must_exist => Ok(None),
                Err(e) => Err(e),
            })
            .collect()
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(StoreError::KeyNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Start recording a transaction.
    fn begin_transaction(&self) -> Transaction {
        Transaction::new()
    }

    fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        let mut tx = self.begin_transaction();
        tx.set(key, value);
        self.apply_transaction(tx)
    }

    fn delete(&self, key: &str, must_exist: bool) -> StoreResult<()> {
        let mut tx = self.begin_transaction();
        tx.delete(key, must_exist);
        self.apply_transaction(tx)
    }

    fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        let mut tx = self.begin_transaction();
        tx.delete_prefix(prefix);
        self.apply_transaction(tx)
    }
}
