//! Multi-key transactions with value assertions.
//!
//! A [`Transaction`] is a recorded sequence of [`Operation`]s. Nothing
//! touches the store until the sequence is handed to
//! [`PersistentStore::apply_transaction`](crate::PersistentStore::apply_transaction).

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// One recorded step of a transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Set { key: String, value: Value },
    Delete { key: String, must_exist: bool },
    DeletePrefix { prefix: String },
    /// `expected == None` asserts the key is absent.
    AssertValue { key: String, expected: Option<Value> },
    AssertExists { key: String },
}

impl Operation {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Delete { key, .. }
            | Self::AssertValue { key, .. }
            | Self::AssertExists { key } => key,
            Self::DeletePrefix { prefix } => prefix,
        }
    }
}

/// An ordered batch of writes and assertions, applied atomically.
#[derive(Clone, Debug)]
pub struct Transaction {
    id: uuid::Uuid,
    operations: Vec<Operation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            operations: Vec::new(),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.operations.push(Operation::Set {
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, key: impl Into<String>, must_exist: bool) {
        self.operations.push(Operation::Delete {
            key: key.into(),
            must_exist,
        });
    }

    pub fn delete_prefix(&mut self, prefix: impl Into<String>) {
        self.operations.push(Operation::DeletePrefix {
            prefix: prefix.into(),
        });
    }

    /// Assert the key currently holds `expected` (or is absent for `None`).
    pub fn assert_value(&mut self, key: impl Into<String>, expected: Option<Value>) {
        self.operations.push(Operation::AssertValue {
            key: key.into(),
            expected,
        });
    }

    pub fn assert_exists(&mut self, key: impl Into<String>) {
        self.operations
            .push(Operation::AssertExists { key: key.into() });
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `operations` in order against `data`.
///
/// On error `data` is left partially modified; callers apply against a copy
/// and only publish it on success.
pub fn apply_operations(
    data: &mut BTreeMap<String, Value>,
    operations: &[Operation],
) -> StoreResult<()> {
    for operation in operations {
        match operation {
            Operation::Set { key, value } => {
                data.insert(key.clone(), value.clone());
            }
            Operation::Delete { key, must_exist } => {
                if data.remove(key).is_none() && *must_exist {
                    return Err(StoreError::KeyNotFound(key.clone()));
                }
            }
            Operation::DeletePrefix { prefix } => {
                let doomed: Vec<String> = data
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(prefix.as_str()))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in doomed {
                    data.remove(&key);
                }
            }
            Operation::AssertValue { key, expected } => {
                if data.get(key) != expected.as_ref() {
                    return Err(StoreError::AssertFailed(key.clone()));
                }
            }
            Operation::AssertExists { key } => {
                if !data.contains_key(key) {
                    return Err(StoreError::AssertFailed(key.clone()));
                }
            }
        }
    }
    Ok(())
}
