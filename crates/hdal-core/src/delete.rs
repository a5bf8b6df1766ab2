//! Delete: refuse or abandon linked children, then remove the row and its
//! auxiliary keys in one transaction.

use std::sync::Arc;

use hdal_store::StoreError;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{DalError, DalResult};
use crate::index::IndexMaintainer;
use crate::object::{borrow_mut, DataObject, ObjectRef, Row};

/// Which reverse relations a delete may detach instead of refusing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Abandon {
    /// Refuse while any child points here.
    #[default]
    Nothing,
    /// Clear the pointer on every child.
    All,
    /// Clear the pointer on children of the named reverse relations.
    Relations(Vec<String>),
}

impl Abandon {
    pub fn covers(&self, relation: &str) -> bool {
        match self {
            Self::Nothing => false,
            Self::All => true,
            Self::Relations(names) => names.iter().any(|n| n == relation),
        }
    }
}

impl DataObject {
    pub fn delete(&mut self) -> DalResult<()> {
        self.delete_with(&Abandon::Nothing)
    }

    pub fn delete_with(&mut self, abandon: &Abandon) -> DalResult<()> {
        self.ensure_persistable("deleted")?;
        if self.new {
            debug!(key = %self.key, "delete of unsaved object is a no-op");
            return Ok(());
        }

        let attempts = self.dal.config().max_attempts;
        let mut optimistic = true;
        let mut last_conflict = None;
        for attempt in 1..=attempts {
            self.release_children(abandon)?;
            let e = match self.try_delete(optimistic) {
                Ok(()) => return self.deleted(),
                Err(DalError::Store(e)) => e,
                Err(e) => return Err(e),
            };
            let Some(key) = e.conflict_key().map(str::to_string) else {
                return Err(DalError::Store(e));
            };
            if attempt == 1 && optimistic && self.dal.keys().is_unique_key(&key) {
                optimistic = false;
                continue;
            }
            if matches!(e, StoreError::KeyNotFound(_)) {
                if key == self.key {
                    return self.deleted();
                }
                return Err(DalError::Store(e));
            }
            debug!(attempt, key = %key, "delete conflict, retrying");
            last_conflict = Some(key);
            optimistic = false;
            if attempt < attempts {
                std::thread::sleep(self.dal.config().backoff());
            }
        }
        error!(
            type_name = %self.hybrid.name(),
            guid = %self.guid,
            attempts,
            last_conflict = ?last_conflict,
            "delete gave up"
        );
        Err(DalError::RaceCondition {
            type_name: self.hybrid.name().to_string(),
            guid: self.guid.to_string(),
            attempts,
            last_conflict,
        })
    }

    /// Refuse if children point here, unless their relation is abandoned,
    /// in which case their pointer is cleared and saved.
    fn release_children(&mut self, abandon: &Abandon) -> DalResult<()> {
        let foreign = self.hybrid.foreign_relations().to_vec();
        for relation in foreign {
            let list = self.relation_list(&relation.name)?;
            let count = list.len();
            if count == 0 {
                continue;
            }
            if !abandon.covers(&relation.name) {
                return Err(DalError::LinkedObject {
                    type_name: self.hybrid.name().to_string(),
                    relation: relation.name.clone(),
                    count,
                });
            }
            list.load_safe()?;
            let children: Vec<ObjectRef> = list.iter_loaded().collect();
            for child in children {
                let mut child = borrow_mut(&child)?;
                child.set_relation(&relation.child_key, None)?;
                match child.save() {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(key = %child.key(), "abandoned child vanished");
                    }
                    Err(e) => return Err(e),
                }
            }
            self.lists.remove(&relation.name);
        }
        Ok(())
    }

    fn try_delete(&self, optimistic: bool) -> DalResult<()> {
        let persistent = Arc::clone(self.dal.persistent());
        let mut tx = persistent.begin_transaction();
        let store: Row = if optimistic {
            tx.assert_value(&self.key, Some(Value::Object(self.original.clone())));
            self.original.clone()
        } else {
            match persistent.get(&self.key) {
                Ok(Value::Object(row)) => {
                    tx.assert_value(&self.key, Some(Value::Object(row.clone())));
                    row
                }
                Ok(_) => {
                    return Err(DalError::Serialization(format!(
                        "row {} is not an object",
                        self.key
                    )))
                }
                Err(e) => return Err(e.into()),
            }
        };
        tx.delete(&self.key, false);

        let maintainer = IndexMaintainer::new(&self.dal, &self.hybrid, &self.guid, &self.key);
        maintainer.clear_forward(&mut tx, &store)?;
        maintainer.clear_reverse(&mut tx, &store)?;
        maintainer.invalidate_lists(&mut tx, None)?;
        maintainer.release_unique(&mut tx, &store)?;
        persistent.apply_transaction(tx)?;
        Ok(())
    }

    fn deleted(&mut self) -> DalResult<()> {
        self.invalidate_dynamics(None)?;
        self.dal.volatile().delete(&self.key)?;
        self.dirty = false;
        debug!(key = %self.key, "deleted");
        Ok(())
    }
}
