//! Auxiliary keys kept in step with object rows: forward index buckets,
//! reverse relation markers, uniqueness claims and list-cache markers.
//!
//! Every change is recorded into the caller's transaction together with an
//! assertion on what was read, so it commits or fails with the row.

use std::collections::BTreeSet;

use hdal_schema::Hybrid;
use hdal_store::{StoreError, Transaction};
use hdal_types::Guid;
use serde_json::{json, Value};
use tracing::warn;

use crate::dal::Dal;
use crate::error::{DalError, DalResult};
use crate::object::{cell_guid, Row, NULL};

pub(crate) struct IndexMaintainer<'a> {
    dal: &'a Dal,
    hybrid: &'a Hybrid,
    guid: &'a Guid,
    key: &'a str,
}

fn field<'r>(row: &'r Row, name: &str) -> &'r Value {
    row.get(name).unwrap_or(&NULL)
}

impl<'a> IndexMaintainer<'a> {
    pub(crate) fn new(dal: &'a Dal, hybrid: &'a Hybrid, guid: &'a Guid, key: &'a str) -> Self {
        Self {
            dal,
            hybrid,
            guid,
            key,
        }
    }

    fn read(&self, key: &str) -> DalResult<Option<Value>> {
        match self.dal.persistent().get(key) {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Forward indexes
    // -----------------------------------------------------------------------

    /// Move this object between index buckets of every indexed property
    /// whose value changed; a new object joins all its buckets.
    pub(crate) fn update_forward(
        &self,
        tx: &mut Transaction,
        store: &Row,
        merged: &Row,
        changed: &[String],
        new: bool,
    ) -> DalResult<()> {
        for property in self.hybrid.properties().iter().filter(|p| p.indexed) {
            let value = field(merged, &property.name);
            if !new {
                if !changed.contains(&property.name) {
                    continue;
                }
                let old = field(store, &property.name);
                if old == value {
                    continue;
                }
                self.leave_bucket(tx, &property.name, old)?;
            }
            self.join_bucket(tx, &property.name, value)?;
        }
        Ok(())
    }

    /// Remove this object from every bucket it occupies according to `store`.
    pub(crate) fn clear_forward(&self, tx: &mut Transaction, store: &Row) -> DalResult<()> {
        for property in self.hybrid.properties().iter().filter(|p| p.indexed) {
            self.leave_bucket(tx, &property.name, field(store, &property.name))?;
        }
        Ok(())
    }

    fn join_bucket(&self, tx: &mut Transaction, property: &str, value: &Value) -> DalResult<()> {
        let bucket = self.dal.keys().index(self.hybrid.type_name(), property, value);
        match self.read(&bucket)? {
            None => {
                tx.assert_value(&bucket, None);
                tx.set(&bucket, json!([self.key]));
            }
            Some(Value::Array(members)) => {
                if members.iter().any(|m| m.as_str() == Some(self.key)) {
                    return Ok(());
                }
                tx.assert_value(&bucket, Some(Value::Array(members.clone())));
                let mut members = members;
                members.push(json!(self.key));
                tx.set(&bucket, Value::Array(members));
            }
            Some(_) => return Err(DalError::Serialization(format!("index bucket {bucket} is not a list"))),
        }
        Ok(())
    }

    fn leave_bucket(&self, tx: &mut Transaction, property: &str, value: &Value) -> DalResult<()> {
        let bucket = self.dal.keys().index(self.hybrid.type_name(), property, value);
        match self.read(&bucket)? {
            None => tx.assert_value(&bucket, None),
            Some(Value::Array(members)) => {
                if !members.iter().any(|m| m.as_str() == Some(self.key)) {
                    return Ok(());
                }
                tx.assert_value(&bucket, Some(Value::Array(members.clone())));
                let remaining: Vec<Value> = members
                    .into_iter()
                    .filter(|m| m.as_str() != Some(self.key))
                    .collect();
                if remaining.is_empty() {
                    tx.delete(&bucket, true);
                } else {
                    tx.set(&bucket, Value::Array(remaining));
                }
            }
            Some(_) => return Err(DalError::Serialization(format!("index bucket {bucket} is not a list"))),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Uniqueness claims
    // -----------------------------------------------------------------------

    /// Release claims on old values and claim new ones. Null values are
    /// never claimed.
    pub(crate) fn update_unique(
        &self,
        tx: &mut Transaction,
        store: &Row,
        merged: &Row,
        changed: &[String],
        new: bool,
    ) -> DalResult<()> {
        let keys = self.dal.keys();
        for property in self.hybrid.properties().iter().filter(|p| p.unique) {
            let touched = new || changed.contains(&property.name);
            if !new && touched {
                let old = field(store, &property.name);
                if !old.is_null() {
                    let claim = keys.unique(self.hybrid.type_name(), &property.name, old);
                    tx.assert_value(&claim, Some(json!(self.key)));
                    tx.delete(&claim, true);
                }
            }
            let value = field(merged, &property.name);
            if value.is_null() {
                continue;
            }
            let claim = keys.unique(self.hybrid.type_name(), &property.name, value);
            if touched {
                tx.assert_value(&claim, None);
            }
            tx.set(&claim, json!(self.key));
        }
        Ok(())
    }

    pub(crate) fn release_unique(&self, tx: &mut Transaction, store: &Row) -> DalResult<()> {
        let keys = self.dal.keys();
        for property in self.hybrid.properties().iter().filter(|p| p.unique) {
            let value = field(store, &property.name);
            if value.is_null() {
                continue;
            }
            let claim = keys.unique(self.hybrid.type_name(), &property.name, value);
            tx.assert_value(&claim, Some(json!(self.key)));
            tx.delete(&claim, true);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reverse relation markers
    // -----------------------------------------------------------------------

    /// Move the marker of every relation whose target changed. The new
    /// parent must exist when the transaction applies.
    pub(crate) fn update_reverse(&self, tx: &mut Transaction, store: &Row, merged: &Row) -> DalResult<()> {
        let keys = self.dal.keys();
        for relation in self.hybrid.relations() {
            let old = cell_guid(store, &relation.name)?;
            let new = cell_guid(merged, &relation.name)?;
            if old == new {
                continue;
            }
            let parent = self.dal.resolve(relation.target())?;
            if let Some(old) = old {
                tx.delete(
                    keys.reverse(parent.type_name(), &old, &relation.foreign_key, self.guid),
                    false,
                );
            }
            if let Some(new) = new {
                tx.assert_exists(keys.object(parent.type_name(), &new));
                tx.set(
                    keys.reverse(parent.type_name(), &new, &relation.foreign_key, self.guid),
                    json!(0),
                );
            }
        }
        Ok(())
    }

    pub(crate) fn clear_reverse(&self, tx: &mut Transaction, store: &Row) -> DalResult<()> {
        let keys = self.dal.keys();
        for relation in self.hybrid.relations() {
            if let Some(parent_guid) = cell_guid(store, &relation.name)? {
                let parent = self.dal.resolve(relation.target())?;
                tx.delete(
                    keys.reverse(parent.type_name(), &parent_guid, &relation.foreign_key, self.guid),
                    false,
                );
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cached query results
    // -----------------------------------------------------------------------

    /// Evict cached lists of this type that depend on `changed` fields (all
    /// of them for `None`) and drop their markers.
    pub(crate) fn invalidate_lists(&self, tx: &mut Transaction, changed: Option<&[String]>) -> DalResult<()> {
        let keys = self.dal.keys();
        let type_name = self.hybrid.type_name().as_str();
        let prefix = keys.list_cache_prefix(type_name, None);
        let mut evicted = BTreeSet::new();
        for marker in self.dal.persistent().prefix(&prefix)? {
            match keys.parse_list_cache_marker(&marker) {
                Ok(parsed) => {
                    if changed.map_or(true, |fields| fields.contains(&parsed.field)) {
                        evicted.insert(parsed.cache_key);
                    }
                }
                Err(e) => warn!(marker = %marker, error = %e, "ignoring malformed list cache marker"),
            }
        }
        for cache_key in &evicted {
            self.dal.volatile().delete(cache_key)?;
        }
        match changed {
            None => tx.delete_prefix(prefix),
            Some(fields) => {
                for name in fields {
                    tx.delete_prefix(keys.list_cache_prefix(type_name, Some(name)));
                }
            }
        }
        Ok(())
    }
}
