//! Persistent object: construction, loading and attribute access.
//!
//! The save and delete protocols live in their own modules; computed
//! properties in [`dynamic`](crate::dynamic).

use std::cell::{Ref, RefCell, RefMut};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use hdal_schema::{kind_of, Hybrid};
use hdal_store::StoreError;
use hdal_types::Guid;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::dal::Dal;
use crate::error::{DalError, DalResult};
use crate::list::DataList;

/// Stored form of an object: field name to value, plus `_version`.
pub type Row = Map<String, Value>;

/// Shared handle on an instance reached through a relation or a list.
pub type ObjectRef = Rc<RefCell<DataObject>>;

pub(crate) const VERSION_FIELD: &str = "_version";

pub(crate) static NULL: Value = Value::Null;

/// How `save` resolves a field changed both locally and in the store since
/// this instance last saw it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Keep the local value.
    #[default]
    LocalWins,
    /// Drop the local change and keep the stored value.
    DatastoreWins,
    /// Fail with [`DalError::Concurrency`] naming every conflicting field.
    Raise,
}

/// Where an instance's payload came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    New,
    Cached,
    Persistent,
    Provided,
}

/// One instance of a hybrid type.
///
/// Holds the current payload, the shadow copy of what this process last
/// read or wrote, memoized relation targets and reverse relation lists.
pub struct DataObject {
    pub(crate) dal: Dal,
    pub(crate) hybrid: Arc<Hybrid>,
    pub(crate) guid: Guid,
    pub(crate) key: String,
    pub(crate) new: bool,
    pub(crate) volatile: bool,
    pub(crate) policy: ConflictPolicy,
    pub(crate) data: Row,
    pub(crate) original: Row,
    pub(crate) dirty: bool,
    pub(crate) provenance: Provenance,
    pub(crate) objects: HashMap<String, (Guid, ObjectRef)>,
    pub(crate) lists: HashMap<String, DataList>,
    pub(crate) timings: HashMap<String, Duration>,
}

impl DataObject {
    // ---- Construction ----

    pub(crate) fn create(dal: Dal, hybrid: Arc<Hybrid>) -> Self {
        let mut row = Row::new();
        row.insert(VERSION_FIELD.into(), json!(0));
        Self::assemble(dal, hybrid, Guid::new(), row, true, Provenance::New)
    }

    pub(crate) fn load(dal: Dal, hybrid: Arc<Hybrid>, guid: Guid) -> DalResult<Self> {
        let key = dal.keys().object(hybrid.type_name(), &guid);
        let (row, provenance) = fetch_row(&dal, &hybrid, &guid, &key)?;
        let object = Self::assemble(dal, hybrid, guid, row.clone(), false, provenance);
        if provenance == Provenance::Persistent {
            object.cache_current_data(&row)?;
        }
        Ok(object)
    }

    pub(crate) fn hydrate(dal: Dal, hybrid: Arc<Hybrid>, guid: Guid, row: Row) -> Self {
        Self::assemble(dal, hybrid, guid, row, false, Provenance::Provided)
    }

    fn assemble(
        dal: Dal,
        hybrid: Arc<Hybrid>,
        guid: Guid,
        mut row: Row,
        new: bool,
        provenance: Provenance,
    ) -> Self {
        fill_defaults(&dal, &hybrid, &mut row);
        let key = dal.keys().object(hybrid.type_name(), &guid);
        Self {
            dal,
            hybrid,
            guid,
            key,
            new,
            volatile: false,
            policy: ConflictPolicy::default(),
            original: row.clone(),
            data: row,
            dirty: false,
            provenance,
            objects: HashMap::new(),
            lists: HashMap::new(),
            timings: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn set_policy(&mut self, policy: ConflictPolicy) {
        self.policy = policy;
    }

    pub(crate) fn mark_volatile(&mut self) {
        self.volatile = true;
    }

    /// Set every known property present in `data`; other fields are ignored.
    pub(crate) fn apply_properties(&mut self, data: &Map<String, Value>) -> DalResult<()> {
        for (name, value) in data {
            if self.hybrid.property(name).is_some() {
                self.set(name, value.clone())?;
            }
        }
        Ok(())
    }

    /// Populate the volatile cache with a freshly read row, unless another
    /// writer has moved the version on in the meantime.
    fn cache_current_data(&self, row: &Row) -> DalResult<()> {
        let mutex = self.dal.version_mutex(&self.hybrid, &self.guid);
        let _guard = match mutex.acquire(self.dal.config().lock_timeout) {
            Ok(guard) => guard,
            Err(StoreError::LockUnavailable(_)) => {
                debug!(key = %self.key, "version lock busy, not caching");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let current = match self.dal.persistent().get(&self.key) {
            Ok(Value::Object(current)) => current,
            Ok(_) => return Ok(()),
            Err(StoreError::KeyNotFound(_)) => return Err(self.not_found("could not be found")),
            Err(e) => return Err(e.into()),
        };
        if version_of(&current) == version_of(row) {
            self.dal
                .volatile()
                .set(&self.key, Value::Object(row.clone()), None)?;
        }
        Ok(())
    }

    // ---- Identity ----

    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Persistent store key of the row.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn hybrid(&self) -> &Arc<Hybrid> {
        &self.hybrid
    }

    /// Logical type name.
    pub fn type_name(&self) -> &str {
        self.hybrid.logical_name()
    }

    pub fn dal(&self) -> &Dal {
        &self.dal
    }

    pub fn is_new(&self) -> bool {
        self.new
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn version(&self) -> u64 {
        version_of(&self.data)
    }

    /// Current payload.
    pub fn data(&self) -> &Row {
        &self.data
    }

    // ---- Properties ----

    pub fn get(&self, name: &str) -> DalResult<&Value> {
        if self.hybrid.property(name).is_none() {
            return Err(self.unknown(name));
        }
        Ok(self.data.get(name).unwrap_or(&NULL))
    }

    /// Type-checked property write. `null` is always accepted; mandatory
    /// fields are checked on save.
    pub fn set(&mut self, name: &str, value: Value) -> DalResult<()> {
        let property = self
            .hybrid
            .property(name)
            .ok_or_else(|| self.unknown(name))?;
        property
            .ty
            .check(&value)
            .map_err(|failure| DalError::TypeMismatch {
                type_name: self.hybrid.name().to_string(),
                field: name.to_string(),
                allowed: failure.allowed,
                given: failure.given,
            })?;
        self.data.insert(name.to_string(), value);
        self.dirty = true;
        Ok(())
    }

    // ---- Relations ----

    pub fn relation_guid(&self, name: &str) -> DalResult<Option<Guid>> {
        if self.hybrid.relation(name).is_none() {
            return Err(self.unknown(name));
        }
        cell_guid(&self.data, name)
    }

    /// Target of a forward relation, loaded once and memoized.
    pub fn relation(&mut self, name: &str) -> DalResult<Option<ObjectRef>> {
        let relation = self
            .hybrid
            .relation(name)
            .ok_or_else(|| self.unknown(name))?;
        let Some(guid) = cell_guid(&self.data, name)? else {
            self.objects.remove(name);
            return Ok(None);
        };
        if let Some((memo, object)) = self.objects.get(name) {
            if *memo == guid {
                return Ok(Some(Rc::clone(object)));
            }
        }
        let target = self.dal.resolve(relation.target())?;
        let object = Rc::new(RefCell::new(DataObject::load(
            self.dal.clone(),
            target,
            guid,
        )?));
        self.objects
            .insert(name.to_string(), (guid, Rc::clone(&object)));
        Ok(Some(object))
    }

    /// Point a forward relation at `target`, or clear it with `None`.
    pub fn set_relation(&mut self, name: &str, target: Option<&DataObject>) -> DalResult<()> {
        let expected = self.relation_target(name)?;
        if let Some(target) = target {
            self.check_target(name, &expected, target)?;
        }
        self.data.insert(
            name.to_string(),
            relation_cell(&expected, target.map(|t| &t.guid)),
        );
        self.objects.remove(name);
        self.dirty = true;
        Ok(())
    }

    /// Like [`set_relation`](Self::set_relation), memoizing the shared
    /// handle so later reads return the same instance.
    pub fn set_relation_ref(&mut self, name: &str, target: Option<ObjectRef>) -> DalResult<()> {
        let Some(target) = target else {
            return self.set_relation(name, None);
        };
        let guid = {
            let object = borrow(&target)?;
            self.set_relation(name, Some(&object))?;
            object.guid
        };
        self.objects.insert(name.to_string(), (guid, target));
        Ok(())
    }

    fn relation_target(&self, name: &str) -> DalResult<Arc<Hybrid>> {
        let relation = self
            .hybrid
            .relation(name)
            .ok_or_else(|| self.unknown(name))?;
        self.dal.resolve(relation.target())
    }

    fn check_target(&self, name: &str, expected: &Hybrid, target: &DataObject) -> DalResult<()> {
        if target.hybrid.identifier() != expected.identifier() {
            return Err(DalError::TypeMismatch {
                type_name: self.hybrid.name().to_string(),
                field: name.to_string(),
                allowed: vec![expected.name().to_string()],
                given: target.hybrid.name().to_string(),
            });
        }
        Ok(())
    }

    /// Reverse relation as a list, merged into the previously returned list
    /// so already loaded children keep their identity. A one-to-one relation
    /// with more than one child is a `MultipleRelation` error.
    pub fn related(&mut self, name: &str) -> DalResult<&mut DataList> {
        let singular = self
            .hybrid
            .foreign_relation(name)
            .is_some_and(|foreign| !foreign.list);
        let type_name = self.hybrid.name().to_string();
        let list = self.relation_list(name)?;
        if singular && list.len() > 1 {
            return Err(DalError::MultipleRelation {
                type_name,
                relation: name.to_string(),
                count: list.len(),
            });
        }
        Ok(list)
    }

    /// Reverse relation that holds at most one child.
    pub fn related_one(&mut self, name: &str) -> DalResult<Option<ObjectRef>> {
        let is_list = self
            .hybrid
            .foreign_relation(name)
            .map(|foreign| foreign.list)
            .ok_or_else(|| self.unknown(name))?;
        if is_list {
            return Err(DalError::Value(format!(
                "{}.{name} is a one-to-many relation",
                self.hybrid.name()
            )));
        }
        let list = self.related(name)?;
        if list.is_empty() {
            return Ok(None);
        }
        list.get(0).map(Some)
    }

    /// Reverse relation set without the cardinality check.
    pub(crate) fn relation_list(&mut self, name: &str) -> DalResult<&mut DataList> {
        let foreign = self
            .hybrid
            .foreign_relation(name)
            .cloned()
            .ok_or_else(|| self.unknown(name))?;
        let fresh = DataList::relation_set(self.dal.clone(), &self.hybrid, &self.guid, &foreign)?;
        match self.lists.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let list = entry.into_mut();
                list.update(fresh)?;
                Ok(list)
            }
            Entry::Vacant(entry) => Ok(entry.insert(fresh)),
        }
    }

    pub fn related_guids(&mut self, name: &str) -> DalResult<Vec<Guid>> {
        Ok(self.related(name)?.guids().to_vec())
    }

    /// Forget memoized forward relation targets.
    pub fn invalidate_cached_objects(&mut self) {
        self.objects.clear();
    }

    // ---- Store state ----

    /// Drop local changes and re-read the row.
    pub fn discard(&mut self) -> DalResult<()> {
        let (row, provenance) = fetch_row(&self.dal, &self.hybrid, &self.guid, &self.key)?;
        let mut row = row;
        fill_defaults(&self.dal, &self.hybrid, &mut row);
        self.original = row.clone();
        self.data = row;
        self.provenance = provenance;
        self.dirty = false;
        self.objects.clear();
        self.lists.clear();
        Ok(())
    }

    /// Whether the stored version differs from the one this instance holds.
    /// A missing row counts as changed.
    pub fn updated_on_datastore(&self) -> DalResult<bool> {
        if self.volatile {
            return Ok(false);
        }
        let current = match self.dal.volatile().get(&self.key)? {
            Some(Value::Object(row)) => version_of(&row) as i64,
            _ => match self.dal.persistent().get(&self.key) {
                Ok(Value::Object(row)) => version_of(&row) as i64,
                Ok(_) | Err(StoreError::KeyNotFound(_)) => -1,
                Err(e) => return Err(e.into()),
            },
        };
        Ok(self.version() as i64 != current)
    }

    // ---- Views and copies ----

    /// Simple properties only.
    pub fn export(&self) -> Map<String, Value> {
        self.hybrid
            .properties()
            .iter()
            .map(|p| {
                let value = self.data.get(&p.name).cloned().unwrap_or(Value::Null);
                (p.name.clone(), value)
            })
            .collect()
    }

    /// Guid, properties and dynamics. Relations appear as `<name>_guid` at
    /// depth 0, or nested up to `depth` levels.
    pub fn serialize(&mut self, depth: usize) -> DalResult<Value> {
        let mut out = Map::new();
        out.insert("guid".into(), json!(self.guid.to_string()));
        let relations: Vec<String> = self.hybrid.relations().iter().map(|r| r.name.clone()).collect();
        for name in relations {
            if depth == 0 {
                let guid = cell_guid(&self.data, &name)?;
                out.insert(format!("{name}_guid"), json!(guid.map(|g| g.to_string())));
            } else {
                let nested = match self.relation(&name)? {
                    Some(target) => borrow_mut(&target)?.serialize(depth - 1)?,
                    None => Value::Null,
                };
                out.insert(name, nested);
            }
        }
        out.extend(self.export());
        let dynamics: Vec<String> = self.hybrid.dynamics().iter().map(|d| d.name.clone()).collect();
        for name in dynamics {
            let value = self.dynamic(&name)?;
            out.insert(name, value);
        }
        Ok(Value::Object(out))
    }

    /// Copy properties (and optionally relations) from another instance of
    /// the same type.
    pub fn copy_from(
        &mut self,
        other: &DataObject,
        include: Option<&[&str]>,
        exclude: &[&str],
        include_relations: bool,
    ) -> DalResult<()> {
        if other.hybrid.logical_name() != self.hybrid.logical_name() {
            return Err(DalError::TypeMismatch {
                type_name: self.hybrid.name().to_string(),
                field: "copy_from".into(),
                allowed: vec![self.hybrid.name().to_string()],
                given: other.hybrid.name().to_string(),
            });
        }
        let wanted = |name: &str| {
            include.map_or(true, |include| include.contains(&name)) && !exclude.contains(&name)
        };
        for property in self.hybrid.properties() {
            if wanted(&property.name) {
                let value = other.data.get(&property.name).cloned().unwrap_or(Value::Null);
                self.data.insert(property.name.clone(), value);
                self.dirty = true;
            }
        }
        if include_relations {
            let names: Vec<String> = self.hybrid.relations().iter().map(|r| r.name.clone()).collect();
            for name in names.into_iter().filter(|n| wanted(n)) {
                let target = self.relation_target(&name)?;
                let guid = cell_guid(&other.data, &name)?;
                self.data.insert(name.clone(), relation_cell(&target, guid.as_ref()));
                self.objects.remove(&name);
                self.dirty = true;
            }
        }
        Ok(())
    }

    /// A second, independent instance of the same row.
    ///
    /// With `reload` the copy is read from the stores; otherwise it takes
    /// over this instance's payload and shadow copy.
    pub fn clone_object(&self, reload: bool) -> DalResult<DataObject> {
        let mut copy = if reload && !self.new {
            DataObject::load(self.dal.clone(), Arc::clone(&self.hybrid), self.guid)?
        } else {
            let mut copy = Self::assemble(
                self.dal.clone(),
                Arc::clone(&self.hybrid),
                self.guid,
                self.data.clone(),
                self.new,
                Provenance::Provided,
            );
            copy.original = self.original.clone();
            copy.dirty = self.dirty;
            copy
        };
        copy.policy = self.policy;
        copy.volatile = self.volatile;
        Ok(copy)
    }

    // ---- Helpers ----

    pub(crate) fn ensure_persistable(&self, action: &'static str) -> DalResult<()> {
        if self.volatile {
            return Err(DalError::VolatileObject {
                type_name: self.hybrid.name().to_string(),
                action,
            });
        }
        Ok(())
    }

    pub(crate) fn not_found(&self, detail: &'static str) -> DalError {
        not_found(&self.hybrid, &self.guid, detail)
    }

    pub(crate) fn unknown(&self, name: &str) -> DalError {
        DalError::UnknownAttribute {
            type_name: self.hybrid.name().to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Debug for DataObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataObject")
            .field("type", &self.hybrid.name())
            .field("guid", &self.guid)
            .field("version", &self.version())
            .field("new", &self.new)
            .field("dirty", &self.dirty)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

pub(crate) fn version_of(row: &Row) -> u64 {
    row.get(VERSION_FIELD).and_then(Value::as_u64).unwrap_or(0)
}

pub(crate) fn not_found(hybrid: &Hybrid, guid: &Guid, detail: &'static str) -> DalError {
    DalError::ObjectNotFound {
        type_name: hybrid.name().to_string(),
        guid: guid.to_string(),
        detail,
    }
}

/// Guid stored in a relation cell; `None` when unset.
pub(crate) fn cell_guid(row: &Row, name: &str) -> DalResult<Option<Guid>> {
    match row.get(name).and_then(|cell| cell.get("guid")) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => Guid::parse(raw)
            .map(Some)
            .map_err(|e| DalError::Serialization(format!("relation {name}: {e}"))),
        Some(other) => Err(DalError::Serialization(format!(
            "relation {name}: guid is a {}",
            kind_of(other)
        ))),
    }
}

pub(crate) fn relation_cell(target: &Hybrid, guid: Option<&Guid>) -> Value {
    json!({
        "type": target.name(),
        "identifier": target.identifier(),
        "guid": guid.map(|g| g.to_string()),
    })
}

/// Give every declared field a value: property defaults and empty
/// relation cells.
fn fill_defaults(dal: &Dal, hybrid: &Hybrid, row: &mut Row) {
    for property in hybrid.properties() {
        row.entry(property.name.clone())
            .or_insert_with(|| property.initial_value());
    }
    for relation in hybrid.relations() {
        if row.contains_key(&relation.name) {
            continue;
        }
        if let Some(target) = dal.registry().get(relation.target()) {
            row.insert(relation.name.clone(), relation_cell(&target, None));
        }
    }
    row.entry(VERSION_FIELD).or_insert(json!(0));
}

fn fetch_row(dal: &Dal, hybrid: &Hybrid, guid: &Guid, key: &str) -> DalResult<(Row, Provenance)> {
    if let Some(Value::Object(row)) = dal.volatile().get(key)? {
        return Ok((row, Provenance::Cached));
    }
    match dal.persistent().get(key) {
        Ok(Value::Object(row)) => Ok((row, Provenance::Persistent)),
        Ok(other) => Err(DalError::Serialization(format!(
            "row {key} is a {}, not an object",
            kind_of(&other)
        ))),
        Err(StoreError::KeyNotFound(_)) => Err(not_found(hybrid, guid, "could not be found")),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn borrow(object: &ObjectRef) -> DalResult<Ref<'_, DataObject>> {
    object
        .try_borrow()
        .map_err(|_| DalError::Value("object is mutably borrowed elsewhere".into()))
}

pub(crate) fn borrow_mut(object: &ObjectRef) -> DalResult<RefMut<'_, DataObject>> {
    object
        .try_borrow_mut()
        .map_err(|_| DalError::Value("object is already borrowed".into()))
}
