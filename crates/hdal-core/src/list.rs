//! Query results: an ordered guid sequence over one hybrid type, with the
//! stored rows it was built from and lazily loaded instances.
//!
//! Results are cached in the volatile store under a content-derived key.
//! For every field the query depends on, a marker key is written to the
//! persistent store; saves and deletes remove the markers of the fields they
//! touch and evict the cached results named by them.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::ops::{Bound, RangeBounds};
use std::rc::Rc;
use std::sync::Arc;

use hdal_schema::{ForeignRelation, Hybrid, PropertyType};
use hdal_store::StoreError;
use hdal_types::Guid;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::dal::Dal;
use crate::error::{DalError, DalResult};
use crate::object::{borrow_mut, DataObject, ObjectRef, Row};
use crate::query::{self, cache_hash, keyed, Filter, Operator, Plan, Query, Step};

/// How much of a result came out of forward index buckets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexUsage {
    /// Every leaf was answered by an index.
    Full,
    /// Indexes narrowed the candidates; the remaining leaves were evaluated.
    Partial,
    /// No index was used.
    Scan,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects the parameters of a list before running it.
#[derive(Debug)]
pub struct ListBuilder {
    dal: Dal,
    hybrid: Arc<Hybrid>,
    query: Query,
    key: Option<String>,
    guids: Option<Vec<Guid>>,
}

impl ListBuilder {
    pub(crate) fn new(dal: Dal, hybrid: Arc<Hybrid>) -> Self {
        Self {
            dal,
            hybrid,
            query: Query::all(),
            key: None,
            guids: None,
        }
    }

    pub fn query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    /// Cache under an explicit name. The result is then cached even when the
    /// query reads dynamics, and any value left under the name is dropped.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Restrict the candidates to these guids; the result keeps their order.
    pub fn guids(mut self, guids: Vec<Guid>) -> Self {
        self.guids = Some(guids);
        self
    }

    pub fn execute(self) -> DalResult<DataList> {
        let mut list = DataList::assemble(self.dal, self.hybrid, self.query, self.key, self.guids)?;
        list.run()?;
        Ok(list)
    }
}

// ---------------------------------------------------------------------------
// DataList
// ---------------------------------------------------------------------------

/// Ordered result of a query.
pub struct DataList {
    dal: Dal,
    hybrid: Arc<Hybrid>,
    query: Query,
    scope: Option<Vec<Guid>>,
    explicit_key: bool,
    cache_key: String,
    guids: Vec<Guid>,
    rows: HashMap<Guid, Row>,
    objects: HashMap<Guid, ObjectRef>,
    from_cache: bool,
    index_usage: IndexUsage,
    cacheable: bool,
}

impl DataList {
    fn assemble(
        dal: Dal,
        hybrid: Arc<Hybrid>,
        query: Query,
        key: Option<String>,
        scope: Option<Vec<Guid>>,
    ) -> DalResult<Self> {
        let mut list = Self {
            dal,
            hybrid,
            query,
            scope,
            explicit_key: key.is_some(),
            cache_key: String::new(),
            guids: Vec::new(),
            rows: HashMap::new(),
            objects: HashMap::new(),
            from_cache: false,
            index_usage: IndexUsage::Scan,
            cacheable: true,
        };
        match key {
            Some(key) => {
                list.cache_key = list.dal.keys().list(&key);
                list.remove_cached_data()?;
            }
            None => list.rekey()?,
        }
        Ok(list)
    }

    /// Children of `parent_guid` through one of its reverse relations, read
    /// from the reverse markers rather than by query.
    pub(crate) fn relation_set(
        dal: Dal,
        parent: &Hybrid,
        parent_guid: &Guid,
        foreign: &ForeignRelation,
    ) -> DalResult<Self> {
        let prefix = dal
            .keys()
            .reverse_prefix(parent.type_name(), parent_guid, &foreign.name);
        let guids = dal
            .persistent()
            .prefix(&prefix)?
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(|raw| {
                Guid::parse(raw).map_err(|e| DalError::Serialization(format!("reverse marker {prefix}{raw}: {e}")))
            })
            .collect::<DalResult<Vec<_>>>()?;
        let child = dal.resolve(&foreign.child)?;
        let key = format!("{}_{}_{}", parent.type_name(), parent_guid, foreign.child_key);
        let query = Query::eq(format!("{}_guid", foreign.child_key), json!(parent_guid.to_string()));
        let mut list = Self::assemble(dal, child, query, Some(key), Some(guids.clone()))?;
        list.materialize(guids)?;
        Ok(list)
    }

    /// A list over known guids that is never cached.
    fn derived(&self, guids: Vec<Guid>) -> DalResult<Self> {
        let mut list = Self::assemble(
            self.dal.clone(),
            Arc::clone(&self.hybrid),
            Query::all(),
            None,
            None,
        )?;
        list.cacheable = false;
        list.guids = guids;
        Ok(list)
    }

    fn rekey(&mut self) -> DalResult<()> {
        let scope: Option<Vec<String>> = self
            .scope
            .as_ref()
            .map(|guids| guids.iter().map(Guid::to_string).collect());
        let hash = cache_hash(&self.hybrid, &self.query, scope.as_deref())?;
        self.cache_key = self.dal.keys().list(&hash);
        Ok(())
    }

    fn reset(&mut self) {
        self.guids.clear();
        self.rows.clear();
        self.objects.clear();
        self.from_cache = false;
        self.index_usage = IndexUsage::Scan;
        self.cacheable = true;
    }

    // ---- Execution ----

    fn run(&mut self) -> DalResult<()> {
        self.reset();
        let plan = query::plan(&self.dal, &self.hybrid, &self.query)?;
        self.cacheable = self.explicit_key || !plan.uses_dynamic;

        if self.cacheable {
            if let Some(guids) = self.cached_guids()? {
                self.materialize(guids)?;
                self.from_cache = true;
                debug!(key = %self.cache_key, len = self.guids.len(), "list served from cache");
                return Ok(());
            }
            self.write_markers(&plan)?;
        }

        let (hits, residual) = match &self.query {
            Query::And(items) => {
                let (hits, residual) = self.index_lookup(&plan, items)?;
                (hits, Query::And(residual))
            }
            other => (None, other.clone()),
        };
        self.index_usage = match (&hits, &residual) {
            (None, _) => IndexUsage::Scan,
            (Some(_), Query::And(rest)) if rest.is_empty() => IndexUsage::Full,
            (Some(_), _) => IndexUsage::Partial,
        };

        let candidates = self.candidates(hits)?;
        let examined = candidates.len();
        for (guid, row) in candidates {
            match self.evaluate(&plan, &residual, guid, &row) {
                Ok(true) => {
                    self.guids.push(guid);
                    self.rows.insert(guid, row);
                }
                Ok(false) => {}
                Err(e) if e.is_not_found() => {
                    debug!(guid = %guid, "candidate vanished during evaluation");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(
            type_name = %self.hybrid.name(),
            examined,
            matched = self.guids.len(),
            index = ?self.index_usage,
            "list executed"
        );

        if self.cacheable && examined > 0 {
            let cached: Vec<String> = self.guids.iter().map(Guid::to_string).collect();
            self.dal
                .volatile()
                .set(&self.cache_key, json!(cached), Some(self.dal.config().list_ttl()))?;
            if self.markers_missing(&plan)? {
                debug!(key = %self.cache_key, "list invalidated while caching");
                self.remove_cached_data()?;
            }
        }
        Ok(())
    }

    fn cached_guids(&self) -> DalResult<Option<Vec<Guid>>> {
        let Some(Value::Array(cached)) = self.dal.volatile().get(&self.cache_key)? else {
            return Ok(None);
        };
        let parsed: Result<Vec<Guid>, _> = cached
            .iter()
            .map(|v| Guid::parse(v.as_str().unwrap_or_default()))
            .collect();
        match parsed {
            Ok(guids) => Ok(Some(guids)),
            Err(e) => {
                warn!(key = %self.cache_key, error = %e, "ignoring malformed cached list");
                Ok(None)
            }
        }
    }

    /// Take `guids` as the result, keeping only those whose row still exists.
    fn materialize(&mut self, guids: Vec<Guid>) -> DalResult<()> {
        self.guids.clear();
        self.rows.clear();
        for (guid, row) in self.fetch_rows(&guids)? {
            self.guids.push(guid);
            self.rows.insert(guid, row);
        }
        Ok(())
    }

    fn marker_keys(&self, plan: &Plan) -> Vec<String> {
        let keys = self.dal.keys();
        plan.references
            .iter()
            .flat_map(|(type_name, fields)| {
                fields
                    .iter()
                    .map(move |field| keys.list_cache_marker(type_name, field, &self.cache_key))
            })
            .collect()
    }

    fn write_markers(&self, plan: &Plan) -> DalResult<()> {
        let persistent = self.dal.persistent();
        let mut tx = persistent.begin_transaction();
        for marker in self.marker_keys(plan) {
            tx.set(marker, json!(0));
        }
        persistent.apply_transaction(tx)?;
        Ok(())
    }

    fn markers_missing(&self, plan: &Plan) -> DalResult<bool> {
        let markers = self.marker_keys(plan);
        let found = self.dal.persistent().get_multi(&markers, false)?;
        Ok(found.iter().any(Option::is_none))
    }

    // ---- Index fast path ----

    /// Answer the indexable leaves of an AND node from index buckets.
    /// Returns the intersected hits (`None` if no leaf was indexable) and
    /// the leaves left to evaluate.
    fn index_lookup(&self, plan: &Plan, items: &[Query]) -> DalResult<(Option<BTreeSet<Guid>>, Vec<Query>)> {
        let mut hits: Option<BTreeSet<Guid>> = None;
        let mut residual = Vec::new();
        for item in items {
            let found = match item {
                Query::And(nested) => {
                    let (found, rest) = self.index_lookup(plan, nested)?;
                    if !rest.is_empty() {
                        residual.push(Query::And(rest));
                    }
                    found
                }
                Query::Filter(filter) => {
                    let found = self.filter_hits(plan, filter)?;
                    if found.is_none() {
                        residual.push(item.clone());
                    }
                    found
                }
                Query::Or(_) => {
                    residual.push(item.clone());
                    None
                }
            };
            if let Some(found) = found {
                hits = Some(match hits {
                    None => found,
                    Some(current) => current.intersection(&found).copied().collect(),
                });
            }
        }
        Ok((hits, residual))
    }

    fn filter_hits(&self, plan: &Plan, filter: &Filter) -> DalResult<Option<BTreeSet<Guid>>> {
        if !filter.case_sensitive {
            return Ok(None);
        }
        let values: Vec<&Value> = match (filter.op, &filter.value) {
            (Operator::Equals, value) => vec![value],
            (Operator::In, Value::Array(items)) => items.iter().collect(),
            _ => return Ok(None),
        };
        let path = plan.path(&filter.field)?;
        if path.is_guid() {
            let guids = values
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(|raw| Guid::parse(raw).ok().filter(|g| g.to_string() == raw))
                .collect();
            return Ok(Some(guids));
        }
        let Some(property) = path.property().and_then(|name| self.hybrid.property(name)) else {
            return Ok(None);
        };
        if !property.indexed || !values.iter().all(|v| bucket_compatible(&property.ty, v)) {
            return Ok(None);
        }
        let mut guids = BTreeSet::new();
        for value in values {
            self.bucket(&property.name, value, &mut guids)?;
        }
        Ok(Some(guids))
    }

    fn bucket(&self, property: &str, value: &Value, into: &mut BTreeSet<Guid>) -> DalResult<()> {
        let keys = self.dal.keys();
        let type_name = self.hybrid.type_name();
        let bucket = keys.index(type_name, property, value);
        let members = match self.dal.persistent().get(&bucket) {
            Ok(Value::Array(members)) => members,
            Ok(_) => return Err(DalError::Serialization(format!("index bucket {bucket} is not a list"))),
            Err(StoreError::KeyNotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for member in members.iter().filter_map(Value::as_str) {
            match keys.guid_from_object_key(type_name, member) {
                Ok(guid) => {
                    into.insert(guid);
                }
                Err(e) => warn!(bucket = %bucket, member, error = %e, "ignoring foreign index member"),
            }
        }
        Ok(())
    }

    fn candidates(&self, hits: Option<BTreeSet<Guid>>) -> DalResult<Vec<(Guid, Row)>> {
        let guids: Vec<Guid> = match (&self.scope, hits) {
            (Some(scope), Some(hits)) => scope.iter().filter(|g| hits.contains(g)).copied().collect(),
            (Some(scope), None) => scope.clone(),
            (None, Some(hits)) => hits.into_iter().collect(),
            (None, None) => return self.scan(),
        };
        self.fetch_rows(&guids)
    }

    fn scan(&self) -> DalResult<Vec<(Guid, Row)>> {
        let keys = self.dal.keys();
        let type_name = self.hybrid.type_name();
        let prefix = keys.object_prefix(type_name);
        let mut out = Vec::new();
        for (key, value) in self.dal.persistent().prefix_entries(&prefix)? {
            let guid = match keys.guid_from_object_key(type_name, &key) {
                Ok(guid) => guid,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping malformed row key");
                    continue;
                }
            };
            out.push((guid, into_row(&key, value)?));
        }
        Ok(out)
    }

    fn fetch_rows(&self, guids: &[Guid]) -> DalResult<Vec<(Guid, Row)>> {
        let type_name = self.hybrid.type_name();
        let keys: Vec<String> = guids
            .iter()
            .map(|guid| self.dal.keys().object(type_name, guid))
            .collect();
        let values = self.dal.persistent().get_multi(&keys, false)?;
        let mut out = Vec::with_capacity(guids.len());
        for ((guid, key), value) in guids.iter().zip(&keys).zip(values) {
            if let Some(value) = value {
                out.push((*guid, into_row(key, value)?));
            }
        }
        Ok(out)
    }

    /// Run the residual leaves against one candidate. Plain fields are read
    /// from the row; anything deeper loads the instance, which is kept when
    /// the candidate matches.
    fn evaluate(&mut self, plan: &Plan, residual: &Query, guid: Guid, row: &Row) -> DalResult<bool> {
        let guid_text = guid.to_string();
        let dal = self.dal.clone();
        let hybrid = Arc::clone(&self.hybrid);
        let mut instance: Option<DataObject> = None;
        let mut lookup = |field: &str| -> DalResult<Option<Value>> {
            let path = plan.path(field)?;
            if let Some(value) = path.shallow_value(&guid_text, row)? {
                return Ok(Some(value));
            }
            let mut object = match instance.take() {
                Some(object) => object,
                None => DataObject::load(dal.clone(), Arc::clone(&hybrid), guid)?,
            };
            let value = resolve(&path.steps, &mut object);
            instance = Some(object);
            value
        };
        let matched = residual.matches(&mut lookup)?;
        if matched {
            if let Some(object) = instance {
                self.objects.insert(guid, Rc::new(RefCell::new(object)));
            }
        }
        Ok(matched)
    }

    // ---- Cache control ----

    /// Drop this list's cached result.
    pub fn remove_cached_data(&self) -> DalResult<()> {
        self.dal.volatile().delete(&self.cache_key)?;
        Ok(())
    }

    /// Whether a save or delete has since invalidated this list's result.
    pub fn cache_invalidated(&self) -> DalResult<bool> {
        let plan = query::plan(&self.dal, &self.hybrid, &self.query)?;
        self.markers_missing(&plan)
    }

    /// Replace the query and run it.
    pub fn set_query(&mut self, query: Query) -> DalResult<()> {
        self.query = query;
        self.refresh()
    }

    /// Replace the guid scope (`None` for all objects) and run again.
    pub fn set_guids(&mut self, guids: Option<Vec<Guid>>) -> DalResult<()> {
        self.scope = guids;
        self.refresh()
    }

    fn refresh(&mut self) -> DalResult<()> {
        if self.explicit_key {
            self.remove_cached_data()?;
        } else {
            self.rekey()?;
        }
        self.run()
    }

    // ---- Accessors ----

    pub fn hybrid(&self) -> &Arc<Hybrid> {
        &self.hybrid
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn guids(&self) -> &[Guid] {
        &self.guids
    }

    pub fn len(&self) -> usize {
        self.guids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guids.is_empty()
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn index_usage(&self) -> IndexUsage {
        self.index_usage
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    // ---- Instances ----

    /// Instance for a guid of this list. A held instance that is clean but
    /// out of date is re-read in place, so callers keep the same handle.
    fn object(&mut self, guid: Guid) -> DalResult<ObjectRef> {
        if let Some(held) = self.objects.get(&guid) {
            let held = Rc::clone(held);
            {
                let mut current = borrow_mut(&held)?;
                if !current.is_dirty() && current.updated_on_datastore()? {
                    current.discard()?;
                }
            }
            return Ok(held);
        }
        let object = match self.rows.get(&guid) {
            Some(row) => DataObject::hydrate(self.dal.clone(), Arc::clone(&self.hybrid), guid, row.clone()),
            None => DataObject::load(self.dal.clone(), Arc::clone(&self.hybrid), guid)?,
        };
        let object = Rc::new(RefCell::new(object));
        self.objects.insert(guid, Rc::clone(&object));
        Ok(object)
    }

    pub fn get(&mut self, index: usize) -> DalResult<ObjectRef> {
        let guid = *self.guids.get(index).ok_or(DalError::Index {
            index: index as isize,
            len: self.guids.len(),
        })?;
        self.object(guid)
    }

    /// Instances in order; a vanished object is an error.
    pub fn iter(&mut self) -> ListIter<'_> {
        ListIter {
            list: self,
            position: 0,
            safe: false,
        }
    }

    /// Instances in order, skipping objects deleted since the list ran.
    pub fn iter_safe(&mut self) -> ListIter<'_> {
        ListIter {
            list: self,
            position: 0,
            safe: true,
        }
    }

    /// Only the instances already loaded, in list order.
    pub fn iter_loaded(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.guids
            .iter()
            .filter_map(|guid| self.objects.get(guid).map(Rc::clone))
    }

    /// Load every instance.
    pub fn load(&mut self) -> DalResult<()> {
        for i in 0..self.guids.len() {
            self.object(self.guids[i])?;
        }
        Ok(())
    }

    /// Load every instance that still exists.
    pub fn load_safe(&mut self) -> DalResult<()> {
        for i in 0..self.guids.len() {
            match self.object(self.guids[i]) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ---- Searching ----

    pub fn index_of(&self, object: &DataObject) -> Option<usize> {
        self.index_of_guid(&object.guid())
    }

    pub fn index_of_guid(&self, guid: &Guid) -> Option<usize> {
        self.guids.iter().position(|g| g == guid)
    }

    pub fn count_of(&self, object: &DataObject) -> usize {
        let guid = object.guid();
        self.guids.iter().filter(|g| **g == guid).count()
    }

    // ---- Reordering ----

    /// Sort by guid.
    pub fn sort(&mut self) {
        self.guids.sort();
    }

    /// Stable sort on a field path, comparing digit runs numerically and
    /// text case-insensitively. Plain fields are read from the stored rows.
    pub fn sort_by_key(&mut self, field: &str, reverse: bool) -> DalResult<()> {
        let plan = query::plan(&self.dal, &self.hybrid, &Query::eq(field, Value::Null))?;
        let path = plan.path(field)?.clone();
        let mut keyed_guids = Vec::with_capacity(self.guids.len());
        for i in 0..self.guids.len() {
            let guid = self.guids[i];
            let shallow = match self.rows.get(&guid) {
                Some(row) => path.shallow_value(&guid.to_string(), row)?,
                None => None,
            };
            let value = match shallow {
                Some(value) => value,
                None => {
                    let object = self.object(guid)?;
                    let mut object = borrow_mut(&object)?;
                    resolve(&path.steps, &mut object)?.unwrap_or(Value::Null)
                }
            };
            keyed_guids.push((natural_key(&value), guid));
        }
        keyed_guids.sort_by(|a, b| {
            let order = a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal);
            if reverse {
                order.reverse()
            } else {
                order
            }
        });
        self.guids = keyed_guids.into_iter().map(|(_, guid)| guid).collect();
        Ok(())
    }

    pub fn reverse(&mut self) {
        self.guids.reverse();
    }

    pub fn shuffle(&mut self) {
        self.guids.shuffle(&mut rand::thread_rng());
    }

    // ---- Editing ----

    /// A new list over a range of this one, sharing loaded instances.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> DalResult<DataList> {
        let len = self.guids.len();
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.saturating_add(1),
            Bound::Unbounded => 0,
        }
        .min(len);
        let end = match range.end_bound() {
            Bound::Included(&e) => e.saturating_add(1),
            Bound::Excluded(&e) => e,
            Bound::Unbounded => len,
        }
        .clamp(start, len);
        let mut list = self.derived(self.guids[start..end].to_vec())?;
        list.adopt(self);
        Ok(list)
    }

    /// Both sequences one after the other; duplicates are kept.
    pub fn concat(&self, other: &DataList) -> DalResult<DataList> {
        self.check_same_type(other)?;
        let guids = self.guids.iter().chain(&other.guids).copied().collect();
        let mut list = self.derived(guids)?;
        list.adopt(self);
        list.adopt(other);
        Ok(list)
    }

    /// Remove the first occurrence of `object`.
    pub fn remove(&mut self, object: &DataObject) -> DalResult<()> {
        if object.hybrid().logical_name() != self.hybrid.logical_name() {
            return Err(DalError::TypeMismatch {
                type_name: self.hybrid.name().to_string(),
                field: "remove".into(),
                allowed: vec![self.hybrid.name().to_string()],
                given: object.hybrid().name().to_string(),
            });
        }
        self.remove_guid(&object.guid())
    }

    pub fn remove_guid(&mut self, guid: &Guid) -> DalResult<()> {
        let position = self
            .index_of_guid(guid)
            .ok_or_else(|| DalError::Value(format!("{guid} is not in the list")))?;
        self.guids.remove(position);
        self.forget_absent();
        Ok(())
    }

    /// Remove and return the guid at `index`; negative indexes count from
    /// the end.
    pub fn pop(&mut self, index: isize) -> DalResult<Guid> {
        let len = self.guids.len();
        let resolved = if index < 0 { len as isize + index } else { index };
        if resolved < 0 || resolved as usize >= len {
            return Err(DalError::Index { index, len });
        }
        let guid = self.guids.remove(resolved as usize);
        self.forget_absent();
        Ok(guid)
    }

    /// Merge a fresh result of the same query into this one: survivors keep
    /// their order, new guids are appended, and loaded instances are kept.
    pub fn update(&mut self, other: DataList) -> DalResult<()> {
        self.check_same_type(&other)?;
        let fresh: BTreeSet<Guid> = other.guids.iter().copied().collect();
        let mut merged: Vec<Guid> = self.guids.iter().filter(|g| fresh.contains(g)).copied().collect();
        let kept: BTreeSet<Guid> = merged.iter().copied().collect();
        merged.extend(other.guids.iter().filter(|g| !kept.contains(g)).copied());
        self.guids = merged;
        self.rows.extend(other.rows);
        for (guid, object) in other.objects {
            self.objects.entry(guid).or_insert(object);
        }
        self.forget_absent();
        self.from_cache = other.from_cache;
        self.index_usage = other.index_usage;
        Ok(())
    }

    fn adopt(&mut self, other: &DataList) {
        for guid in &self.guids {
            if let Some(row) = other.rows.get(guid) {
                self.rows.entry(*guid).or_insert_with(|| row.clone());
            }
            if let Some(object) = other.objects.get(guid) {
                self.objects.entry(*guid).or_insert_with(|| Rc::clone(object));
            }
        }
    }

    fn forget_absent(&mut self) {
        let present: BTreeSet<Guid> = self.guids.iter().copied().collect();
        self.rows.retain(|guid, _| present.contains(guid));
        self.objects.retain(|guid, _| present.contains(guid));
    }

    fn check_same_type(&self, other: &DataList) -> DalResult<()> {
        if other.hybrid.logical_name() != self.hybrid.logical_name() {
            return Err(DalError::TypeMismatch {
                type_name: self.hybrid.name().to_string(),
                field: "list".into(),
                allowed: vec![self.hybrid.name().to_string()],
                given: other.hybrid.name().to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for DataList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataList")
            .field("type", &self.hybrid.name())
            .field("len", &self.guids.len())
            .field("loaded", &self.objects.len())
            .field("from_cache", &self.from_cache)
            .field("index", &self.index_usage)
            .finish()
    }
}

/// Iterator over a list's instances.
pub struct ListIter<'a> {
    list: &'a mut DataList,
    position: usize,
    safe: bool,
}

impl Iterator for ListIter<'_> {
    type Item = DalResult<ObjectRef>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let guid = *self.list.guids.get(self.position)?;
            self.position += 1;
            match self.list.object(guid) {
                Err(e) if self.safe && e.is_not_found() => continue,
                other => return Some(other),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn into_row(key: &str, value: Value) -> DalResult<Row> {
    match value {
        Value::Object(row) => Ok(row),
        _ => Err(DalError::Serialization(format!("row {key} is not an object"))),
    }
}

/// Whether an equality on `value` finds the same objects through the index
/// bucket as through comparing field values.
fn bucket_compatible(ty: &PropertyType, value: &Value) -> bool {
    match (ty, value) {
        (PropertyType::Str, Value::String(_)) => true,
        (PropertyType::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
        (PropertyType::Bool, Value::Bool(_)) => true,
        (PropertyType::Enum(values), Value::String(_)) => values.iter().all(Value::is_string),
        _ => false,
    }
}

/// Value at the end of a path. `None` when a relation on the way is unset.
fn resolve(steps: &[Step], object: &mut DataObject) -> DalResult<Option<Value>> {
    let Some((step, rest)) = steps.split_first() else {
        return Ok(None);
    };
    let value = match step {
        Step::Guid => json!(object.guid().to_string()),
        Step::Property { name, key } => {
            let value = object.get(name)?.clone();
            match key {
                Some(key) => keyed(value, key),
                None => value,
            }
        }
        Step::RelationGuid(name) => json!(object.relation_guid(name)?.map(|g| g.to_string())),
        Step::Dynamic(name) => object.dynamic(name)?,
        Step::Foreign(name) => {
            let guids: Vec<String> = object.related_guids(name)?.iter().map(Guid::to_string).collect();
            json!(guids)
        }
        Step::Relation(name) => {
            let Some(target) = object.relation(name)? else {
                return Ok(None);
            };
            let mut target = borrow_mut(&target)?;
            return resolve(rest, &mut target);
        }
    };
    Ok(Some(value))
}

#[derive(Debug, PartialEq, PartialOrd)]
enum Chunk {
    Number(f64),
    Text(String),
}

/// Sort key splitting text into digit runs and lowercased text runs, so
/// that `disk2` sorts before `disk10`.
fn natural_key(value: &Value) -> Vec<Chunk> {
    let text = match value {
        Value::Null => return Vec::new(),
        Value::Number(n) => return vec![Chunk::Number(n.as_f64().unwrap_or(0.0))],
        Value::Bool(b) => return vec![Chunk::Number(f64::from(u8::from(*b)))],
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    let mut chunks = Vec::new();
    let mut run = String::new();
    let mut digits = false;
    for c in text.chars() {
        let is_digit = c.is_ascii_digit();
        if !run.is_empty() && is_digit != digits {
            chunks.push(chunk(&run, digits));
            run.clear();
        }
        digits = is_digit;
        run.push(c);
    }
    if !run.is_empty() {
        chunks.push(chunk(&run, digits));
    }
    chunks
}

fn chunk(run: &str, digits: bool) -> Chunk {
    match run.parse::<f64>() {
        Ok(n) if digits => Chunk::Number(n),
        _ => Chunk::Text(run.to_string()),
    }
}
