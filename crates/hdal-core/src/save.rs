//! Optimistic save: three-way merge, auxiliary keys and the version bump in
//! one assertion-guarded transaction, retried on conflict.

use std::collections::HashSet;
use std::sync::Arc;

use hdal_store::StoreError;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::error::{DalError, DalResult};
use crate::index::IndexMaintainer;
use crate::object::{
    cell_guid, version_of, ConflictPolicy, DataObject, ObjectRef, Row, NULL, VERSION_FIELD,
};

impl DataObject {
    /// Persist local changes.
    pub fn save(&mut self) -> DalResult<()> {
        let mut visited = HashSet::new();
        self.save_inner(false, &mut visited)
    }

    /// Save relation targets and loaded reverse-relation children first,
    /// then this object. Each row is saved at most once per call.
    pub fn save_recursive(&mut self) -> DalResult<()> {
        let mut visited = HashSet::new();
        self.save_inner(true, &mut visited)
    }

    fn save_inner(&mut self, recursive: bool, visited: &mut HashSet<String>) -> DalResult<()> {
        self.ensure_persistable("saved")?;
        visited.insert(self.key.clone());
        self.validate_mandatory()?;
        if recursive {
            self.save_related(visited)?;
        }

        let attempts = self.dal.config().max_attempts;
        let mut optimistic = true;
        let mut last_conflict = None;
        for attempt in 1..=attempts {
            self.validate_relation_targets()?;
            let e = match self.try_save(optimistic) {
                Ok(row) => return self.committed(row),
                Err(DalError::Store(e)) => e,
                Err(e) => return Err(e),
            };
            let Some(key) = e.conflict_key().map(str::to_string) else {
                return Err(DalError::Store(e));
            };
            let keys = self.dal.keys();
            if keys.is_unique_key(&key) {
                if attempt == 1 && optimistic {
                    debug!(key = %key, "claim conflict on optimistic attempt, re-reading");
                    optimistic = false;
                    continue;
                }
                if matches!(e, StoreError::AssertFailed(_)) {
                    let field = keys
                        .unique_field(self.hybrid.type_name(), &key)
                        .unwrap_or(key);
                    return Err(DalError::UniqueConstraintViolation {
                        type_name: self.hybrid.name().to_string(),
                        field,
                    });
                }
                return Err(DalError::Store(e));
            }
            if matches!(e, StoreError::KeyNotFound(_)) {
                if key == self.key {
                    return Err(self.not_found("was deleted"));
                }
                return Err(DalError::Store(e));
            }
            debug!(attempt, key = %key, "save conflict, retrying");
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
            "save gave up"
        );
        Err(DalError::RaceCondition {
            type_name: self.hybrid.name().to_string(),
            guid: self.guid.to_string(),
            attempts,
            last_conflict,
        })
    }

    /// One attempt. Returns the row as committed.
    fn try_save(&self, optimistic: bool) -> DalResult<Row> {
        let persistent = Arc::clone(self.dal.persistent());
        let mut tx = persistent.begin_transaction();
        let store = self.store_data(optimistic, &mut tx)?;
        let (mut merged, changed) = self.merge(&store)?;

        let maintainer = IndexMaintainer::new(&self.dal, &self.hybrid, &self.guid, &self.key);
        maintainer.update_forward(&mut tx, &store, &merged, &changed, self.new)?;
        let affected = if self.new { None } else { Some(changed.as_slice()) };
        maintainer.invalidate_lists(&mut tx, affected)?;
        maintainer.update_unique(&mut tx, &store, &merged, &changed, self.new)?;
        maintainer.update_reverse(&mut tx, &store, &merged)?;

        merged.insert(VERSION_FIELD.into(), json!(version_of(&store) + 1));
        let _guard = self
            .dal
            .version_mutex(&self.hybrid, &self.guid)
            .acquire(self.dal.config().lock_timeout)?;
        tx.set(&self.key, Value::Object(merged.clone()));
        persistent.apply_transaction(tx)?;
        self.dal.volatile().delete(&self.key)?;
        Ok(merged)
    }

    /// The row this attempt builds on, with the matching assertion.
    fn store_data(&self, optimistic: bool, tx: &mut hdal_store::Transaction) -> DalResult<Row> {
        if self.new {
            let mut row = Row::new();
            row.insert(VERSION_FIELD.into(), json!(0));
            return Ok(row);
        }
        if optimistic {
            tx.assert_value(&self.key, Some(Value::Object(self.original.clone())));
            return Ok(self.original.clone());
        }
        match self.dal.persistent().get(&self.key) {
            Ok(Value::Object(row)) => {
                tx.assert_value(&self.key, Some(Value::Object(row.clone())));
                Ok(row)
            }
            Ok(_) => Err(DalError::Serialization(format!("row {} is not an object", self.key))),
            Err(StoreError::KeyNotFound(_)) => Err(self.not_found("was deleted")),
            Err(e) => Err(e.into()),
        }
    }

    /// Three-way merge of the store row, the shadow copy and the payload.
    ///
    /// Returns the row to write and the fields changed locally.
    fn merge(&self, store: &Row) -> DalResult<(Row, Vec<String>)> {
        let mut merged = store.clone();
        let mut changed = Vec::new();
        let mut conflicts = Vec::new();
        for (name, value) in &self.data {
            if name == VERSION_FIELD {
                continue;
            }
            let shadow = self.original.get(name).unwrap_or(&NULL);
            if value != shadow {
                changed.push(name.clone());
                match store.get(name) {
                    Some(stored) if stored != shadow => match self.policy {
                        ConflictPolicy::Raise => conflicts.push(name.clone()),
                        ConflictPolicy::LocalWins => {
                            debug!(field = %name, "concurrent change, keeping local value");
                            merged.insert(name.clone(), value.clone());
                        }
                        ConflictPolicy::DatastoreWins => {
                            debug!(field = %name, "concurrent change, keeping stored value");
                        }
                    },
                    _ => {
                        merged.insert(name.clone(), value.clone());
                    }
                }
            } else if !store.contains_key(name) {
                merged.insert(name.clone(), value.clone());
            }
        }
        if !conflicts.is_empty() {
            return Err(DalError::Concurrency {
                type_name: self.hybrid.name().to_string(),
                fields: conflicts,
            });
        }
        let dropped: Vec<String> = merged
            .keys()
            .filter(|k| k.as_str() != VERSION_FIELD && !self.data.contains_key(k.as_str()))
            .cloned()
            .collect();
        for name in dropped {
            warn!(key = %self.key, field = %name, "dropping stored field unknown to the schema");
            merged.remove(&name);
        }
        Ok((merged, changed))
    }

    fn committed(&mut self, row: Row) -> DalResult<()> {
        self.invalidate_dynamics(None)?;
        self.original = row.clone();
        self.data = row;
        self.new = false;
        self.dirty = false;
        debug!(key = %self.key, version = self.version(), "saved");
        Ok(())
    }

    fn validate_mandatory(&self) -> DalResult<()> {
        let mut missing = Vec::new();
        for property in self.hybrid.properties().iter().filter(|p| p.mandatory) {
            if self.data.get(&property.name).map_or(true, Value::is_null) {
                missing.push(property.name.clone());
            }
        }
        for relation in self.hybrid.relations().iter().filter(|r| r.mandatory) {
            if cell_guid(&self.data, &relation.name)?.is_none() {
                missing.push(relation.name.clone());
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DalError::MissingFields {
                type_name: self.hybrid.name().to_string(),
                fields: missing,
            })
        }
    }

    fn validate_relation_targets(&self) -> DalResult<()> {
        let mut keys = Vec::new();
        for relation in self.hybrid.relations() {
            if let Some(guid) = cell_guid(&self.data, &relation.name)? {
                let target = self.dal.resolve(relation.target())?;
                keys.push(self.dal.keys().object(target.type_name(), &guid));
            }
        }
        if keys.is_empty() {
            return Ok(());
        }
        match self.dal.persistent().get_multi(&keys, true) {
            Ok(_) => Ok(()),
            Err(StoreError::KeyNotFound(_)) => {
                Err(self.not_found("points at a relation target that does not exist"))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save_related(&mut self, visited: &mut HashSet<String>) -> DalResult<()> {
        let names: Vec<String> = self.hybrid.relations().iter().map(|r| r.name.clone()).collect();
        for name in names {
            if let Some(target) = self.relation(&name)? {
                save_shared(&target, visited)?;
            }
        }
        let mut children: Vec<ObjectRef> = Vec::new();
        for foreign in self.hybrid.foreign_relations() {
            if let Some(list) = self.lists.get(&foreign.name) {
                children.extend(list.iter_loaded());
            }
        }
        for child in children {
            save_shared(&child, visited)?;
        }
        Ok(())
    }
}

fn save_shared(object: &ObjectRef, visited: &mut HashSet<String>) -> DalResult<()> {
    // Already borrowed means it is being saved further up this call.
    let Ok(mut object) = object.try_borrow_mut() else {
        return Ok(());
    };
    if object.volatile || visited.contains(&object.key) {
        return Ok(());
    }
    object.save_inner(true, visited)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use super::*;
    use crate::testing::{self, disk, router, FlakyStore};

    // -----------------------------------------------------------------------
    // Basics
    // -----------------------------------------------------------------------

    #[test]
    fn create_read_update_delete() {
        let dal = testing::dal();
        let mut d = dal.create("Disk").unwrap();
        d.set("name", json!("disk")).unwrap();
        d.save().unwrap();
        assert!(!d.is_new());

        let mut loaded = dal.load("Disk", d.guid()).unwrap();
        assert_eq!(loaded.get("name").unwrap(), &json!("disk"));
        loaded.set("size", json!(100)).unwrap();
        loaded.save().unwrap();

        let again = dal.load("Disk", d.guid()).unwrap();
        assert_eq!(again.get("size").unwrap(), &json!(100));

        loaded.delete().unwrap();
        assert!(dal.load("Disk", d.guid()).unwrap_err().is_not_found());
    }

    #[test]
    fn version_increments_by_one() {
        let dal = testing::dal();
        let mut d = disk(&dal, "sda", None);
        assert_eq!(d.version(), 1);
        d.save().unwrap();
        assert_eq!(d.version(), 2);
        d.set("size", json!(1)).unwrap();
        d.save().unwrap();
        assert_eq!(d.version(), 3);
        assert_eq!(dal.load("Disk", d.guid()).unwrap().version(), 3);
    }

    #[test]
    fn round_trip_keeps_every_property() {
        let dal = testing::dal();
        let mut d = dal.create("Disk").unwrap();
        d.set("name", json!("sda")).unwrap();
        d.set("size", json!(512)).unwrap();
        d.set("serial", json!("S-1")).unwrap();
        d.set("state", json!("FAILURE")).unwrap();
        d.set("tags", json!({"rack": 4})).unwrap();
        d.save().unwrap();
        let loaded = dal.load("Disk", d.guid()).unwrap();
        assert_eq!(loaded.export(), d.export());
    }

    #[test]
    fn missing_fields_are_all_named() {
        let dal = testing::dal();
        let mut p = dal.create("Partition").unwrap();
        let err = p.save().unwrap_err();
        match &err {
            DalError::MissingFields { fields, .. } => {
                assert_eq!(fields, &vec!["offset".to_string(), "disk".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.to_string().contains("offset"));
    }

    #[test]
    fn mandatory_name_scenario() {
        let dal = testing::dal();
        let mut d = dal.create("Disk").unwrap();
        let err = d.save().unwrap_err();
        assert!(matches!(err, DalError::MissingFields { .. }));
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn missing_relation_target_is_not_found() {
        let dal = testing::dal();
        let mut r = router(&dal, "node1");
        let mut d = dal.create("Disk").unwrap();
        d.set("name", json!("sda")).unwrap();
        d.set_relation("storagerouter", Some(&r)).unwrap();
        r.delete().unwrap();
        let err = d.save().unwrap_err();
        assert!(matches!(err, DalError::ObjectNotFound { ref guid, .. } if *guid == d.guid().to_string()));
    }

    #[test]
    fn saving_a_deleted_row_fails() {
        let dal = testing::dal();
        let d = disk(&dal, "sda", None);
        let mut stale = dal.load("Disk", d.guid()).unwrap();
        dal.load("Disk", d.guid()).unwrap().delete().unwrap();
        stale.set("size", json!(1)).unwrap();
        let err = stale.save().unwrap_err();
        assert!(err.is_not_found());
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    fn diverge(dal: &crate::Dal, policy: ConflictPolicy) -> (DataObject, DalResult<()>) {
        let d = disk(dal, "sda", None);
        let mut first = dal.load("Disk", d.guid()).unwrap();
        let mut second = dal.load("Disk", d.guid()).unwrap().with_policy(policy);
        first.set("name", json!("first")).unwrap();
        second.set("name", json!("second")).unwrap();
        first.save().unwrap();
        let outcome = second.save();
        (second, outcome)
    }

    #[test]
    fn local_wins_by_default() {
        let dal = testing::dal();
        let (second, outcome) = diverge(&dal, ConflictPolicy::LocalWins);
        outcome.unwrap();
        assert_eq!(second.get("name").unwrap(), &json!("second"));
        let stored = dal.load("Disk", second.guid()).unwrap();
        assert_eq!(stored.get("name").unwrap(), &json!("second"));
        assert_eq!(stored.version(), 3);
    }

    #[test]
    fn datastore_wins_discards_local_edit() {
        let dal = testing::dal();
        let (second, outcome) = diverge(&dal, ConflictPolicy::DatastoreWins);
        outcome.unwrap();
        assert_eq!(second.get("name").unwrap(), &json!("first"));
        let stored = dal.load("Disk", second.guid()).unwrap();
        assert_eq!(stored.get("name").unwrap(), &json!("first"));
    }

    #[test]
    fn raise_names_conflicting_fields() {
        let dal = testing::dal();
        let (_, outcome) = diverge(&dal, ConflictPolicy::Raise);
        match outcome.unwrap_err() {
            DalError::Concurrency { fields, .. } => assert_eq!(fields, vec!["name".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_conflicting_edits_merge() {
        let dal = testing::dal();
        let d = disk(&dal, "sda", None);
        let mut first = dal.load("Disk", d.guid()).unwrap();
        let mut second = dal.load("Disk", d.guid()).unwrap().with_policy(ConflictPolicy::Raise);
        first.set("size", json!(10)).unwrap();
        first.save().unwrap();
        second.set("serial", json!("X")).unwrap();
        second.save().unwrap();
        let stored = dal.load("Disk", d.guid()).unwrap();
        assert_eq!(stored.get("size").unwrap(), &json!(10));
        assert_eq!(stored.get("serial").unwrap(), &json!("X"));
        assert_eq!(stored.version(), 3);
    }

    #[test]
    fn stale_instances_never_share_a_version() {
        let dal = testing::dal();
        let d = disk(&dal, "sda", None);
        let mut a = dal.load("Disk", d.guid()).unwrap();
        let mut b = dal.load("Disk", d.guid()).unwrap();
        a.save().unwrap();
        b.save().unwrap();
        assert_eq!(a.version(), 2);
        assert_eq!(b.version(), 3);
    }

    #[test]
    fn retry_ceiling_raises_race_condition() {
        let store = Arc::new(FlakyStore::new());
        let fx = testing::fixture_on(store.clone());
        let mut d = disk(&fx.dal, "sda", None);
        store.fail_next(6);
        d.set("size", json!(1)).unwrap();
        match d.save().unwrap_err() {
            DalError::RaceCondition { attempts, last_conflict, .. } => {
                assert_eq!(attempts, 5);
                assert_eq!(last_conflict.as_deref(), Some("dal_flaky"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.attempts(), 5);
    }

    #[test]
    fn fifth_attempt_may_still_succeed() {
        let store = Arc::new(FlakyStore::new());
        let fx = testing::fixture_on(store.clone());
        let mut d = disk(&fx.dal, "sda", None);
        store.fail_next(4);
        d.set("size", json!(1)).unwrap();
        d.save().unwrap();
        assert_eq!(store.attempts(), 5);
        assert_eq!(d.version(), 2);
    }

    #[test]
    fn threaded_saves_bump_version_once_each() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 20;

        let dal = testing::dal();
        let guid = disk(&dal, "sda", None).guid();

        let saved: u64 = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..THREADS)
                .map(|t| {
                    let dal = dal.clone();
                    scope.spawn(move || {
                        let mut saved = 0u64;
                        for i in 0..ROUNDS {
                            let mut d = dal.load("Disk", guid).unwrap();
                            d.set("size", json!(t * ROUNDS + i)).unwrap();
                            match d.save() {
                                Ok(()) => saved += 1,
                                Err(DalError::RaceCondition { .. })
                                | Err(DalError::LockUnavailable(_)) => {}
                                Err(e) => panic!("unexpected {e}"),
                            }
                        }
                        saved
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert!(saved > 0);
        let stored = dal.load("Disk", guid).unwrap();
        assert_eq!(stored.version(), saved + 1);
    }

    // -----------------------------------------------------------------------
    // Uniqueness
    // -----------------------------------------------------------------------

    #[test]
    fn duplicate_unique_value_is_rejected() {
        let dal = testing::dal();
        let mut a = dal.create("Disk").unwrap();
        a.set("name", json!("sda")).unwrap();
        a.set("serial", json!("S-1")).unwrap();
        a.save().unwrap();

        let mut b = dal.create("Disk").unwrap();
        b.set("name", json!("sdb")).unwrap();
        b.set("serial", json!("S-1")).unwrap();
        match b.save().unwrap_err() {
            DalError::UniqueConstraintViolation { field, .. } => assert_eq!(field, "serial"),
            other => panic!("unexpected {other:?}"),
        }

        a.delete().unwrap();
        b.save().unwrap();
    }

    #[test]
    fn changing_unique_value_frees_the_old_one() {
        let dal = testing::dal();
        let mut a = dal.create("Disk").unwrap();
        a.set("name", json!("sda")).unwrap();
        a.set("serial", json!("S-1")).unwrap();
        a.save().unwrap();
        a.set("serial", json!("S-2")).unwrap();
        a.save().unwrap();

        let mut b = dal.create("Disk").unwrap();
        b.set("name", json!("sdb")).unwrap();
        b.set("serial", json!("S-1")).unwrap();
        b.save().unwrap();
    }

    #[test]
    fn null_unique_values_do_not_collide() {
        let dal = testing::dal();
        disk(&dal, "sda", None);
        disk(&dal, "sdb", None);
    }

    // -----------------------------------------------------------------------
    // Indexes and markers
    // -----------------------------------------------------------------------

    fn bucket(dal: &crate::Dal, value: &str) -> Option<Value> {
        let hybrid = dal.resolve("Disk").unwrap();
        let key = dal.keys().index(hybrid.type_name(), "name", &json!(value));
        dal.persistent().get(&key).ok()
    }

    #[test]
    fn index_buckets_follow_values() {
        let dal = testing::dal();
        let mut d = disk(&dal, "sda", None);
        assert_eq!(bucket(&dal, "sda"), Some(json!([d.key()])));
        d.set("name", json!("sdb")).unwrap();
        d.save().unwrap();
        assert_eq!(bucket(&dal, "sda"), None);
        assert_eq!(bucket(&dal, "sdb"), Some(json!([d.key()])));
        let other = disk(&dal, "sdb", None);
        assert_eq!(bucket(&dal, "sdb"), Some(json!([d.key(), other.key()])));
    }

    #[test]
    fn reverse_marker_moves_with_relation() {
        let dal = testing::dal();
        let mut r1 = router(&dal, "node1");
        let mut r2 = router(&dal, "node2");
        let mut d = disk(&dal, "sda", Some(&r1));
        assert_eq!(r1.related_guids("disks").unwrap(), vec![d.guid()]);
        d.set_relation("storagerouter", Some(&r2)).unwrap();
        d.save().unwrap();
        assert!(r1.related_guids("disks").unwrap().is_empty());
        assert_eq!(r2.related_guids("disks").unwrap(), vec![d.guid()]);
    }

    #[test]
    fn relation_cascade_scenario() {
        let dal = testing::dal();
        let mut p = router(&dal, "parent");
        let mut c1 = disk(&dal, "c1", Some(&p));
        disk(&dal, "c2", Some(&p));
        assert_eq!(p.related("disks").unwrap().len(), 2);
        c1.delete().unwrap();
        assert_eq!(p.related("disks").unwrap().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Recursive save
    // -----------------------------------------------------------------------

    #[test]
    fn recursive_save_reaches_parent_and_children() {
        let dal = testing::dal();
        let mut r = router(&dal, "node1");
        disk(&dal, "sda", Some(&r));
        let child = r.related("disks").unwrap().get(0).unwrap();
        child.borrow_mut().set("size", json!(9)).unwrap();
        r.set("name", json!("renamed")).unwrap();
        r.save_recursive().unwrap();

        let guid = child.borrow().guid();
        assert_eq!(dal.load("Disk", guid).unwrap().get("size").unwrap(), &json!(9));
        assert_eq!(dal.load("StorageRouter", r.guid()).unwrap().get("name").unwrap(), &json!("renamed"));
    }

    #[test]
    fn recursive_save_terminates_on_cycles() {
        let dal = testing::dal();
        let r: ObjectRef = Rc::new(RefCell::new(router(&dal, "node1")));
        let mut d = dal.create("Disk").unwrap();
        d.set("name", json!("sda")).unwrap();
        d.set_relation_ref("storagerouter", Some(Rc::clone(&r))).unwrap();
        d.save().unwrap();
        {
            let mut router = r.borrow_mut();
            router.related("disks").unwrap().load().unwrap();
        }
        d.set("size", json!(2)).unwrap();
        d.save_recursive().unwrap();
        assert_eq!(d.version(), 2);
        assert_eq!(r.borrow().version(), 2);
    }

    #[test]
    fn unknown_guid_relation_is_rejected_before_commit() {
        let dal = testing::dal();
        let mut p = dal.create("Partition").unwrap();
        p.set("offset", json!(0)).unwrap();
        let mut ghost = dal.create("Disk").unwrap();
        ghost.set("name", json!("ghost")).unwrap();
        p.set_relation("disk", Some(&ghost)).unwrap();
        assert!(p.save().unwrap_err().is_not_found());
    }
}
