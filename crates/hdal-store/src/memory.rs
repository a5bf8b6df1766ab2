use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::traits::{PersistentStore, VolatileStore};
use crate::transaction::{apply_operations, Transaction};

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Poisoned("in-memory store".into())
}

// ---------------------------------------------------------------------------
// Volatile
// ---------------------------------------------------------------------------

/// In-memory volatile cache with lazy TTL expiry.
///
/// Expired entries are dropped when next touched. Intended for tests and
/// single-process embedding.
pub struct InMemoryVolatileStore {
    entries: RwLock<HashMap<String, (Value, Option<Instant>)>>,
}

impl InMemoryVolatileStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|map| map.values().filter(|(_, exp)| live(*exp, now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Simulates a cache flush.
    pub fn clear(&self) {
        if let Ok(mut map) = self.entries.write() {
            map.clear();
        }
    }

    /// Sorted keys of all live entries.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .map(|map| {
                map.iter()
                    .filter(|(_, (_, exp))| live(*exp, now))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

fn live(expiry: Option<Instant>, now: Instant) -> bool {
    expiry.map_or(true, |at| at > now)
}

fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

impl Default for InMemoryVolatileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VolatileStore for InMemoryVolatileStore {
    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let now = Instant::now();
        {
            let map = self.entries.read().map_err(poisoned)?;
            match map.get(key) {
                None => return Ok(None),
                Some((value, exp)) if live(*exp, now) => return Ok(Some(value.clone())),
                Some(_) => {}
            }
        }
        self.entries.write().map_err(poisoned)?.remove(key);
        Ok(None)
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        let mut map = self.entries.write().map_err(poisoned)?;
        map.insert(key.to_string(), (value, expiry(ttl)));
        Ok(())
    }

    fn add(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<bool> {
        let now = Instant::now();
        let mut map = self.entries.write().map_err(poisoned)?;
        if let Some((_, exp)) = map.get(key) {
            if live(*exp, now) {
                return Ok(false);
            }
        }
        map.insert(key.to_string(), (value, expiry(ttl)));
        Ok(true)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.write().map_err(poisoned)?.remove(key);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryVolatileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryVolatileStore")
            .field("entry_count", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Persistent
// ---------------------------------------------------------------------------

/// In-memory transactional key-value store.
///
/// Keys live in a `BTreeMap` so prefix scans come out sorted. A transaction
/// is applied to a copy of the map which replaces the original only if every
/// operation succeeded.
pub struct InMemoryPersistentStore {
    data: RwLock<BTreeMap<String, Value>>,
}

impl InMemoryPersistentStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// Seed a store from existing key-value pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            data: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys, ascending.
    pub fn keys(&self) -> Vec<String> {
        self.data
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of the whole key space.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.data.read().map(|map| map.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.data.write() {
            map.clear();
        }
    }
}

pub(crate) fn scan<'a>(
    map: &'a BTreeMap<String, Value>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a Value)> + 'a {
    map.range(prefix.to_string()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
}

impl Default for InMemoryPersistentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentStore for InMemoryPersistentStore {
    fn get(&self, key: &str) -> StoreResult<Value> {
        let map = self.data.read().map_err(poisoned)?;
        map.get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    fn prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let map = self.data.read().map_err(poisoned)?;
        Ok(scan(&map, prefix).map(|(k, _)| k.clone()).collect())
    }

    fn prefix_entries(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        let map = self.data.read().map_err(poisoned)?;
        Ok(scan(&map, prefix)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn apply_transaction(&self, transaction: Transaction) -> StoreResult<()> {
        let mut map = self.data.write().map_err(poisoned)?;
        let mut staged = map.clone();
        apply_operations(&mut staged, transaction.operations())?;
        *map = staged;
        tracing::trace!(
            transaction = %transaction.id(),
            operations = transaction.len(),
            "applied transaction"
        );
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryPersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPersistentStore")
            .field("key_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // Volatile
    // -----------------------------------------------------------------------

    #[test]
    fn volatile_set_get_delete() {
        let store = InMemoryVolatileStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", json!({"a": 1}), None).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!({"a": 1})));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        store.delete("k").unwrap();
    }

    #[test]
    fn volatile_add_only_when_absent() {
        let store = InMemoryVolatileStore::new();
        assert!(store.add("k", json!(1), None).unwrap());
        assert!(!store.add("k", json!(2), None).unwrap());
        assert_eq!(store.get("k").unwrap(), Some(json!(1)));
    }

    #[test]
    fn volatile_entries_expire() {
        let store = InMemoryVolatileStore::new();
        store
            .set("k", json!(1), Some(Duration::from_millis(10)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(store.get("k").unwrap(), None);
        assert!(store.add("k", json!(2), None).unwrap());
    }

    #[test]
    fn volatile_clear() {
        let store = InMemoryVolatileStore::new();
        store.set("a", json!(1), None).unwrap();
        store.set("b", json!(2), None).unwrap();
        assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);
        store.clear();
        assert!(store.is_empty());
    }

    // -----------------------------------------------------------------------
    // Persistent
    // -----------------------------------------------------------------------

    #[test]
    fn persistent_get_missing_is_key_not_found() {
        let store = InMemoryPersistentStore::new();
        let err = store.get("nope").unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound(k) if k == "nope"));
        assert!(!store.exists("nope").unwrap());
    }

    #[test]
    fn persistent_prefix_is_sorted_and_bounded() {
        let store = InMemoryPersistentStore::new();
        store.set("b_2", json!(2)).unwrap();
        store.set("b_1", json!(1)).unwrap();
        store.set("a_1", json!(0)).unwrap();
        store.set("c_1", json!(0)).unwrap();
        assert_eq!(store.prefix("b_").unwrap(), vec!["b_1", "b_2"]);
        let entries = store.prefix_entries("b_").unwrap();
        assert_eq!(entries[1], ("b_2".to_string(), json!(2)));
    }

    #[test]
    fn failed_transaction_changes_nothing() {
        let store = InMemoryPersistentStore::new();
        store.set("a", json!(1)).unwrap();
        let mut tx = store.begin_transaction();
        tx.set("b", json!(2));
        tx.set("a", json!(5));
        tx.assert_value("c", Some(json!(3)));
        let err = store.apply_transaction(tx).unwrap_err();
        assert_eq!(err.conflict_key(), Some("c"));
        assert_eq!(store.get("a").unwrap(), json!(1));
        assert!(!store.exists("b").unwrap());
    }

    #[test]
    fn get_multi_respects_must_exist() {
        let store = InMemoryPersistentStore::new();
        store.set("a", json!(1)).unwrap();
        let keys = vec!["a".to_string(), "b".to_string()];
        let values = store.get_multi(&keys, false).unwrap();
        assert_eq!(values, vec![Some(json!(1)), None]);
        assert!(store.get_multi(&keys, true).is_err());
    }

    #[test]
    fn delete_prefix_helper() {
        let store = InMemoryPersistentStore::from_entries(vec![
            ("x_1".to_string(), json!(1)),
            ("x_2".to_string(), json!(2)),
            ("y_1".to_string(), json!(3)),
        ]);
        store.delete_prefix("x_").unwrap();
        assert_eq!(store.keys(), vec!["y_1"]);
    }

    #[test]
    fn delete_must_exist() {
        let store = InMemoryPersistentStore::new();
        assert!(store.delete("gone", false).is_ok());
        assert!(matches!(
            store.delete("gone", true),
            Err(StoreError::KeyNotFound(_))
        ));
    }
}
