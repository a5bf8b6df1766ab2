//! Computed properties cached in the volatile store.
//!
//! Cached values are stored as `{"data": value}` under
//! `<object-key>_<name>`, so a cached `null` is distinguishable from a miss.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hdal_types::KeyScheme;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{DalError, DalResult};
use crate::object::DataObject;

impl DataObject {
    /// Read a dynamic property, computing it on a cache miss.
    ///
    /// Locked dynamics compute under a distributed mutex and re-check the
    /// cache once it is held.
    pub fn dynamic(&mut self, name: &str) -> DalResult<Value> {
        let dynamic = self
            .hybrid
            .dynamic(name)
            .cloned()
            .ok_or_else(|| self.unknown(name))?;
        let cache_key = KeyScheme::dynamic(&self.key, name);
        if let Some(value) = self.cached_dynamic(&cache_key)? {
            return Ok(value);
        }

        let _guard = if dynamic.locked {
            let guard = self
                .dal
                .mutex(&cache_key)
                .acquire(self.dal.config().lock_timeout)?;
            if let Some(value) = self.cached_dynamic(&cache_key)? {
                return Ok(value);
            }
            Some(guard)
        } else {
            None
        };

        let compute = self.dal.dynamic_fn(&self.hybrid, name)?;
        let started = Instant::now();
        let value = compute(self)?;
        self.timings.insert(name.to_string(), started.elapsed());

        dynamic
            .return_type
            .check(&value)
            .map_err(|failure| DalError::TypeMismatch {
                type_name: self.hybrid.name().to_string(),
                field: name.to_string(),
                allowed: failure.allowed,
                given: failure.given,
            })?;
        if dynamic.caches() {
            let ttl = Duration::from_secs(dynamic.ttl_secs.unsigned_abs());
            self.dal
                .volatile()
                .set(&cache_key, json!({ "data": value.clone() }), Some(ttl))?;
        }
        debug!(key = %cache_key, cached = dynamic.caches(), "dynamic computed");
        Ok(value)
    }

    fn cached_dynamic(&self, cache_key: &str) -> DalResult<Option<Value>> {
        match self.dal.volatile().get(cache_key)? {
            Some(Value::Object(mut envelope)) => Ok(envelope.remove("data")),
            _ => Ok(None),
        }
    }

    /// Evict cached values of the named dynamics, or of all of them.
    pub fn invalidate_dynamics(&self, names: Option<&[&str]>) -> DalResult<()> {
        for dynamic in self.hybrid.dynamics() {
            if let Some(names) = names {
                if !names.contains(&dynamic.name.as_str()) {
                    continue;
                }
            }
            let cache_key = KeyScheme::dynamic(&self.key, &dynamic.name);
            if dynamic.locked {
                let _guard = self
                    .dal
                    .mutex(&cache_key)
                    .acquire(self.dal.config().lock_timeout)?;
                self.dal.volatile().delete(&cache_key)?;
            } else {
                self.dal.volatile().delete(&cache_key)?;
            }
        }
        Ok(())
    }

    /// Duration of the last computation of each dynamic.
    pub fn dynamic_timings(&self) -> &HashMap<String, Duration> {
        &self.timings
    }

    pub fn reset_timings(&mut self) {
        self.timings.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;
    use crate::dal::Dal;
    use crate::testing::{self, disk};
    use hdal_schema::{Dynamic, PropertyType, SchemaBuilder, TypeDecl};
    use hdal_store::{InMemoryPersistentStore, InMemoryVolatileStore, VolatileStore};

    #[test]
    fn computes_once_then_serves_cache() {
        let fx = testing::fixture();
        let mut d = disk(&fx.dal, "sda", None);
        assert_eq!(d.dynamic("label").unwrap(), json!("disk:sda"));
        assert_eq!(d.dynamic("label").unwrap(), json!("disk:sda"));
        assert_eq!(fx.label_calls.load(Ordering::SeqCst), 1);
        assert!(d.dynamic_timings().contains_key("label"));
        d.reset_timings();
        assert!(d.dynamic_timings().is_empty());
    }

    #[test]
    fn zero_ttl_is_never_cached() {
        let fx = testing::fixture();
        let mut d = disk(&fx.dal, "sda", None);
        d.set("size", json!(7)).unwrap();
        assert_eq!(d.dynamic("usage").unwrap(), json!(7));
        let key = KeyScheme::dynamic(d.key(), "usage");
        assert!(fx.volatile.get(&key).unwrap().is_none());
    }

    #[test]
    fn save_invalidates_cached_dynamics() {
        let fx = testing::fixture();
        let mut d = disk(&fx.dal, "sda", None);
        d.dynamic("label").unwrap();
        d.set("name", json!("sdb")).unwrap();
        d.save().unwrap();
        assert_eq!(d.dynamic("label").unwrap(), json!("disk:sdb"));
        assert_eq!(fx.label_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalidate_named_only() {
        let fx = testing::fixture();
        let mut d = disk(&fx.dal, "sda", None);
        d.dynamic("label").unwrap();
        d.invalidate_dynamics(Some(&["usage"])).unwrap();
        d.dynamic("label").unwrap();
        assert_eq!(fx.label_calls.load(Ordering::SeqCst), 1);
        d.invalidate_dynamics(None).unwrap();
        d.dynamic("label").unwrap();
        assert_eq!(fx.label_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn held_lock_surfaces_as_lock_unavailable() {
        let fx = testing::fixture();
        let mut d = disk(&fx.dal, "sda", None);
        let key = KeyScheme::dynamic(d.key(), "label");
        let _held = fx.dal.mutex(&key).try_acquire().unwrap().unwrap();
        assert!(matches!(d.dynamic("label"), Err(DalError::LockUnavailable(_))));
    }

    #[test]
    fn wrong_return_type_is_rejected() {
        let registry = SchemaBuilder::new()
            .declare(TypeDecl::new("Vpool").dynamic(Dynamic::new("count", PropertyType::Int, 10)))
            .build()
            .unwrap();
        let volatile: Arc<dyn VolatileStore> = Arc::new(InMemoryVolatileStore::new());
        let dal = Dal::builder(registry, Arc::clone(&volatile), Arc::new(InMemoryPersistentStore::new()))
            .dynamic("Vpool", "count", |_| Ok(json!("many")))
            .build()
            .unwrap();
        let mut pool = dal.create("Vpool").unwrap();
        assert!(matches!(
            pool.dynamic("count"),
            Err(DalError::TypeMismatch { ref field, .. }) if field == "count"
        ));
        let key = KeyScheme::dynamic(pool.key(), "count");
        assert!(volatile.get(&key).unwrap().is_none());
    }
}
