//! Shared fixtures for the crate's tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hdal_schema::{
    Dynamic, Property, PropertyType, Relation, SchemaBuilder, TypeDecl, TypeRegistry,
};
use hdal_store::{
    InMemoryPersistentStore, InMemoryVolatileStore, PersistentStore, StoreError, StoreResult,
    Transaction,
};
use serde_json::{json, Value};

use crate::config::DalConfig;
use crate::dal::Dal;
use crate::object::DataObject;

pub(crate) fn registry() -> TypeRegistry {
    SchemaBuilder::new()
        .declare(
            TypeDecl::new("StorageRouter")
                .property(Property::new("name", PropertyType::Str).indexed())
                .property(Property::new("ip", PropertyType::Str).optional().unique()),
        )
        .declare(
            TypeDecl::new("Disk")
                .property(Property::new("name", PropertyType::Str).indexed())
                .property(Property::new("size", PropertyType::Int).optional().indexed())
                .property(Property::new("serial", PropertyType::Str).optional().unique())
                .property(
                    Property::new(
                        "state",
                        PropertyType::Enum(vec![json!("OK"), json!("FAILURE")]),
                    )
                    .with_default(json!("OK")),
                )
                .property(Property::new("tags", PropertyType::Dict).optional())
                .relation(Relation::new("storagerouter", "StorageRouter", "disks").optional())
                .dynamic(Dynamic::new("label", PropertyType::Str, 30).locked())
                .dynamic(Dynamic::new("usage", PropertyType::Int, 0)),
        )
        .declare(
            TypeDecl::new("Partition")
                .property(Property::new("offset", PropertyType::Int))
                .relation(Relation::new("disk", "Disk", "partitions")),
        )
        .declare(
            TypeDecl::new("License")
                .property(Property::new("key", PropertyType::Str))
                .relation(
                    Relation::new("storagerouter", "StorageRouter", "license")
                        .optional()
                        .one_to_one(),
                ),
        )
        .build()
        .unwrap()
}

pub(crate) fn config() -> DalConfig {
    DalConfig {
        retry_backoff_max: Duration::ZERO,
        lock_timeout: Duration::from_millis(200),
        ..DalConfig::default()
    }
}

pub(crate) struct Fixture {
    pub dal: Dal,
    pub volatile: Arc<InMemoryVolatileStore>,
    pub label_calls: Arc<AtomicUsize>,
}

pub(crate) fn fixture_on(persistent: Arc<dyn PersistentStore>) -> Fixture {
    let volatile = Arc::new(InMemoryVolatileStore::new());
    let label_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&label_calls);
    let dal = Dal::builder(registry(), volatile.clone(), persistent)
        .config(config())
        .dynamic("Disk", "label", move |disk: &mut DataObject| {
            calls.fetch_add(1, Ordering::SeqCst);
            let name = disk.get("name")?.as_str().unwrap_or_default().to_string();
            Ok(json!(format!("disk:{name}")))
        })
        .dynamic("Disk", "usage", |disk: &mut DataObject| {
            Ok(disk.get("size")?.clone())
        })
        .build()
        .unwrap();
    Fixture {
        dal,
        volatile,
        label_calls,
    }
}

pub(crate) fn fixture() -> Fixture {
    fixture_on(Arc::new(InMemoryPersistentStore::new()))
}

pub(crate) fn dal() -> Dal {
    fixture().dal
}

pub(crate) fn router(dal: &Dal, name: &str) -> DataObject {
    let mut router = dal.create("StorageRouter").unwrap();
    router.set("name", json!(name)).unwrap();
    router.save().unwrap();
    router
}

pub(crate) fn disk(dal: &Dal, name: &str, router: Option<&DataObject>) -> DataObject {
    let mut disk = dal.create("Disk").unwrap();
    disk.set("name", json!(name)).unwrap();
    if router.is_some() {
        disk.set_relation("storagerouter", router).unwrap();
    }
    disk.save().unwrap();
    disk
}

// ---------------------------------------------------------------------------
// Store that fails on demand
// ---------------------------------------------------------------------------

/// Persistent store that rejects the next `n` transactions with an assertion
/// failure, then behaves like the wrapped in-memory store.
pub(crate) struct FlakyStore {
    inner: InMemoryPersistentStore,
    fail_next: AtomicU32,
    applied: AtomicU32,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: InMemoryPersistentStore::new(),
            fail_next: AtomicU32::new(0),
            applied: AtomicU32::new(0),
        }
    }

    pub(crate) fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
        self.applied.store(0, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.applied.load(Ordering::SeqCst)
    }
}

impl PersistentStore for FlakyStore {
    fn get(&self, key: &str) -> StoreResult<Value> {
        self.inner.get(key)
    }

    fn prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.prefix(prefix)
    }

    fn prefix_entries(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        self.inner.prefix_entries(prefix)
    }

    fn apply_transaction(&self, transaction: Transaction) -> StoreResult<()> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::AssertFailed("dal_flaky".into()));
        }
        self.inner.apply_transaction(transaction)
    }
}
