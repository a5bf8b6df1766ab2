use std::collections::HashMap;
use std::sync::Arc;

use hdal_schema::{Hybrid, TypeRegistry};
use hdal_store::{PersistentStore, VolatileMutex, VolatileStore};
use hdal_types::{Guid, KeyScheme};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::DalConfig;
use crate::error::{DalError, DalResult};
use crate::list::{DataList, ListBuilder};
use crate::object::{DataObject, Row};
use crate::query::Query;

/// Computation behind a dynamic property.
pub type DynamicFn = Arc<dyn Fn(&mut DataObject) -> DalResult<Value> + Send + Sync>;

struct DalInner {
    registry: TypeRegistry,
    volatile: Arc<dyn VolatileStore>,
    persistent: Arc<dyn PersistentStore>,
    config: DalConfig,
    keys: KeyScheme,
    // Keyed by (hybrid identifier, dynamic name).
    dynamics: HashMap<(String, String), DynamicFn>,
}

/// Handle on one persistence layer: the type registry, both stores and the
/// bound dynamic functions.
///
/// Cheap to clone; every object and list carries one.
#[derive(Clone)]
pub struct Dal {
    inner: Arc<DalInner>,
}

impl Dal {
    pub fn builder(
        registry: TypeRegistry,
        volatile: Arc<dyn VolatileStore>,
        persistent: Arc<dyn PersistentStore>,
    ) -> DalBuilder {
        DalBuilder::new(registry, volatile, persistent)
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &DalConfig {
        &self.inner.config
    }

    pub fn keys(&self) -> &KeyScheme {
        &self.inner.keys
    }

    pub fn volatile(&self) -> &Arc<dyn VolatileStore> {
        &self.inner.volatile
    }

    pub fn persistent(&self) -> &Arc<dyn PersistentStore> {
        &self.inner.persistent
    }

    /// Resolve a type name through hybrid substitution.
    pub fn resolve(&self, type_name: &str) -> DalResult<Arc<Hybrid>> {
        Ok(self.inner.registry.resolve(type_name)?)
    }

    // ---- Objects ----

    /// A new, unsaved instance with every property at its default.
    pub fn create(&self, type_name: &str) -> DalResult<DataObject> {
        Ok(DataObject::create(self.clone(), self.resolve(type_name)?))
    }

    /// A new instance seeded from `data`. Unknown fields are ignored; known
    /// properties are type-checked.
    pub fn create_with(&self, type_name: &str, data: &Map<String, Value>) -> DalResult<DataObject> {
        let mut object = self.create(type_name)?;
        object.apply_properties(data)?;
        Ok(object)
    }

    /// Load an existing instance, from the volatile cache if possible.
    pub fn load(&self, type_name: &str, guid: Guid) -> DalResult<DataObject> {
        DataObject::load(self.clone(), self.resolve(type_name)?, guid)
    }

    /// An existing instance built from a row the caller already holds.
    pub fn hydrate(&self, type_name: &str, guid: Guid, row: Row) -> DalResult<DataObject> {
        Ok(DataObject::hydrate(self.clone(), self.resolve(type_name)?, guid, row))
    }

    /// A read-only instance that refuses `save` and `delete`.
    pub fn ephemeral(&self, type_name: &str, data: &Map<String, Value>) -> DalResult<DataObject> {
        let mut object = self.create_with(type_name, data)?;
        object.mark_volatile();
        Ok(object)
    }

    // ---- Lists ----

    pub fn list(&self, type_name: &str) -> DalResult<ListBuilder> {
        Ok(ListBuilder::new(self.clone(), self.resolve(type_name)?))
    }

    pub fn query(&self, type_name: &str, query: Query) -> DalResult<DataList> {
        self.list(type_name)?.query(query).execute()
    }

    /// Every stored instance of a type.
    pub fn all(&self, type_name: &str) -> DalResult<DataList> {
        self.list(type_name)?.execute()
    }

    // ---- Internals ----

    pub(crate) fn dynamic_fn(&self, hybrid: &Hybrid, name: &str) -> DalResult<DynamicFn> {
        self.inner
            .dynamics
            .get(&(hybrid.identifier().to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| DalError::UnboundDynamic {
                type_name: hybrid.name().to_string(),
                name: name.to_string(),
            })
    }

    pub(crate) fn mutex(&self, key: &str) -> VolatileMutex {
        VolatileMutex::new(
            Arc::clone(&self.inner.volatile),
            self.inner.keys.lock(key),
            self.inner.config.mutex_ttl,
        )
    }

    pub(crate) fn version_mutex(&self, hybrid: &Hybrid, guid: &Guid) -> VolatileMutex {
        self.mutex(&self.inner.keys.version_mutex(hybrid.type_name(), guid))
    }
}

impl std::fmt::Debug for Dal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dal")
            .field("namespace", &self.inner.keys.namespace())
            .field("types", &self.inner.registry.len())
            .field("dynamics", &self.inner.dynamics.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Wires a registry to its stores and binds every declared dynamic.
pub struct DalBuilder {
    registry: TypeRegistry,
    volatile: Arc<dyn VolatileStore>,
    persistent: Arc<dyn PersistentStore>,
    config: DalConfig,
    bindings: Vec<(String, String, DynamicFn)>,
}

impl DalBuilder {
    pub fn new(
        registry: TypeRegistry,
        volatile: Arc<dyn VolatileStore>,
        persistent: Arc<dyn PersistentStore>,
    ) -> Self {
        Self {
            registry,
            volatile,
            persistent,
            config: DalConfig::default(),
            bindings: Vec::new(),
        }
    }

    pub fn config(mut self, config: DalConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind the computation of dynamic `name` on `type_name`.
    pub fn dynamic<F>(mut self, type_name: &str, name: &str, f: F) -> Self
    where
        F: Fn(&mut DataObject) -> DalResult<Value> + Send + Sync + 'static,
    {
        self.bindings
            .push((type_name.to_string(), name.to_string(), Arc::new(f)));
        self
    }

    /// Fails if a binding names an undeclared dynamic, or a declared
    /// dynamic is left unbound.
    pub fn build(self) -> DalResult<Dal> {
        self.config.validate()?;
        let mut dynamics = HashMap::new();
        for (type_name, name, f) in self.bindings {
            let hybrid = self.registry.resolve(&type_name)?;
            if hybrid.dynamic(&name).is_none() {
                return Err(DalError::UnknownAttribute {
                    type_name: hybrid.name().to_string(),
                    name,
                });
            }
            dynamics.insert((hybrid.identifier().to_string(), name), f);
        }
        for hybrid in self.registry.hybrids() {
            for dynamic in hybrid.dynamics() {
                let key = (hybrid.identifier().to_string(), dynamic.name.clone());
                if !dynamics.contains_key(&key) {
                    return Err(DalError::UnboundDynamic {
                        type_name: hybrid.name().to_string(),
                        name: dynamic.name.clone(),
                    });
                }
            }
        }
        let keys = KeyScheme::new(self.config.namespace.clone());
        debug!(
            namespace = %keys.namespace(),
            types = self.registry.len(),
            dynamics = dynamics.len(),
            "dal ready"
        );
        Ok(Dal {
            inner: Arc::new(DalInner {
                registry: self.registry,
                volatile: self.volatile,
                persistent: self.persistent,
                config: self.config,
                keys,
                dynamics,
            }),
        })
    }
}
