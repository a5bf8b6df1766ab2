use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::decl::TypeDecl;
use crate::error::{SchemaError, SchemaResult};
use crate::registry::{SchemaBuilder, TypeRegistry};

/// A set of type declarations in TOML form.
///
/// ```toml
/// [[types]]
/// name = "Disk"
///
/// [[types.properties]]
/// name = "name"
/// type = "str"
/// indexed = true
///
/// [[types.properties]]
/// name = "state"
/// type = { enum = ["OK", "FAILURE", "MISSING"] }
///
/// [[types.relations]]
/// name = "storagerouter"
/// foreign_type = "StorageRouter"
/// foreign_key = "disks"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaFile {
    #[serde(default)]
    pub types: Vec<TypeDecl>,
}

impl SchemaFile {
    pub fn from_toml_str(raw: &str) -> SchemaResult<Self> {
        toml::from_str(raw).map_err(|e| SchemaError::Parse(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> SchemaResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> SchemaResult<String> {
        toml::to_string_pretty(self).map_err(|e| SchemaError::Parse(e.to_string()))
    }

    pub fn builder(self) -> SchemaBuilder {
        SchemaBuilder::new().declare_all(self.types)
    }

    pub fn build(self) -> SchemaResult<TypeRegistry> {
        self.builder().build()
    }
}
