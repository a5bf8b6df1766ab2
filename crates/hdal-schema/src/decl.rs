use serde::{Deserialize, Serialize};

use crate::attribute::{Dynamic, Property, Relation};

/// Declaration of one type, before resolution.
///
/// Relation targets are referenced by name only; they are resolved when the
/// whole schema is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    /// Base type this declaration substitutes system-wide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(default)]
    pub dynamics: Vec<Dynamic>,
}

impl TypeDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extends: None,
            properties: Vec::new(),
            relations: Vec::new(),
            dynamics: Vec::new(),
        }
    }

    /// Declare `name` as the hybrid extension of `base`.
    ///
    /// The extension inherits every attribute of the base, may add new ones
    /// and may redeclare inherited ones by name. It is stored under the base's
    /// type name, and every lookup of the base resolves to it.
    pub fn extension(name: impl Into<String>, base: impl Into<String>) -> Self {
        let mut decl = Self::new(name);
        decl.extends = Some(base.into());
        decl
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn dynamic(mut self, dynamic: Dynamic) -> Self {
        self.dynamics.push(dynamic);
        self
    }
}
