//! Key naming scheme for everything the DAL writes.
//!
//! All keys share a configurable namespace (`dal` by default):
//!
//! | Purpose | Layout |
//! |---|---|
//! | object row | `<ns>_data_<type>_<guid>` |
//! | forward index bucket | `<ns>_index_<type>\|<property>\|<digest>` |
//! | reverse index marker | `<ns>_reverseindex_<type>_<parent-guid>\|<relation>\|<child-guid>` |
//! | uniqueness claim | `<ns>_unique_<type>_<property>_<digest>` |
//! | cached list result | `<ns>_list_<key-or-hash>` |
//! | list cache marker | `<ns>_listcache_<type>\|<field>\|<list-key>` |
//! | row version mutex | `<ns>_dataversion_<type>_<guid>` |
//!
//! Type names are restricted to lowercase ASCII alphanumerics so that a
//! prefix scan over one type can never match rows of another.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::digest::ValueDigest;
use crate::error::TypeError;
use crate::guid::Guid;

/// Storage name of a hybrid type: lowercase ASCII alphanumerics.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeName(String);

impl TypeName {
    /// Validate and lowercase a declared type name.
    pub fn new(name: &str) -> Result<Self, TypeError> {
        if name.is_empty() {
            return Err(TypeError::InvalidTypeName {
                name: name.to_string(),
                reason: "empty".into(),
            });
        }
        if let Some(c) = name.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(TypeError::InvalidTypeName {
                name: name.to_string(),
                reason: format!("character {c:?} is not an ASCII letter or digit"),
            });
        }
        Ok(Self(name.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TypeName {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<TypeName> for String {
    fn from(name: TypeName) -> Self {
        name.0
    }
}

impl fmt::Debug for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeName({})", self.0)
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded form of a list cache marker key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListCacheMarker {
    pub type_name: String,
    pub field: String,
    pub cache_key: String,
}

/// Builds every key the DAL reads or writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyScheme {
    namespace: String,
}

impl KeyScheme {
    /// Marker field that references every field of a type.
    pub const ALL_FIELDS: &'static str = "__all";

    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    // ---------------------------------------------------------------
    // Object rows
    // ---------------------------------------------------------------

    /// Prefix shared by all rows of one type.
    pub fn object_prefix(&self, type_name: &TypeName) -> String {
        format!("{}_data_{}_", self.namespace, type_name)
    }

    pub fn object(&self, type_name: &TypeName, guid: &Guid) -> String {
        format!("{}{}", self.object_prefix(type_name), guid)
    }

    /// Recover the guid from a row key of the given type.
    pub fn guid_from_object_key(&self, type_name: &TypeName, key: &str) -> Result<Guid, TypeError> {
        let prefix = self.object_prefix(type_name);
        let raw = key
            .strip_prefix(&prefix)
            .ok_or_else(|| TypeError::MalformedKey(key.to_string()))?;
        Guid::parse(raw)
    }

    pub fn version_mutex(&self, type_name: &TypeName, guid: &Guid) -> String {
        format!("{}_dataversion_{}_{}", self.namespace, type_name, guid)
    }

    /// Volatile cache key of a computed property.
    pub fn dynamic(object_key: &str, name: &str) -> String {
        format!("{object_key}_{name}")
    }

    // ---------------------------------------------------------------
    // Indexes
    // ---------------------------------------------------------------

    pub fn index(&self, type_name: &TypeName, property: &str, value: &Value) -> String {
        format!(
            "{}_index_{}|{}|{}",
            self.namespace,
            type_name,
            property,
            ValueDigest::of(value).to_hex()
        )
    }

    /// Prefix of all reverse markers of one parent relation.
    pub fn reverse_prefix(&self, parent_type: &TypeName, parent_guid: &Guid, relation: &str) -> String {
        format!(
            "{}_reverseindex_{}_{}|{}|",
            self.namespace, parent_type, parent_guid, relation
        )
    }

    pub fn reverse(
        &self,
        parent_type: &TypeName,
        parent_guid: &Guid,
        relation: &str,
        child_guid: &Guid,
    ) -> String {
        format!(
            "{}{}",
            self.reverse_prefix(parent_type, parent_guid, relation),
            child_guid
        )
    }

    // ---------------------------------------------------------------
    // Uniqueness claims
    // ---------------------------------------------------------------

    pub fn unique_prefix(&self, type_name: &TypeName) -> String {
        format!("{}_unique_{}_", self.namespace, type_name)
    }

    pub fn unique(&self, type_name: &TypeName, property: &str, value: &Value) -> String {
        format!(
            "{}{}_{}",
            self.unique_prefix(type_name),
            property,
            ValueDigest::of(value).to_hex()
        )
    }

    /// Whether a key is any uniqueness claim in this namespace.
    pub fn is_unique_key(&self, key: &str) -> bool {
        key.starts_with(&format!("{}_unique_", self.namespace))
    }

    /// Property name encoded in a claim key of the given type.
    pub fn unique_field(&self, type_name: &TypeName, key: &str) -> Option<String> {
        let rest = key.strip_prefix(&self.unique_prefix(type_name))?;
        let (field, _digest) = rest.rsplit_once('_')?;
        Some(field.to_string())
    }

    // ---------------------------------------------------------------
    // List caching
    // ---------------------------------------------------------------

    pub fn list(&self, key_or_hash: &str) -> String {
        format!("{}_list_{}", self.namespace, key_or_hash)
    }

    /// Marker prefix for a type, optionally narrowed to one field.
    pub fn list_cache_prefix(&self, type_name: &str, field: Option<&str>) -> String {
        match field {
            Some(field) => format!("{}_listcache_{}|{}|", self.namespace, type_name, field),
            None => format!("{}_listcache_{}|", self.namespace, type_name),
        }
    }

    pub fn list_cache_marker(&self, type_name: &str, field: &str, cache_key: &str) -> String {
        format!("{}{}", self.list_cache_prefix(type_name, Some(field)), cache_key)
    }

    pub fn parse_list_cache_marker(&self, key: &str) -> Result<ListCacheMarker, TypeError> {
        let head = format!("{}_listcache_", self.namespace);
        let rest = key
            .strip_prefix(&head)
            .ok_or_else(|| TypeError::MalformedKey(key.to_string()))?;
        let mut parts = rest.splitn(3, '|');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(type_name), Some(field), Some(cache_key)) => Ok(ListCacheMarker {
                type_name: type_name.to_string(),
                field: field.to_string(),
                cache_key: cache_key.to_string(),
            }),
            _ => Err(TypeError::MalformedKey(key.to_string())),
        }
    }

    // ---------------------------------------------------------------
    // Locks
    // ---------------------------------------------------------------

    pub fn lock(&self, name: &str) -> String {
        format!("{}_lock_{}", self.namespace, name)
    }
}

impl Default for KeyScheme {
    fn default() -> Self {
        Self::new("dal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn disk() -> TypeName {
        TypeName::new("Disk").unwrap()
    }

    #[test]
    fn type_names_are_lowercased() {
        assert_eq!(disk().as_str(), "disk");
    }

    #[test]
    fn type_names_reject_separators() {
        assert!(TypeName::new("v_disk").is_err());
        assert!(TypeName::new("v|disk").is_err());
        assert!(TypeName::new("").is_err());
    }

    #[test]
    fn object_key_layout() {
        let keys = KeyScheme::default();
        let guid = Guid::new();
        let key = keys.object(&disk(), &guid);
        assert_eq!(key, format!("dal_data_disk_{guid}"));
        assert_eq!(keys.guid_from_object_key(&disk(), &key).unwrap(), guid);
    }

    #[test]
    fn guid_from_foreign_key_fails() {
        let keys = KeyScheme::default();
        let other = TypeName::new("vpool").unwrap();
        let key = keys.object(&other, &Guid::new());
        assert!(keys.guid_from_object_key(&disk(), &key).is_err());
    }

    #[test]
    fn index_and_unique_layouts() {
        let keys = KeyScheme::new("ovs");
        let index = keys.index(&disk(), "name", &json!("a"));
        assert!(index.starts_with("ovs_index_disk|name|"));
        let unique = keys.unique(&disk(), "serial_number", &json!("x"));
        assert!(unique.starts_with("ovs_unique_disk_serial_number_"));
        assert!(keys.is_unique_key(&unique));
        assert_eq!(keys.unique_field(&disk(), &unique).as_deref(), Some("serial_number"));
    }

    #[test]
    fn reverse_layout() {
        let keys = KeyScheme::default();
        let parent = Guid::new();
        let child = Guid::new();
        let key = keys.reverse(&disk(), &parent, "partitions", &child);
        assert_eq!(key, format!("dal_reverseindex_disk_{parent}|partitions|{child}"));
        assert!(key.starts_with(&keys.reverse_prefix(&disk(), &parent, "partitions")));
    }

    #[test]
    fn list_marker_roundtrip() {
        let keys = KeyScheme::default();
        let marker = keys.list_cache_marker("disk", "name", "dal_list_abc|def");
        let parsed = keys.parse_list_cache_marker(&marker).unwrap();
        assert_eq!(parsed.type_name, "disk");
        assert_eq!(parsed.field, "name");
        assert_eq!(parsed.cache_key, "dal_list_abc|def");
    }

    #[test]
    fn list_prefix_narrowing() {
        let keys = KeyScheme::default();
        let marker = keys.list_cache_marker("disk", "name", "k");
        assert!(marker.starts_with(&keys.list_cache_prefix("disk", None)));
        assert!(marker.starts_with(&keys.list_cache_prefix("disk", Some("name"))));
        assert!(!marker.starts_with(&keys.list_cache_prefix("disk", Some("size"))));
    }
}
