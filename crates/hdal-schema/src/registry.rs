//! Two-phase schema build and the resolved type registry.

use std::collections::HashMap;
use std::sync::Arc;

use hdal_types::TypeName;
use tracing::debug;

use crate::attribute::{Attribute, Dynamic, ForeignRelation, Property, Relation, RelationKind};
use crate::decl::TypeDecl;
use crate::error::{SchemaError, SchemaResult};

#[derive(Clone, Copy, Debug)]
enum Slot {
    Property(usize),
    Relation(usize),
    Dynamic(usize),
    Foreign(usize),
}

/// A fully resolved type: base attributes merged with its extension, relation
/// targets bound, reverse collections installed.
#[derive(Debug)]
pub struct Hybrid {
    name: String,
    logical_name: String,
    type_name: TypeName,
    identifier: String,
    extends: Option<String>,
    properties: Vec<Property>,
    relations: Vec<Relation>,
    dynamics: Vec<Dynamic>,
    foreign: Vec<ForeignRelation>,
    slots: HashMap<String, Slot>,
}

impl Hybrid {
    /// Name of the concrete implementation (the extension's, if substituted).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name every caller uses to refer to this type (the base's).
    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    /// Storage name used in keys.
    pub fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    /// Identifier recorded in relation cells. Differs between a base and its
    /// extension even though both share one storage name.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Base type name when this hybrid is a substitution.
    pub fn extends(&self) -> Option<&str> {
        self.extends.as_deref()
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn dynamics(&self) -> &[Dynamic] {
        &self.dynamics
    }

    pub fn foreign_relations(&self) -> &[ForeignRelation] {
        &self.foreign
    }

    pub fn attribute(&self, name: &str) -> Option<Attribute<'_>> {
        Some(match *self.slots.get(name)? {
            Slot::Property(i) => Attribute::Property(&self.properties[i]),
            Slot::Relation(i) => Attribute::Relation(&self.relations[i]),
            Slot::Dynamic(i) => Attribute::Dynamic(&self.dynamics[i]),
            Slot::Foreign(i) => Attribute::Foreign(&self.foreign[i]),
        })
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        match self.attribute(name)? {
            Attribute::Property(p) => Some(p),
            _ => None,
        }
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        match self.attribute(name)? {
            Attribute::Relation(r) => Some(r),
            _ => None,
        }
    }

    pub fn dynamic(&self, name: &str) -> Option<&Dynamic> {
        match self.attribute(name)? {
            Attribute::Dynamic(d) => Some(d),
            _ => None,
        }
    }

    pub fn foreign_relation(&self, name: &str) -> Option<&ForeignRelation> {
        match self.attribute(name)? {
            Attribute::Foreign(f) => Some(f),
            _ => None,
        }
    }

    /// Whether `name` is a stored field (property or relation).
    pub fn is_stored(&self, name: &str) -> bool {
        matches!(
            self.slots.get(name),
            Some(Slot::Property(_)) | Some(Slot::Relation(_))
        )
    }
}

/// Identifier of a concrete implementation: its name plus a short digest.
fn identifier_for(name: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"hdal-hybrid-v1:");
    hasher.update(name.as_bytes());
    let digest = hex::encode(hasher.finalize().as_bytes());
    format!("{}_{}", name, &digest[..16])
}

fn is_reserved(name: &str) -> bool {
    name == "guid" || name.starts_with('_') || name.is_empty()
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects declarations, then resolves them all at once.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    decls: Vec<TypeDecl>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(mut self, decl: TypeDecl) -> Self {
        self.decls.push(decl);
        self
    }

    pub fn declare_all(mut self, decls: impl IntoIterator<Item = TypeDecl>) -> Self {
        self.decls.extend(decls);
        self
    }

    /// Resolve extensions and relation targets and freeze the schema.
    pub fn build(self) -> SchemaResult<TypeRegistry> {
        // Phase 1: names and extension topology.
        let mut seen: HashMap<TypeName, &str> = HashMap::new();
        for decl in &self.decls {
            let type_name = TypeName::new(&decl.name)?;
            if seen.insert(type_name, &decl.name).is_some() {
                return Err(SchemaError::DuplicateType(decl.name.clone()));
            }
            check_own_attributes(decl)?;
        }

        let by_key: HashMap<String, &TypeDecl> = self
            .decls
            .iter()
            .map(|d| (d.name.to_ascii_lowercase(), d))
            .collect();

        let mut extension_of: HashMap<String, &TypeDecl> = HashMap::new();
        for decl in self.decls.iter().filter(|d| d.extends.is_some()) {
            let base_name = decl.extends.as_deref().unwrap_or_default();
            let base = by_key
                .get(&base_name.to_ascii_lowercase())
                .ok_or_else(|| SchemaError::UnknownType(base_name.to_string()))?;
            if base.extends.is_some() {
                return Err(SchemaError::NestedExtension {
                    type_name: decl.name.clone(),
                    base: base.name.clone(),
                });
            }
            let key = base.name.to_ascii_lowercase();
            if let Some(first) = extension_of.get(&key) {
                return Err(SchemaError::ConflictingExtensions {
                    base: base.name.clone(),
                    first: first.name.clone(),
                    second: decl.name.clone(),
                });
            }
            extension_of.insert(key, decl);
        }

        // Every declared name, base or extension, resolves to its base.
        let mut aliases: HashMap<String, String> = HashMap::new();
        for decl in &self.decls {
            let logical = match &decl.extends {
                Some(base) => by_key[&base.to_ascii_lowercase()].name.clone(),
                None => decl.name.clone(),
            };
            aliases.insert(decl.name.to_ascii_lowercase(), logical);
        }

        // Phase 2: merge, bind relation targets, validate flags.
        let mut hybrids: Vec<Hybrid> = Vec::new();
        for base in self.decls.iter().filter(|d| d.extends.is_none()) {
            let extension = extension_of.get(&base.name.to_ascii_lowercase()).copied();
            let mut hybrid = merge(base, extension)?;
            for relation in &mut hybrid.relations {
                let declared = relation
                    .foreign_type
                    .clone()
                    .unwrap_or_else(|| base.name.clone());
                relation.target = aliases
                    .get(&declared.to_ascii_lowercase())
                    .cloned()
                    .ok_or_else(|| SchemaError::UnresolvedRelation {
                        type_name: hybrid.name.clone(),
                        relation: relation.name.clone(),
                        target: declared.clone(),
                    })?;
            }
            validate_flags(&hybrid)?;
            hybrids.push(hybrid);
        }

        // Phase 3: install reverse collections on relation targets.
        let positions: HashMap<String, usize> = hybrids
            .iter()
            .enumerate()
            .map(|(i, h)| (h.logical_name.clone(), i))
            .collect();
        let mut pending: Vec<(usize, ForeignRelation)> = Vec::new();
        for hybrid in &hybrids {
            for relation in &hybrid.relations {
                pending.push((
                    positions[&relation.target],
                    ForeignRelation {
                        name: relation.foreign_key.clone(),
                        child: hybrid.logical_name.clone(),
                        child_type_name: hybrid.type_name.clone(),
                        child_key: relation.name.clone(),
                        list: relation.kind == RelationKind::OneToMany,
                    },
                ));
            }
        }
        for (position, foreign) in pending {
            let target = &mut hybrids[position];
            if target.slots.contains_key(&foreign.name) {
                return Err(SchemaError::ForeignNameClash {
                    type_name: target.name.clone(),
                    name: foreign.name,
                });
            }
            target
                .slots
                .insert(foreign.name.clone(), Slot::Foreign(target.foreign.len()));
            target.foreign.push(foreign);
        }

        let registry = TypeRegistry::from_hybrids(hybrids, aliases);
        debug!(
            types = registry.len(),
            extensions = extension_of.len(),
            "schema built"
        );
        Ok(registry)
    }
}

fn check_own_attributes(decl: &TypeDecl) -> SchemaResult<()> {
    let names = decl
        .properties
        .iter()
        .map(|p| p.name.as_str())
        .chain(decl.relations.iter().map(|r| r.name.as_str()))
        .chain(decl.dynamics.iter().map(|d| d.name.as_str()));
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if is_reserved(name) {
            return Err(SchemaError::ReservedAttribute {
                type_name: decl.name.clone(),
                name: name.to_string(),
            });
        }
        if !seen.insert(name) {
            return Err(SchemaError::DuplicateAttribute {
                type_name: decl.name.clone(),
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Redeclare-by-name: the extension's attribute replaces the base's.
fn overlay<T: Clone>(base: &[T], extra: &[T], name: impl Fn(&T) -> &str) -> Vec<T> {
    let mut merged: Vec<T> = base.to_vec();
    for item in extra {
        match merged.iter().position(|m| name(m) == name(item)) {
            Some(i) => merged[i] = item.clone(),
            None => merged.push(item.clone()),
        }
    }
    merged
}

/// Attribute names of a declaration tagged by kind.
fn kinds(decl: &TypeDecl) -> Vec<(&str, u8)> {
    decl.properties
        .iter()
        .map(|p| (p.name.as_str(), 0))
        .chain(decl.relations.iter().map(|r| (r.name.as_str(), 1)))
        .chain(decl.dynamics.iter().map(|d| (d.name.as_str(), 2)))
        .collect()
}

/// An extension may redeclare an inherited attribute only with the same kind.
fn kind_clash(base: &TypeDecl, ext: &TypeDecl) -> Option<String> {
    let inherited: HashMap<&str, u8> = kinds(base).into_iter().collect();
    kinds(ext)
        .into_iter()
        .find(|(name, kind)| inherited.get(name).is_some_and(|k| k != kind))
        .map(|(name, _)| name.to_string())
}

fn merge(base: &TypeDecl, extension: Option<&TypeDecl>) -> SchemaResult<Hybrid> {
    let empty = TypeDecl::new(base.name.clone());
    let ext = extension.unwrap_or(&empty);

    if let Some(name) = kind_clash(base, ext) {
        return Err(SchemaError::DuplicateAttribute {
            type_name: ext.name.clone(),
            name,
        });
    }

    let properties = overlay(&base.properties, &ext.properties, |p| &p.name);
    let mut relations = overlay(&base.relations, &ext.relations, |r| &r.name);
    let dynamics = overlay(&base.dynamics, &ext.dynamics, |d| &d.name);

    // Self-references in the extension still mean the base's logical type.
    for relation in &mut relations {
        if relation.foreign_type.as_deref() == Some(ext.name.as_str()) {
            relation.foreign_type = None;
        }
    }

    let mut slots = HashMap::new();
    for (i, p) in properties.iter().enumerate() {
        slots.insert(p.name.clone(), Slot::Property(i));
    }
    for (i, r) in relations.iter().enumerate() {
        slots.insert(r.name.clone(), Slot::Relation(i));
    }
    for (i, d) in dynamics.iter().enumerate() {
        slots.insert(d.name.clone(), Slot::Dynamic(i));
    }

    let name = extension.map_or(base.name.clone(), |e| e.name.clone());
    if extension.is_some() {
        debug!(base = %base.name, extension = %name, "hybrid substituted");
    }
    Ok(Hybrid {
        identifier: identifier_for(&name),
        name,
        logical_name: base.name.clone(),
        type_name: TypeName::new(&base.name)?,
        extends: extension.map(|_| base.name.clone()),
        properties,
        relations,
        dynamics,
        foreign: Vec::new(),
        slots,
    })
}

fn validate_flags(hybrid: &Hybrid) -> SchemaResult<()> {
    for property in &hybrid.properties {
        if property.indexed && !property.ty.indexable() {
            return Err(SchemaError::InvalidFlag {
                type_name: hybrid.name.clone(),
                property: property.name.clone(),
                flag: "indexed",
                reason: format!("{} values cannot key an index", property.ty),
            });
        }
        if property.unique && !property.ty.claimable() {
            return Err(SchemaError::InvalidFlag {
                type_name: hybrid.name.clone(),
                property: property.name.clone(),
                flag: "unique",
                reason: format!("{} values cannot be claimed", property.ty),
            });
        }
        if let Some(default) = &property.default {
            if let Err(failure) = property.ty.check(default) {
                return Err(SchemaError::InvalidFlag {
                    type_name: hybrid.name.clone(),
                    property: property.name.clone(),
                    flag: "defaulted",
                    reason: format!(
                        "default is {}, allowed {:?}",
                        failure.given, failure.allowed
                    ),
                });
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable map from type names to resolved hybrids.
///
/// Every name a type was declared under (base or extension, any case)
/// resolves to the same [`Hybrid`].
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    hybrids: HashMap<String, Arc<Hybrid>>,
    aliases: HashMap<String, String>,
    by_identifier: HashMap<String, String>,
    by_type_name: HashMap<TypeName, String>,
    order: Vec<String>,
}

impl TypeRegistry {
    fn from_hybrids(hybrids: Vec<Hybrid>, aliases: HashMap<String, String>) -> Self {
        let mut registry = Self {
            hybrids: HashMap::new(),
            aliases,
            by_identifier: HashMap::new(),
            by_type_name: HashMap::new(),
            order: Vec::new(),
        };
        for hybrid in hybrids {
            let logical = hybrid.logical_name.clone();
            registry
                .by_identifier
                .insert(hybrid.identifier.clone(), logical.clone());
            // Relation cells written before a substitution carry the base's
            // identifier; keep them resolvable.
            if hybrid.extends.is_some() {
                registry
                    .by_identifier
                    .insert(identifier_for(&logical), logical.clone());
            }
            registry
                .by_type_name
                .insert(hybrid.type_name.clone(), logical.clone());
            registry.order.push(logical.clone());
            registry.hybrids.insert(logical, Arc::new(hybrid));
        }
        registry
    }

    /// Resolve any declared name to its effective hybrid.
    pub fn resolve(&self, name: &str) -> SchemaResult<Arc<Hybrid>> {
        self.get(name)
            .ok_or_else(|| SchemaError::UnknownType(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Hybrid>> {
        let logical = self.aliases.get(&name.to_ascii_lowercase())?;
        self.hybrids.get(logical).cloned()
    }

    pub fn by_identifier(&self, identifier: &str) -> Option<Arc<Hybrid>> {
        let logical = self.by_identifier.get(identifier)?;
        self.hybrids.get(logical).cloned()
    }

    pub fn by_type_name(&self, type_name: &TypeName) -> Option<Arc<Hybrid>> {
        let logical = self.by_type_name.get(type_name)?;
        self.hybrids.get(logical).cloned()
    }

    /// Hybrids in declaration order.
    pub fn hybrids(&self) -> impl Iterator<Item = Arc<Hybrid>> + '_ {
        self.order
            .iter()
            .filter_map(|name| self.hybrids.get(name).cloned())
    }

    pub fn len(&self) -> usize {
        self.hybrids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hybrids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::PropertyType;
    use serde_json::json;

    fn router() -> TypeDecl {
        TypeDecl::new("StorageRouter")
            .property(Property::new("name", PropertyType::Str).indexed())
            .property(Property::new("ip", PropertyType::Str).unique())
    }

    fn disk() -> TypeDecl {
        TypeDecl::new("Disk")
            .property(Property::new("name", PropertyType::Str))
            .property(Property::new("size", PropertyType::Int).optional())
            .relation(Relation::new("storagerouter", "StorageRouter", "disks"))
    }

    fn partition() -> TypeDecl {
        TypeDecl::new("DiskPartition")
            .property(Property::new("offset", PropertyType::Int))
            .relation(Relation::new("disk", "Disk", "partitions"))
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    #[test]
    fn forward_references_resolve_regardless_of_order() {
        let registry = SchemaBuilder::new()
            .declare(partition())
            .declare(disk())
            .declare(router())
            .build()
            .unwrap();
        let disk = registry.resolve("Disk").unwrap();
        assert_eq!(disk.relation("storagerouter").unwrap().target(), "StorageRouter");
        let router = registry.resolve("storagerouter").unwrap();
        let foreign = router.foreign_relation("disks").unwrap();
        assert_eq!(foreign.child, "Disk");
        assert_eq!(foreign.child_key, "storagerouter");
        assert!(foreign.list);
    }

    #[test]
    fn unknown_relation_target_fails() {
        let err = SchemaBuilder::new().declare(disk()).build().unwrap_err();
        assert!(matches!(
            err,
            SchemaError::UnresolvedRelation { ref target, .. } if target == "StorageRouter"
        ));
    }

    #[test]
    fn resolve_is_idempotent() {
        let registry = SchemaBuilder::new()
            .declare(router())
            .declare(disk())
            .build()
            .unwrap();
        let once = registry.resolve("Disk").unwrap();
        let twice = registry.resolve(once.name()).unwrap();
        assert!(Arc::ptr_eq(&once, &twice));
        assert!(registry.resolve("Nope").is_err());
    }

    #[test]
    fn self_relation_targets_declaring_type() {
        let registry = SchemaBuilder::new()
            .declare(
                TypeDecl::new("Node")
                    .property(Property::new("name", PropertyType::Str))
                    .relation(Relation::to_self("parent", "children").optional()),
            )
            .build()
            .unwrap();
        let node = registry.resolve("Node").unwrap();
        assert_eq!(node.relation("parent").unwrap().target(), "Node");
        assert!(node.foreign_relation("children").is_some());
    }

    #[test]
    fn one_to_one_installs_singular_reverse() {
        let registry = SchemaBuilder::new()
            .declare(router())
            .declare(
                TypeDecl::new("Config")
                    .relation(Relation::new("router", "StorageRouter", "config").one_to_one()),
            )
            .build()
            .unwrap();
        let router = registry.resolve("StorageRouter").unwrap();
        assert!(!router.foreign_relation("config").unwrap().list);
    }

    // -----------------------------------------------------------------------
    // Hybrid extension
    // -----------------------------------------------------------------------

    #[test]
    fn extension_substitutes_base_everywhere() {
        let registry = SchemaBuilder::new()
            .declare(router())
            .declare(disk())
            .declare(
                TypeDecl::extension("ExtendedDisk", "Disk")
                    .property(Property::new("vendor", PropertyType::Str).optional())
                    .property(Property::new("size", PropertyType::Int).indexed()),
            )
            .build()
            .unwrap();
        let via_base = registry.resolve("Disk").unwrap();
        let via_ext = registry.resolve("ExtendedDisk").unwrap();
        assert!(Arc::ptr_eq(&via_base, &via_ext));
        assert_eq!(via_base.name(), "ExtendedDisk");
        assert_eq!(via_base.logical_name(), "Disk");
        assert_eq!(via_base.type_name().as_str(), "disk");
        assert_eq!(via_base.extends(), Some("Disk"));
        assert!(via_base.property("vendor").is_some());
        assert!(via_base.property("size").unwrap().indexed);
        assert_eq!(registry.len(), 2);
        assert!(registry.by_identifier(via_base.identifier()).is_some());
    }

    #[test]
    fn identifiers_differ_between_base_and_extension() {
        let plain = SchemaBuilder::new().declare(router()).build().unwrap();
        let extended = SchemaBuilder::new()
            .declare(router())
            .declare(TypeDecl::extension("MyRouter", "StorageRouter"))
            .build()
            .unwrap();
        let a = plain.resolve("StorageRouter").unwrap();
        let b = extended.resolve("StorageRouter").unwrap();
        assert_eq!(a.type_name(), b.type_name());
        assert_ne!(a.identifier(), b.identifier());
        // Cells written under the base identifier still resolve.
        assert!(extended.by_identifier(a.identifier()).is_some());
    }

    #[test]
    fn nested_extension_is_rejected() {
        let err = SchemaBuilder::new()
            .declare(router())
            .declare(TypeDecl::extension("A", "StorageRouter"))
            .declare(TypeDecl::extension("B", "A"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::NestedExtension { .. }));
    }

    #[test]
    fn two_extensions_of_one_base_conflict() {
        let err = SchemaBuilder::new()
            .declare(router())
            .declare(TypeDecl::extension("A", "StorageRouter"))
            .declare(TypeDecl::extension("B", "StorageRouter"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::ConflictingExtensions { .. }));
    }

    #[test]
    fn extension_cannot_change_attribute_kind() {
        let err = SchemaBuilder::new()
            .declare(router())
            .declare(disk())
            .declare(
                TypeDecl::extension("ExtendedDisk", "Disk")
                    .property(Property::new("storagerouter", PropertyType::Str)),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateAttribute { .. }));
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn duplicate_types_and_attributes_fail() {
        let err = SchemaBuilder::new()
            .declare(router())
            .declare(router())
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateType(_)));

        let err = SchemaBuilder::new()
            .declare(
                TypeDecl::new("X")
                    .property(Property::new("a", PropertyType::Str))
                    .property(Property::new("a", PropertyType::Int)),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateAttribute { .. }));
    }

    #[test]
    fn reserved_names_fail() {
        for name in ["guid", "_version"] {
            let err = SchemaBuilder::new()
                .declare(TypeDecl::new("X").property(Property::new(name, PropertyType::Str)))
                .build()
                .unwrap_err();
            assert!(matches!(err, SchemaError::ReservedAttribute { .. }));
        }
    }

    #[test]
    fn invalid_type_name_fails() {
        let err = SchemaBuilder::new()
            .declare(TypeDecl::new("v_disk"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::Type(_)));
    }

    #[test]
    fn index_and_unique_flags_are_checked() {
        let err = SchemaBuilder::new()
            .declare(TypeDecl::new("X").property(Property::new("tags", PropertyType::List).indexed()))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidFlag { flag: "indexed", .. }));

        let err = SchemaBuilder::new()
            .declare(TypeDecl::new("X").property(Property::new("ok", PropertyType::Bool).unique()))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidFlag { flag: "unique", .. }));
    }

    #[test]
    fn bad_default_fails() {
        let err = SchemaBuilder::new()
            .declare(
                TypeDecl::new("X")
                    .property(Property::new("n", PropertyType::Int).with_default(json!("zero"))),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidFlag { .. }));
    }

    #[test]
    fn reverse_name_clash_fails() {
        let err = SchemaBuilder::new()
            .declare(router().property(Property::new("disks", PropertyType::List)))
            .declare(disk())
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::ForeignNameClash { .. }));
    }

    #[test]
    fn attribute_lookup_by_kind() {
        let registry = SchemaBuilder::new()
            .declare(router())
            .declare(disk().dynamic(Dynamic::new("label", PropertyType::Str, 10)))
            .build()
            .unwrap();
        let disk = registry.resolve("Disk").unwrap();
        assert!(matches!(disk.attribute("name"), Some(Attribute::Property(_))));
        assert!(matches!(disk.attribute("label"), Some(Attribute::Dynamic(_))));
        assert!(disk.property("storagerouter").is_none());
        assert!(disk.is_stored("storagerouter"));
        assert!(!disk.is_stored("label"));
        assert!(disk.attribute("missing").is_none());
    }
}
