//! Schema descriptors and the hybrid type registry.
//!
//! A schema is declared in two phases. First every type is declared by name
//! through [`TypeDecl`] (relation targets are plain names, so declaration
//! order does not matter). Then [`SchemaBuilder::build`] resolves hybrid
//! extensions and relation targets in one pass and produces an immutable
//! [`TypeRegistry`].
//!
//! # Key Types
//!
//! - [`Property`]: simple typed field (mandatory, default, unique, indexed)
//! - [`Relation`]: pointer from a child to one parent object
//! - [`Dynamic`]: computed, cached property
//! - [`ForeignRelation`]: reverse collection derived from another type's relation
//! - [`Hybrid`]: fully resolved type with O(1) attribute lookup
//! - [`TypeRegistry`]: logical name to resolved hybrid, after substitution
//! - [`SchemaFile`]: TOML form of a set of declarations

pub mod attribute;
pub mod decl;
pub mod error;
pub mod file;
pub mod registry;

pub use attribute::{
    kind_of, Attribute, Dynamic, ForeignRelation, Property, PropertyType, Relation,
    RelationKind, TypeCheckFailure,
};
pub use decl::TypeDecl;
pub use error::{SchemaError, SchemaResult};
pub use file::SchemaFile;
pub use registry::{Hybrid, SchemaBuilder, TypeRegistry};
