//! Persistent objects over a volatile cache and a transactional key-value
//! store.
//!
//! A [`Dal`] ties a resolved [`TypeRegistry`](hdal_schema::TypeRegistry) to
//! its two stores. Through it callers create and load [`DataObject`]s, whose
//! [`save`](DataObject::save) and [`delete`](DataObject::delete) run an
//! optimistic, assertion-guarded transaction that keeps forward indexes,
//! reverse relation markers, uniqueness claims and cached query results
//! consistent with the object rows. Queries run through [`DataList`].
//!
//! # Key Types
//!
//! - [`Dal`]: registry, stores, config and bound dynamic functions
//! - [`DataObject`]: one instance of a hybrid type, with its shadow copy
//! - [`ConflictPolicy`]: how save resolves fields changed concurrently
//! - [`Query`]: AND/OR predicate tree with typed leaf comparisons
//! - [`DataList`]: ordered query result with lazy object loading
//!
//! # Design Rules
//!
//! 1. A row's `_version` moves by exactly one per committed save.
//! 2. Every index, marker and claim change commits in the same transaction
//!    as the row it describes.
//! 3. The volatile store only ever holds values that can be rebuilt from
//!    the persistent store.
//! 4. Instances are single-owner; sharing happens through `ObjectRef`.

pub mod config;
pub mod dal;
pub mod delete;
pub mod dynamic;
pub mod error;
mod index;
pub mod list;
pub mod object;
pub mod query;
mod save;

#[cfg(test)]
mod testing;

pub use config::DalConfig;
pub use dal::{Dal, DalBuilder, DynamicFn};
pub use delete::Abandon;
pub use error::{DalError, DalResult};
pub use list::{DataList, IndexUsage, ListBuilder, ListIter};
pub use object::{ConflictPolicy, DataObject, ObjectRef, Provenance, Row};
pub use query::{Filter, Operator, Query};
