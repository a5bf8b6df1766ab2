//! Foundation types for the hybrid data access layer (DAL).
//!
//! Every other `hdal-*` crate depends on this one. It owns the identifiers
//! and the on-store naming rules, nothing else.
//!
//! # Key Types
//!
//! - [`Guid`]: Unique identifier of one persistent object
//! - [`TypeName`]: Validated, lowercased storage name of a hybrid type
//! - [`KeyScheme`]: Builds every key the DAL writes to the stores
//! - [`ValueDigest`]: BLAKE3 digest of a value's canonical string form

pub mod digest;
pub mod error;
pub mod guid;
pub mod keys;

pub use digest::{canonical_string, ValueDigest};
pub use error::TypeError;
pub use guid::Guid;
pub use keys::{KeyScheme, ListCacheMarker, TypeName};
