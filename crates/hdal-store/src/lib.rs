//! Store interfaces for the hybrid DAL.
//!
//! The DAL talks to exactly two collaborators:
//!
//! - a [`VolatileStore`]: fast, lossy, TTL-bounded (memcached-like). It also
//!   backs the distributed [`VolatileMutex`].
//! - a [`PersistentStore`]: durable key-value store with prefix scans and
//!   multi-key [`Transaction`]s guarded by per-key value assertions.
//!
//! # Backends
//!
//! - [`InMemoryVolatileStore`]: `HashMap` with lazy TTL expiry
//! - [`InMemoryPersistentStore`]: `BTreeMap` with atomic transactions
//! - [`JsonFileStore`]: persistent store snapshotted to a JSON file
//!
//! # Design Rules
//!
//! 1. A transaction either applies every operation or none of them.
//! 2. Operations inside a transaction run in order; an assertion sees the
//!    effect of earlier operations in the same transaction.
//! 3. A failed assertion names the key it guarded; so does a missing key.
//! 4. The volatile store is never authoritative. Losing it loses nothing.

pub mod error;
pub mod file;
pub mod memory;
pub mod mutex;
pub mod traits;
pub mod transaction;

pub use error::{StoreError, StoreResult};
pub use file::JsonFileStore;
pub use memory::{InMemoryPersistentStore, InMemoryVolatileStore};
pub use mutex::{MutexGuard, VolatileMutex};
pub use traits::{PersistentStore, VolatileStore};
pub use transaction::{Operation, Transaction};
