//! Policy-driven cache primitives.
//!
//! This module provides the pieces the offline accessor is built from:
//! - `PolicyRegistry`: per-category rules (max age, offline validity, roles)
//! - `KeyValueStore`: persistent string storage (SQLite, memory, no-op)
//! - `CacheEntry`: a stored payload and the instant it was written
//!
//! Staleness is never stored. It is recomputed from the entry timestamp on
//! every read.

mod entry;
mod policy;
mod storage;

pub use entry::{read_entry, write_entry, CacheEntry};
pub use policy::{validate_category, CachePolicy, PolicyRegistry, Role};
pub use storage::{KeyValueStore, MemoryStorage, NoopStorage, SqliteStorage};
