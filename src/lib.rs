//! Policy-driven offline data cache for club management clients.
//!
//! Data categories (profile, balance, reservations, ...) each carry a policy
//! deciding which roles may cache them, for how long, and whether stale data
//! may be shown without a network. [`OfflineData`] applies those policies to a
//! fetch function and keeps an [`AccessResult`] up to date for rendering.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod offline;
pub mod remote;

pub use cache::{CachePolicy, KeyValueStore, PolicyRegistry, Role};
pub use error::AccessError;
pub use offline::{AccessResult, CacheContext, CacheDeps, DataSource, OfflineData};
