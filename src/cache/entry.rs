//! Persisted cache entries: a JSON payload plus the instant it was stored.

use chrono::{DateTime, Duration, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::policy::TIMESTAMP_SUFFIX;
use super::storage::KeyValueStore;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub payload: T,
  pub timestamp: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  pub fn new(payload: T, timestamp: DateTime<Utc>) -> Self {
    Self { payload, timestamp }
  }

  /// Stale once the entry's age reaches `max_age` (boundary included).
  pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
    now - self.timestamp >= max_age
  }
}

fn timestamp_key(key: &str) -> String {
  format!("{}{}", key, TIMESTAMP_SUFFIX)
}

/// Read the entry stored under `key`.
///
/// A payload without a readable timestamp counts as no entry; a payload that
/// no longer deserializes into `T` is an error.
pub fn read_entry<T: DeserializeOwned>(
  storage: &dyn KeyValueStore,
  key: &str,
) -> Result<Option<CacheEntry<T>>> {
  let Some(raw) = storage.get(key)? else {
    return Ok(None);
  };

  let millis = match storage.get(&timestamp_key(key))? {
    Some(ts) => ts.trim().parse::<i64>().ok(),
    None => None,
  };
  let Some(timestamp) = millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) else {
    debug!(key, "Cache entry has no usable timestamp, ignoring it");
    return Ok(None);
  };

  let payload = serde_json::from_str(&raw)
    .map_err(|e| eyre!("Failed to parse cache entry {}: {}", key, e))?;

  Ok(Some(CacheEntry { payload, timestamp }))
}

/// Store `payload` under `key`, stamped with `timestamp`.
pub fn write_entry<T: Serialize>(
  storage: &dyn KeyValueStore,
  key: &str,
  payload: &T,
  timestamp: DateTime<Utc>,
) -> Result<()> {
  let raw = serde_json::to_string(payload)
    .map_err(|e| eyre!("Failed to serialize cache entry {}: {}", key, e))?;

  storage.set(key, &raw)?;
  storage.set(&timestamp_key(key), &timestamp.timestamp_millis().to_string())?;
  Ok(())
}
