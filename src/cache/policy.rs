//! Cache policies per data category and the registry that answers questions
//! about them.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use super::storage::KeyValueStore;

/// Prefix shared by every storage key written by the cache.
const KEY_PREFIX: &str = "crf_";

/// Suffix of the companion key holding an entry's store time.
pub(crate) const TIMESTAMP_SUFFIX: &str = "_timestamp";

/// Separates the category from the hashed user scope in a composite key.
/// Category names may not contain it.
const USER_SEPARATOR: char = '@';

/// Number of hex characters of the user hash kept in a key.
const USER_HASH_LEN: usize = 16;

/// User roles known to the club application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
  Admin,
  Funcionario,
  Associado,
  Anonimo,
}

impl Role {
  pub const ALL: [Role; 4] = [Role::Admin, Role::Funcionario, Role::Associado, Role::Anonimo];

  pub fn as_str(&self) -> &'static str {
    match self {
      Role::Admin => "ADMIN",
      Role::Funcionario => "FUNCIONARIO",
      Role::Associado => "ASSOCIADO",
      Role::Anonimo => "ANONIMO",
    }
  }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Role {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    Role::ALL
      .into_iter()
      .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
      .ok_or_else(|| {
        format!(
          "unknown role '{}' (expected one of ADMIN, FUNCIONARIO, ASSOCIADO, ANONIMO)",
          s
        )
      })
  }
}

/// Caching rules for one data category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
  /// Age after which cached data is stale
  pub max_age: Duration,
  /// Whether stale data may still be served while offline
  pub valid_offline: bool,
  /// Roles allowed to use this category's cache
  pub allowed_roles: BTreeSet<Role>,
}

impl CachePolicy {
  pub fn new(max_age: Duration, valid_offline: bool, roles: &[Role]) -> Self {
    Self {
      max_age,
      valid_offline,
      allowed_roles: roles.iter().copied().collect(),
    }
  }

  pub fn allows(&self, role: Role) -> bool {
    self.allowed_roles.contains(&role)
  }
}

/// Immutable table of cache policies keyed by category.
///
/// Built once at startup and shared by reference. Unknown categories are
/// treated as "caching disallowed" by every query.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
  policies: BTreeMap<String, CachePolicy>,
}

impl PolicyRegistry {
  /// An empty registry: every category is network-only.
  pub fn empty() -> Self {
    Self::default()
  }

  /// The club application's built-in policy table.
  pub fn builtin() -> Self {
    use Role::*;

    Self::empty()
      .with_policy(
        "user_profile",
        CachePolicy::new(Duration::hours(1), true, &[Admin, Funcionario, Associado]),
      )
      .with_policy(
        "user_balance",
        CachePolicy::new(Duration::minutes(30), true, &[Associado, Admin]),
      )
      .with_policy(
        "user_reservations",
        CachePolicy::new(Duration::hours(1), true, &[Associado, Admin, Funcionario]),
      )
      // Availability is never served offline
      .with_policy(
        "reservation_availability",
        CachePolicy::new(Duration::minutes(15), false, &[Associado, Admin, Funcionario]),
      )
      .with_policy(
        "bar_financial",
        CachePolicy::new(Duration::minutes(15), false, &[Funcionario, Admin]),
      )
      .with_policy("reports", CachePolicy::new(Duration::hours(2), true, &[Admin]))
      .with_policy(
        "app_settings",
        CachePolicy::new(Duration::hours(24), true, &Role::ALL),
      )
  }

  /// Add or replace the policy for a category.
  pub fn with_policy(mut self, category: impl Into<String>, policy: CachePolicy) -> Self {
    self.policies.insert(category.into(), policy);
    self
  }

  /// Known categories in sorted order.
  pub fn categories(&self) -> impl Iterator<Item = &str> {
    self.policies.keys().map(String::as_str)
  }

  fn lookup(&self, category: &str) -> Option<&CachePolicy> {
    let policy = self.policies.get(category);
    if policy.is_none() {
      warn!(category, "No cache policy registered for category");
    }
    policy
  }

  pub fn is_cache_allowed(&self, category: &str, role: Role) -> bool {
    self
      .lookup(category)
      .map(|policy| policy.allows(role))
      .unwrap_or(false)
  }

  /// Zero for unknown categories, so their data is always stale.
  pub fn max_age(&self, category: &str) -> Duration {
    self
      .lookup(category)
      .map(|policy| policy.max_age)
      .unwrap_or_else(Duration::zero)
  }

  pub fn is_valid_offline(&self, category: &str) -> bool {
    self
      .lookup(category)
      .map(|policy| policy.valid_offline)
      .unwrap_or(false)
  }

  /// Returns a copy; the registry itself is never handed out mutably.
  pub fn policy(&self, category: &str) -> Option<CachePolicy> {
    self.lookup(category).cloned()
  }

  /// Like [`policy`](Self::policy) without the warning, for callers that
  /// expect unknown categories.
  pub(crate) fn find(&self, category: &str) -> Option<&CachePolicy> {
    self.policies.get(category)
  }

  /// Storage key for a category scoped to an optional user.
  ///
  /// User ids are hashed so they never appear verbatim in storage, and an
  /// absent user id maps to a different key than any present one (including
  /// the empty string).
  pub fn build_cache_key(category: &str, user_id: Option<&str>) -> String {
    match user_id {
      None => format!("{}{}", KEY_PREFIX, category),
      Some(user) => {
        let mut hasher = Sha256::new();
        hasher.update(user.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!(
          "{}{}{}{}",
          KEY_PREFIX,
          category,
          USER_SEPARATOR,
          &digest[..USER_HASH_LEN]
        )
      }
    }
  }

  /// Remove the entry and its timestamp for one category/user pair.
  pub fn clear_category(
    &self,
    storage: &dyn KeyValueStore,
    category: &str,
    user_id: Option<&str>,
  ) -> Result<()> {
    let key = Self::build_cache_key(category, user_id);
    storage.remove(&key)?;
    storage.remove(&format!("{}{}", key, TIMESTAMP_SUFFIX))?;
    debug!(category, key = %key, "Cleared cache entry");
    Ok(())
  }

  /// Remove every known category's entry for a user (logout, account switch).
  pub fn clear_all_for_user(&self, storage: &dyn KeyValueStore, user_id: &str) -> Result<()> {
    for category in self.categories() {
      self.clear_category(storage, category, Some(user_id))?;
    }
    Ok(())
  }
}

/// Check that a category name can be used inside a composite key.
pub fn validate_category(category: &str) -> Result<()> {
  if category.trim().is_empty() {
    return Err(eyre!("Cache category name must not be empty"));
  }
  if category.contains(USER_SEPARATOR) {
    return Err(eyre!(
      "Cache category '{}' must not contain '{}'",
      category,
      USER_SEPARATOR
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::entry::write_entry;
  use crate::cache::storage::MemoryStorage;

  #[test]
  fn test_unknown_category_is_fail_closed() {
    let registry = PolicyRegistry::builtin();
    for role in Role::ALL {
      assert!(!registry.is_cache_allowed("no_such_category", role));
    }
    assert_eq!(registry.max_age("no_such_category"), Duration::zero());
    assert!(!registry.is_valid_offline("no_such_category"));
    assert!(registry.policy("no_such_category").is_none());
  }

  #[test]
  fn test_builtin_roles() {
    let registry = PolicyRegistry::builtin();
    assert!(registry.is_cache_allowed("user_reservations", Role::Associado));
    assert!(!registry.is_cache_allowed("bar_financial", Role::Anonimo));
    assert!(!registry.is_cache_allowed("bar_financial", Role::Associado));
    assert!(registry.is_cache_allowed("bar_financial", Role::Funcionario));
    assert!(registry.is_cache_allowed("app_settings", Role::Anonimo));
    assert!(!registry.is_cache_allowed("reports", Role::Funcionario));
  }

  #[test]
  fn test_builtin_timing() {
    let registry = PolicyRegistry::builtin();
    assert_eq!(registry.max_age("user_balance"), Duration::minutes(30));
    assert_eq!(registry.max_age("app_settings"), Duration::hours(24));
    assert!(registry.is_valid_offline("user_reservations"));
    assert!(!registry.is_valid_offline("reservation_availability"));
  }

  #[test]
  fn test_policy_is_a_copy() {
    let registry = PolicyRegistry::builtin();
    let mut policy = registry.policy("reports").unwrap();
    policy.allowed_roles.insert(Role::Anonimo);
    policy.max_age = Duration::zero();

    assert!(!registry.is_cache_allowed("reports", Role::Anonimo));
    assert_eq!(registry.max_age("reports"), Duration::hours(2));
  }

  #[test]
  fn test_cache_key_is_deterministic_and_user_scoped() {
    let a = PolicyRegistry::build_cache_key("user_profile", Some("123"));
    let b = PolicyRegistry::build_cache_key("user_profile", Some("123"));
    assert_eq!(a, b);
    assert!(a.starts_with("crf_user_profile@"));
    assert!(!a.contains("123"));

    let other = PolicyRegistry::build_cache_key("user_profile", Some("456"));
    let empty = PolicyRegistry::build_cache_key("user_profile", Some(""));
    let anonymous = PolicyRegistry::build_cache_key("user_profile", None);
    assert_ne!(a, other);
    assert_ne!(empty, anonymous);
    assert_ne!(a, anonymous);
    assert_eq!(anonymous, "crf_user_profile");
  }

  #[test]
  fn test_clear_category_is_idempotent() {
    let registry = PolicyRegistry::builtin();
    let storage = MemoryStorage::new();
    let key = PolicyRegistry::build_cache_key("user_profile", Some("7"));
    storage.set(&key, "{}").unwrap();
    storage.set(&format!("{}_timestamp", key), "0").unwrap();

    registry.clear_category(&storage, "user_profile", Some("7")).unwrap();
    assert_eq!(storage.get(&key).unwrap(), None);
    registry.clear_category(&storage, "user_profile", Some("7")).unwrap();
    assert_eq!(storage.get(&key).unwrap(), None);
    assert!(storage.is_empty());
  }

  #[test]
  fn test_clear_all_for_user_leaves_other_users() {
    let registry = PolicyRegistry::builtin();
    let storage = MemoryStorage::new();
    let written_at = chrono::Utc::now();
    for category in ["user_profile", "user_balance", "reports"] {
      let key = PolicyRegistry::build_cache_key(category, Some("alice"));
      write_entry(&storage, &key, &1, written_at).unwrap();
    }
    let bob = PolicyRegistry::build_cache_key("user_profile", Some("bob"));
    write_entry(&storage, &bob, &2, written_at).unwrap();
    assert_eq!(storage.len(), 8);

    registry.clear_all_for_user(&storage, "alice").unwrap();

    assert_eq!(storage.len(), 2);
    assert_eq!(storage.get(&bob).unwrap().as_deref(), Some("2"));
    assert!(storage.get(&format!("{}_timestamp", bob)).unwrap().is_some());
  }

  #[test]
  fn test_role_parsing() {
    assert_eq!("associado".parse::<Role>().unwrap(), Role::Associado);
    assert_eq!(" ADMIN ".parse::<Role>().unwrap(), Role::Admin);
    assert!("guest".parse::<Role>().is_err());
  }

  #[test]
  fn test_validate_category() {
    assert!(validate_category("events_calendar").is_ok());
    assert!(validate_category("").is_err());
    assert!(validate_category("a@b").is_err());
  }
}
