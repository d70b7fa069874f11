use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{
  validate_category, CachePolicy, KeyValueStore, MemoryStorage, NoopStorage, PolicyRegistry,
  Role, SqliteStorage,
};

/// Application name used for config/data directory paths
const APP_NAME: &str = "clubcache";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub storage: StorageConfig,
  pub logging: LoggingConfig,
  /// Extra categories, or overrides of built-in ones
  pub policies: BTreeMap<String, PolicyConfig>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// SQLite database on disk
  #[default]
  Sqlite,
  /// Kept in memory for the life of the process
  Memory,
  /// Caching disabled: nothing is stored, every read misses
  None,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  pub backend: StorageBackend,
  /// SQLite database path (default: $XDG_DATA_HOME/clubcache/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter used when RUST_LOG is not set (default: info)
  pub level: Option<String>,
  /// Directory for rolling log files (default: $XDG_DATA_HOME/clubcache/logs)
  pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
  pub max_age_minutes: u32,
  #[serde(default)]
  pub valid_offline: bool,
  pub allowed_roles: Vec<Role>,
}

impl PolicyConfig {
  fn to_policy(&self) -> CachePolicy {
    CachePolicy::new(
      Duration::minutes(i64::from(self.max_age_minutes)),
      self.valid_offline,
      &self.allowed_roles,
    )
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./clubcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/clubcache/config.yaml
  ///
  /// Without any file the built-in defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("clubcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_NAME).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }

    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;

    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    for (category, policy) in &self.policies {
      validate_category(category)?;
      if policy.allowed_roles.is_empty() {
        return Err(eyre!(
          "Policy for '{}' must allow at least one role",
          category
        ));
      }
    }
    Ok(())
  }

  /// Built-in policies with the configured ones layered on top.
  pub fn registry(&self) -> PolicyRegistry {
    self
      .policies
      .iter()
      .fold(PolicyRegistry::builtin(), |registry, (category, policy)| {
        registry.with_policy(category.clone(), policy.to_policy())
      })
  }

  pub fn open_storage(&self) -> Result<Arc<dyn KeyValueStore>> {
    let storage: Arc<dyn KeyValueStore> = match self.storage.backend {
      StorageBackend::Sqlite => match &self.storage.path {
        Some(path) => Arc::new(SqliteStorage::open_at(path)?),
        None => Arc::new(SqliteStorage::open()?),
      },
      StorageBackend::Memory => Arc::new(MemoryStorage::new()),
      StorageBackend::None => Arc::new(NoopStorage),
    };
    Ok(storage)
  }

  pub fn log_directory(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.logging.directory {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join(APP_NAME).join("logs"))
  }

  /// Bearer token for the backend, from CLUBCACHE_API_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("CLUBCACHE_API_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert!(config.policies.is_empty());

    let registry = config.registry();
    assert!(registry.is_cache_allowed("user_profile", Role::Associado));
  }

  #[test]
  fn test_configured_policies_extend_and_override() {
    let config = Config::parse(
      r#"
storage:
  backend: memory
logging:
  level: debug
policies:
  events_calendar:
    max_age_minutes: 45
    valid_offline: true
    allowed_roles: [ADMIN, ASSOCIADO]
  reports:
    max_age_minutes: 10
    allowed_roles: [ADMIN, FUNCIONARIO]
"#,
    )
    .unwrap();

    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.logging.level.as_deref(), Some("debug"));

    let registry = config.registry();
    assert!(registry.is_cache_allowed("events_calendar", Role::Associado));
    assert!(!registry.is_cache_allowed("events_calendar", Role::Anonimo));
    assert_eq!(registry.max_age("events_calendar"), Duration::minutes(45));

    assert!(registry.is_cache_allowed("reports", Role::Funcionario));
    assert!(!registry.is_valid_offline("reports"));
    assert_eq!(registry.max_age("reports"), Duration::minutes(10));
  }

  #[test]
  fn test_invalid_policies_are_rejected() {
    let bad_name = "policies:\n  \"a@b\":\n    max_age_minutes: 1\n    allowed_roles: [ADMIN]\n";
    assert!(Config::parse(bad_name).is_err());

    let no_roles = "policies:\n  things:\n    max_age_minutes: 1\n    allowed_roles: []\n";
    assert!(Config::parse(no_roles).is_err());

    let bad_role = "policies:\n  things:\n    max_age_minutes: 1\n    allowed_roles: [GUEST]\n";
    assert!(Config::parse(bad_role).is_err());
  }

  #[test]
  fn test_storage_backends_open() {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    let storage = config.open_storage().unwrap();
    storage.set("crf_x", "1").unwrap();
    assert_eq!(storage.get("crf_x").unwrap().as_deref(), Some("1"));

    config.storage.backend = StorageBackend::None;
    let storage = config.open_storage().unwrap();
    storage.set("crf_x", "1").unwrap();
    assert_eq!(storage.get("crf_x").unwrap(), None);
  }

  #[test]
  fn test_missing_explicit_config_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/clubcache.yaml"))).is_err());
  }
}
