use clap::{Parser, Subcommand};
use clubcache::cache::{PolicyRegistry, Role};
use clubcache::config::Config;
use clubcache::network::NetworkMonitor;
use clubcache::remote::RemoteSource;
use clubcache::{logging, CacheContext, CacheDeps, OfflineData};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "clubcache")]
#[command(about = "Policy-driven offline cache for club management data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/clubcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the network as unavailable
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List cache policies
  Policies,

  /// Read a category through the cache, fetching from the backend if needed
  Get {
    category: String,
    #[arg(short, long)]
    role: Role,
    #[arg(short, long)]
    user: Option<String>,
    /// Backend endpoint returning the category's JSON
    #[arg(long)]
    url: String,
  },

  /// Print the storage key for a category and user
  Key {
    category: String,
    #[arg(short, long)]
    user: Option<String>,
  },

  /// Remove the cached entry for a category and user
  Clear {
    category: String,
    #[arg(short, long)]
    user: Option<String>,
  },

  /// Remove every cached entry of a user
  ClearUser { user: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config)?;

  let registry = Arc::new(config.registry());

  match args.command {
    Command::Policies => print_policies(&registry),
    Command::Key { category, user } => {
      println!("{}", PolicyRegistry::build_cache_key(&category, user.as_deref()));
    }
    Command::Clear { category, user } => {
      let storage = config.open_storage()?;
      registry.clear_category(storage.as_ref(), &category, user.as_deref())?;
      info!(category = %category, "Cleared category from CLI");
    }
    Command::ClearUser { user } => {
      let storage = config.open_storage()?;
      registry.clear_all_for_user(storage.as_ref(), &user)?;
      info!("Cleared all categories for user from CLI");
    }
    Command::Get {
      category,
      role,
      user,
      url,
    } => {
      let remote = RemoteSource::new(&url, Config::api_token())?;
      let online = !args.offline && remote.probe().await;
      info!(url = %remote.url(), online, "Resolved network status");
      let network = Arc::new(NetworkMonitor::new(online));

      let deps = CacheDeps::new(registry, config.open_storage()?).with_network(network);
      let mut context = CacheContext::new(category, role);
      if let Some(user) = user {
        context = context.with_user(user);
      }

      let mut query: OfflineData<Value> = OfflineData::new(
        move || {
          let remote = remote.clone();
          async move { remote.fetch_json().await }
        },
        context,
        deps,
      );
      let result = query.settle().await;

      eprintln!(
        "{}{}{}",
        if result.is_offline { "offline" } else { "online" },
        if result.is_stale { ", stale" } else { "" },
        result
          .last_updated_label()
          .map(|at| format!(", updated {}", at))
          .unwrap_or_default()
      );

      if let Some(data) = &result.data {
        println!("{}", serde_json::to_string_pretty(data)?);
      }
      if let Some(error) = &result.error {
        return Err(eyre!("{}", error));
      }
    }
  }

  Ok(())
}

fn print_policies(registry: &PolicyRegistry) {
  let policies: Vec<Value> = registry
    .categories()
    .filter_map(|category| {
      registry.policy(category).map(|policy| {
        json!({
          "category": category,
          "max_age_minutes": policy.max_age.num_minutes(),
          "valid_offline": policy.valid_offline,
          "allowed_roles": policy.allowed_roles.iter().map(Role::as_str).collect::<Vec<_>>(),
        })
      })
    })
    .collect();

  for policy in policies {
    println!("{}", policy);
  }
}
