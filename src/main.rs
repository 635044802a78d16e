use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use catalog_sync::config::Config;
use catalog_sync::logging;
use catalog_sync::model::{Category, Tool};
use catalog_sync::remote::{
  self, CacheOptions, FilterValue, HealthStatus, QueryOptions, RemoteBackend, RemoteQueryLayer,
  RestBackend, SortOrder,
};
use catalog_sync::store::{LocalStore, SqliteBackend};
use catalog_sync::sync::SyncOrchestrator;
use catalog_sync::transfer;

#[derive(Parser, Debug)]
#[command(name = "catalog-sync")]
#[command(about = "Offline-first sync for a tools and categories catalog")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/catalog-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Directory for log files (default: $XDG_DATA_HOME/catalog-sync/logs)
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity, queue and storage state
  Status,
  /// Replay the offline queue now
  Sync,
  /// Check that the remote answers
  Health,
  /// Row counts and last update of a remote table
  Stats { table: String },
  /// Query a remote table
  Query {
    table: String,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = remote::DEFAULT_LIMIT)]
    limit: u32,
    /// Column to sort by
    #[arg(long)]
    sort: Option<String>,
    /// Sort ascending instead of descending
    #[arg(long)]
    asc: bool,
    /// Equality filter `column=value`; comma-separated values match any of them
    #[arg(long = "filter")]
    filters: Vec<String>,
    #[arg(long)]
    search: Option<String>,
    /// Columns searched by --search
    #[arg(long = "field", default_values_t = [String::from("name"), String::from("description")])]
    fields: Vec<String>,
    /// Bypass the query cache
    #[arg(long)]
    no_cache: bool,
  },
  /// Pull remote tools and categories into the local store
  Refresh,
  /// Write local state to a JSON file
  Export { path: PathBuf },
  /// Load local state from a JSON file written by `export`
  Import { path: PathBuf },
  /// Print realtime changes on a table until interrupted
  Watch {
    table: String,
    /// Channel filter `column=eq.value`
    #[arg(long)]
    filter: Option<String>,
  },
  /// Add a tool locally and queue it for sync
  AddTool {
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
  },
  /// Add a category locally and queue it for sync
  AddCategory {
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    icon: Option<String>,
  },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn open_store(config: &Config) -> Result<LocalStore> {
  let backend = match &config.storage.path {
    Some(path) => SqliteBackend::open(path)?,
    None => SqliteBackend::open_default()?,
  };
  Ok(LocalStore::with_capacity(backend, config.storage.capacity_bytes))
}

fn parse_filter(expr: &str) -> Result<(String, FilterValue)> {
  let (column, value) = expr
    .split_once('=')
    .ok_or_else(|| eyre!("Invalid filter `{}`, expected column=value", expr))?;
  let value = if value.contains(',') {
    FilterValue::AnyOf(value.split(',').map(|v| v.trim().into()).collect())
  } else {
    FilterValue::from(value)
  };
  Ok((column.to_string(), value))
}

fn export(store: &LocalStore, path: &Path) -> Result<()> {
  let bundle = transfer::export_to(store, path)?;
  println!(
    "Exported {} tools and {} categories to {}",
    bundle.tools.len(),
    bundle.categories.len(),
    path.display()
  );
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let _log_guard = match args.log_dir.or_else(logging::default_log_dir) {
    Some(dir) => Some(logging::init(&dir)?),
    None => None,
  };

  let store = open_store(&config)?;

  // Export works without credentials or a reachable remote
  if let Command::Export { path } = &args.command {
    return export(&store, path);
  }

  let api_key = Config::get_api_key()?;
  let backend: Arc<dyn RemoteBackend> = Arc::new(RestBackend::new(&config.remote, &api_key)?);
  let layer = RemoteQueryLayer::with_health_table(backend, &config.remote.health_table);

  let health = layer.health_check().await;
  let online = health.status == HealthStatus::Healthy;
  info!(online, latency_ms = health.latency_ms, "remote health checked");

  let orchestrator = SyncOrchestrator::new(store, layer.clone(), online);

  match args.command {
    Command::Status => print_json(&orchestrator.state())?,
    Command::Sync => {
      let outcome = orchestrator.force_sync_data().await?;
      println!("{:?}", outcome);
    }
    Command::Health => print_json(&health)?,
    Command::Stats { table } => print_json(&layer.get_table_stats(&table).await?)?,
    Command::Query {
      table,
      page,
      limit,
      sort,
      asc,
      filters,
      search,
      fields,
      no_cache,
    } => {
      let mut options = QueryOptions::new().page(page).limit(limit);
      if let Some(column) = sort {
        let order = if asc { SortOrder::Asc } else { SortOrder::Desc };
        options = options.sort(column, order);
      }
      for expr in &filters {
        let (column, value) = parse_filter(expr)?;
        options = options.filter(column, value);
      }
      if let Some(term) = search {
        options = options.search(term, fields);
      }
      let cache = if no_cache {
        CacheOptions::none()
      } else {
        remote::ttl_secs(config.cache.ttl_secs)
      };
      print_json(&layer.query(&table, &options, cache).await?)?;
    }
    Command::Refresh => {
      if let Some(result) = orchestrator.start().await {
        result?;
      }
      let tools = orchestrator.refresh::<Tool>().await?;
      let categories = orchestrator.refresh::<Category>().await?;
      println!("{} tools, {} categories cached locally", tools, categories);
    }
    Command::Export { path } => export(orchestrator.store(), &path)?,
    Command::Import { path } => {
      let summary = orchestrator.import_from(&path)?;
      println!(
        "Imported {} tools, {} categories; {} pending changes queued",
        summary.tools.unwrap_or(0),
        summary.categories.unwrap_or(0),
        summary.requeued
      );
    }
    Command::Watch { table, filter } => {
      let handle = layer
        .subscribe_to_table(
          &table,
          |event| match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "failed to print change event"),
          },
          filter.as_deref(),
        )
        .await?;
      info!(channel = handle.channel_id(), table = %table, "watching");
      eprintln!("Watching {} (Ctrl-C to stop)", table);

      tokio::signal::ctrl_c().await?;
      handle.unsubscribe();
    }
    Command::AddTool {
      name,
      description,
      url,
      category,
      tags,
    } => {
      let mut tool = Tool::new(name);
      tool.description = description;
      tool.url = url;
      tool.category_id = category;
      tool.tags = tags;
      let tool = orchestrator.add_tool(tool).await?;
      println!("Added tool {} ({})", tool.name, tool.meta.local_id);
      print_json(&orchestrator.state())?;
    }
    Command::AddCategory {
      name,
      description,
      icon,
    } => {
      let mut category = Category::new(name);
      category.description = description;
      category.icon = icon;
      let category = orchestrator.add_category(category).await?;
      println!("Added category {} ({})", category.name, category.meta.local_id);
      print_json(&orchestrator.state())?;
    }
  }

  layer.dispose();
  Ok(())
}
