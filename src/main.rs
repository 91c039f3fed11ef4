use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use spsync::batch::{BatchFetcher, BatchRequest, BeneficiaryAccumulator};
use spsync::cache::{CacheLayer, CachePort, MemoryStorage, NoopStorage, ReadThrough, SqliteStorage};
use spsync::config::{CacheConfig, Config};
use spsync::graphql::{query_cache_key, BeneficiaryVariant, GraphqlClient};
use spsync::query::{CachedQuery, FetchError};

#[derive(Parser, Debug)]
#[command(name = "spsync")]
#[command(about = "Batched beneficiary sync and cached queries for social protection APIs")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/spsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch every beneficiary linked to a project
  Beneficiaries {
    /// Project id
    #[arg(short, long)]
    project: String,

    /// Fetch group beneficiaries instead of individuals
    #[arg(long)]
    group: bool,

    /// Override the configured page size
    #[arg(long)]
    page_size: Option<u32>,

    /// Print the collected records as JSON
    #[arg(long)]
    json: bool,
  },

  /// Run a GraphQL query through the cache
  Query {
    /// Cache key (default: hash of the query text)
    #[arg(short, long)]
    key: Option<String>,

    /// Ignore a fresh cache entry and fetch again
    #[arg(long)]
    refresh: bool,

    /// File containing the query
    file: PathBuf,
  },

  /// Manage the persisted cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Delete entries older than the expiry window
  Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = spsync::logging::init(args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Beneficiaries {
      project,
      group,
      page_size,
      json,
    } => {
      let variant = if group {
        BeneficiaryVariant::Group
      } else {
        BeneficiaryVariant::Individual
      };
      fetch_beneficiaries(&config, project, variant, page_size, json).await
    }
    Command::Query { key, refresh, file } => {
      let query = std::fs::read_to_string(&file)
        .map_err(|e| eyre!("Failed to read query file {}: {}", file.display(), e))?;
      let key = key.unwrap_or_else(|| query_cache_key(&query));
      let client = GraphqlClient::new(&config)?;

      if config.cache.enabled {
        let tiers = ReadThrough::new(MemoryStorage::new(), open_persisted(&config.cache)?);
        let cache = CacheLayer::new(tiers).with_freshness(config.cache.freshness());
        run_query(cache, key, client, query, refresh).await
      } else {
        run_query(CacheLayer::new(NoopStorage), key, client, query, refresh).await
      }
    }
    Command::Cache {
      action: CacheAction::Purge,
    } => {
      let storage = open_persisted(&config.cache)?;
      let cutoff = Utc::now() - config.cache.freshness().expire_after;
      let removed = storage.purge_older_than(cutoff)?;
      println!("Removed {} expired cache entries", removed);
      Ok(())
    }
  }
}

fn open_persisted(config: &CacheConfig) -> Result<SqliteStorage> {
  let storage = match &config.path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };
  Ok(storage.with_prefix(config.key_prefix.clone()))
}

async fn fetch_beneficiaries(
  config: &Config,
  project: String,
  variant: BeneficiaryVariant,
  page_size: Option<u32>,
  json: bool,
) -> Result<()> {
  let client = GraphqlClient::new(config)?;
  let batch =
    BatchFetcher::new(client).with_page_size(page_size.unwrap_or(config.batch.page_size));
  let mut handle = batch.start(BatchRequest::new(project, variant));
  let mut accumulator = BeneficiaryAccumulator::new();

  loop {
    let next = tokio::select! {
      page = handle.next_page() => Some(page),
      _ = tokio::signal::ctrl_c() => None,
    };

    match next {
      Some(Some(page)) => {
        eprintln!(
          "offset {:>6}: {} records{}",
          page.offset,
          page.beneficiaries.len(),
          if page.page_info.has_next_page { ", more to come" } else { "" }
        );
        accumulator.apply(page);
      }
      Some(None) => break,
      None => {
        info!("Interrupted, cancelling batch");
        handle.cancel();
      }
    }
  }

  let summary = handle.finish().await?;
  if json {
    println!("{}", serde_json::to_string_pretty(accumulator.records())?);
  } else {
    for beneficiary in accumulator.records() {
      println!("{}\t{}", beneficiary.id(), beneficiary.label());
    }
  }
  eprintln!(
    "{} records in {} pages (server total: {})",
    summary.records,
    summary.pages,
    summary
      .total_count
      .map(|n| n.to_string())
      .unwrap_or_else(|| "unknown".to_string())
  );
  Ok(())
}

async fn run_query<S: CachePort + 'static>(
  cache: CacheLayer<S>,
  key: String,
  client: GraphqlClient,
  query: String,
  refresh: bool,
) -> Result<()> {
  let mut cached = CachedQuery::new(key, cache, move |token: CancellationToken| {
    let client = client.clone();
    let query = query.clone();
    async move {
      tokio::select! {
        _ = token.cancelled() => Err(FetchError::Cancelled),
        result = client.execute(&query) => result.map_err(FetchError::from),
      }
    }
  });

  cached.mount();
  if refresh {
    cached.refresh();
  }

  if cached.data().is_none() || cached.is_loading() {
    cached.settle().await;
  }

  match (cached.data(), cached.error()) {
    (Some(data), error) => {
      if let Some(error) = error {
        warn!(error, "Showing previous data after a failed fetch");
      }
      if cached.is_stale() {
        eprintln!("(cached data is stale, revalidating)");
      }
      print_json(data)?;
    }
    (None, Some(error)) => return Err(eyre!("Query failed: {}", error)),
    (None, None) => return Err(eyre!("Query returned no data")),
  }

  // Let a background revalidation finish so the cache is updated
  if cached.is_fetching() {
    cached.settle().await;
    if let Some(error) = cached.error() {
      warn!(error, "Background revalidation failed");
    }
  }

  Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

