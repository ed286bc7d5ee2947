//! Binary entry point for stowage.
//!
//! `stowage check` probes the configured stores; `stowage config` prints the
//! effective configuration with credentials redacted.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::Path;
use std::process::ExitCode;
use stowage::config::{StoreKind, StowageConfig};
use stowage::observability;
use stowage::storage::vector::{MilvusConnector, VectorStoreClient};

#[cfg(any(feature = "postgres", feature = "redis"))]
use stowage::storage::ProcessHandle;
#[cfg(feature = "redis")]
use stowage::storage::cache::{CacheClient, RedisConnector};
#[cfg(feature = "postgres")]
use stowage::storage::relational::{PostgresConnector, RelationalClient};

#[cfg(feature = "postgres")]
static RELATIONAL: ProcessHandle<RelationalClient<PostgresConnector>> =
    ProcessHandle::new("relational");

#[cfg(feature = "redis")]
static CACHE: ProcessHandle<CacheClient<RedisConnector>> = ProcessHandle::new("cache");

/// Stowage - resilient pooled access to vector, relational and cache stores.
#[derive(Parser)]
#[command(name = "stowage")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured stores and report their health.
    Check {
        /// Which store to check.
        #[arg(short, long, value_enum, default_value_t = StoreTarget::All)]
        store: StoreTarget,
    },

    /// Print the effective configuration (credentials redacted).
    Config,
}

/// Store selector for `check`.
#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreTarget {
    Vector,
    Relational,
    Cache,
    All,
}

impl StoreTarget {
    fn kinds(self) -> &'static [StoreKind] {
        match self {
            Self::Vector => &[StoreKind::Vector],
            Self::Relational => &[StoreKind::Relational],
            Self::Cache => &[StoreKind::Cache],
            Self::All => &StoreKind::ALL,
        }
    }
}

fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        },
    };

    if let Err(e) = observability::init_from_settings(&config.logging, cli.verbose) {
        eprintln!("Failed to initialize observability: {e}");
        return ExitCode::FAILURE;
    }

    match run_command(cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command.
fn run_command(cli: Cli, config: &StowageConfig) -> Result<()> {
    match cli.command {
        Commands::Check { store } => cmd_check(config, store),
        Commands::Config => {
            cmd_config(config);
            Ok(())
        },
    }
}

/// Loads configuration: explicit path, then `STOWAGE_CONFIG_PATH`, then the
/// default location. Environment overrides apply last.
fn load_config(path: Option<&str>) -> Result<StowageConfig> {
    let explicit = path.map(str::to_string).or_else(|| {
        std::env::var("STOWAGE_CONFIG_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
    });

    let config = match explicit {
        Some(path) => StowageConfig::load_from_file(Path::new(&path))
            .with_context(|| format!("loading {path}"))?,
        None => StowageConfig::load_default(),
    };
    Ok(config.with_env_overrides())
}

fn cmd_check(config: &StowageConfig, target: StoreTarget) -> Result<()> {
    let mut failed = Vec::new();
    for &kind in target.kinds() {
        match check_store(config, kind) {
            Ok(summary) => println!("{:<10} ok      {summary}", kind.as_str()),
            Err(e) => {
                println!("{:<10} FAILED  {e:#}", kind.as_str());
                failed.push(kind.as_str());
            },
        }
    }

    #[cfg(feature = "postgres")]
    if let Some(client) = RELATIONAL.shutdown() {
        client.close();
    }
    #[cfg(feature = "redis")]
    if let Some(client) = CACHE.shutdown() {
        client.disconnect();
    }

    if failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("unhealthy stores: {}", failed.join(", "))
    }
}

fn check_store(config: &StowageConfig, kind: StoreKind) -> Result<String> {
    match kind {
        StoreKind::Vector => check_vector(config),
        StoreKind::Relational => check_relational(config),
        StoreKind::Cache => check_cache(config),
    }
}

fn check_vector(config: &StowageConfig) -> Result<String> {
    let settings = &config.vector;
    let connector = MilvusConnector::new(settings);
    let endpoint = connector.base_url().to_string();
    let client = VectorStoreClient::new(connector, settings, config.vector_dimension);
    if client.status().constructed() == 0 {
        client.close();
        anyhow::bail!("no connection to {endpoint}");
    }
    let collections = client.collection_list();
    let loaded = collections.iter().filter(|c| c.loaded).count();
    client.close();
    Ok(format!(
        "{endpoint}: {} collections, {loaded} loaded",
        collections.len()
    ))
}

#[cfg(feature = "postgres")]
fn check_relational(config: &StowageConfig) -> Result<String> {
    let settings = &config.relational;
    let client = RELATIONAL.get_or_try_init(|| {
        RelationalClient::connect(PostgresConnector::new(settings)?, settings)
    })?;
    let row = client
        .query_one("SELECT version() AS version", &[])?
        .and_then(|r| r.get("version").and_then(|v| v.as_str()).map(str::to_string))
        .unwrap_or_default();
    Ok(format!("{}:{} {row}", settings.host, settings.port))
}

#[cfg(not(feature = "postgres"))]
fn check_relational(_config: &StowageConfig) -> Result<String> {
    anyhow::bail!("requires the `postgres` feature (cargo build --features postgres)")
}

#[cfg(feature = "redis")]
fn check_cache(config: &StowageConfig) -> Result<String> {
    let settings = &config.cache;
    let client = CACHE.get_or_try_init(|| {
        CacheClient::connect(RedisConnector::new(settings)?, settings)
    })?;
    let status = client.status();
    Ok(format!(
        "{}:{} db {}, {} connections",
        settings.host,
        settings.port,
        settings.database,
        status.constructed()
    ))
}

#[cfg(not(feature = "redis"))]
fn check_cache(_config: &StowageConfig) -> Result<String> {
    anyhow::bail!("requires the `redis` feature (cargo build --features redis)")
}

fn cmd_config(config: &StowageConfig) {
    for kind in StoreKind::ALL {
        println!("[{kind}]");
        println!("{}", config.store(kind));
        if kind == StoreKind::Vector {
            println!("dimension = {}", config.vector_dimension);
        }
        println!();
    }
    let logging = &config.logging;
    println!("[logging]");
    println!("format = {:?}", logging.format.as_deref().unwrap_or("pretty"));
    if let Some(file) = &logging.file {
        println!("file = {file:?}");
    }
    if let Some(level) = &logging.level {
        println!("level = {level:?}");
    }
}
