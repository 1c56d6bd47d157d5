//! WolfCache - Replicated Key-Value Storage
//!
//! Operator tool for a WolfCache node: configuration management and
//! inspection of persisted snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfcache::config::WolfCacheConfig;
use wolfcache::persistence::PersistenceManager;
use wolfcache::role::FixedRole;
use wolfcache::store::now_ms;
use wolfcache::StorageOptions;

/// WolfCache - Replicated Key-Value Storage
#[derive(Parser)]
#[command(name = "wolfcache")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfcache.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfcache.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// Snapshot directory
        #[arg(long, default_value = "/var/lib/wolfcache")]
        data_dir: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Print the live entries of a persisted store as JSON
    Inspect {
        /// Store name
        name: String,
    },

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Config may be missing for `init`; fall back to defaults for logging
    let logging = WolfCacheConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(logging.level);
    init_logging(&level, &logging.format);

    match cli.command {
        Commands::Init {
            output,
            node_id,
            data_dir,
        } => run_init(output, node_id, data_dir),
        Commands::Validate => run_validate(cli.config),
        Commands::Inspect { name } => run_inspect(cli.config, name).await,
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<WolfCacheConfig> {
    let config = WolfCacheConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Write a default configuration file
fn run_init(output: PathBuf, node_id: String, data_dir: PathBuf) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }

    let config = WolfCacheConfig::new(node_id, data_dir);
    config.validate()?;
    let content = format!(
        "# WolfCache Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );
    std::fs::write(&output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match load_config(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  GC Interval: {} ms", config.storage.gc_interval_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {:#}", e);
            Err(e)
        }
    }
}

/// Print the live content of one persisted store
async fn run_inspect(config_path: PathBuf, name: String) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let options = StorageOptions::from_config(&config);
    options.validate(&name)?;

    let path = options.filename(&name);
    let manager = PersistenceManager::new(path.clone(), Arc::new(FixedRole(false)));
    let mut snapshot = manager
        .load()
        .await
        .with_context(|| format!("failed to read snapshot of '{}'", name))?;

    let purged = snapshot.purge_expired(now_ms());
    tracing::debug!("Skipped {} expired items in {}", purged, path.display());

    let live: serde_json::Map<String, serde_json::Value> = snapshot
        .entries
        .into_iter()
        .map(|(key, entry)| (key, entry.value))
        .collect();
    println!("{}", serde_json::to_string_pretty(&live)?);
    Ok(())
}

/// Show node information
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;

    println!("WolfCache Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Storage Defaults:");
    println!("  GC Interval:    {} ms", config.storage.gc_interval_ms);
    println!("  Sync Timeout:   {} ms", config.storage.sync_timeout_ms);
    println!("  Outbound Queue: {}", config.storage.outbound_queue);
    println!("  Warm Sync:      {}", config.storage.warm_sync);
    println!();
    println!("Snapshots:");

    let mut found = 0;
    if let Ok(entries) = std::fs::read_dir(config.data_dir()) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                println!("  {}", path.display());
                found += 1;
            }
        }
    }
    if found == 0 {
        println!("  (none)");
    }

    Ok(())
}
