//! # CropDroid: farm control plane daemon
//!
//! Polls every farm's devices, evaluates rules and schedules, actuates
//! channels and runs workflows until interrupted.
//!
//! Usage:
//!   cropdroid                          # Run with ~/.cropdroid/config.toml
//!   cropdroid --config farm.toml       # Explicit config file
//!   cropdroid --init-config            # Write the default config and exit
//!   cropdroid --seal "smtp-password"   # Print an enc: value for the config

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cropdroid_core::config::CropDroidConfig;
use cropdroid_core::model::FarmMode;
use cropdroid_db::SqliteDeviceDataStore;
use cropdroid_platform::ServiceRegistry;
use cropdroid_scheduler::build_mailer;
use cropdroid_security::SecretKey;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cropdroid", version, about = "🌱 CropDroid, farm automation control plane")]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, default_value = "~/.cropdroid/config.toml")]
    config: String,

    /// Override the farm mode for provisioned farms
    #[arg(long, value_parser = parse_mode)]
    mode: Option<FarmMode>,

    /// Override the poll interval in seconds
    #[arg(long)]
    interval: Option<u64>,

    /// Record every poll into this SQLite file
    #[arg(long)]
    history: Option<String>,

    /// Write the default config to --config and exit
    #[arg(long)]
    init_config: bool,

    /// Seal a secret with CROPDROID_SECRET_KEY and exit
    #[arg(long)]
    seal: Option<String>,

    /// Hash a password for a user record and exit
    #[arg(long)]
    hash_password: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_mode(s: &str) -> Result<FarmMode, String> {
    match s {
        "virtual" => Ok(FarmMode::Virtual),
        "server" => Ok(FarmMode::Server),
        "cloud" => Ok(FarmMode::Cloud),
        "maintenance" => Ok(FarmMode::Maintenance),
        other => Err(format!("unknown mode '{other}'")),
    }
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "cropdroid=debug,cropdroid_scheduler=debug,cropdroid_platform=debug,cropdroid_devices=debug,cropdroid_db=debug"
    } else {
        "cropdroid=info,cropdroid_scheduler=info,cropdroid_platform=info,cropdroid_devices=info,cropdroid_db=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = expand_path(&cli.config);

    if cli.init_config {
        if config_path.exists() {
            println!("⚠️  {} already exists, leaving it alone.", config_path.display());
            return Ok(());
        }
        CropDroidConfig::default().save_to(&config_path)?;
        println!("✅ Default config written to {}", config_path.display());
        return Ok(());
    }

    if let Some(secret) = &cli.seal {
        let key = SecretKey::from_env().context("CROPDROID_SECRET_KEY is not set")?;
        println!("{}", key.seal(secret)?);
        return Ok(());
    }

    if let Some(password) = &cli.hash_password {
        println!("{}", cropdroid_security::hash_password(password)?);
        return Ok(());
    }

    let mut config = if config_path.exists() {
        CropDroidConfig::load_from(&config_path)?
    } else {
        tracing::info!("📝 No config at {}, using defaults", config_path.display());
        CropDroidConfig::default()
    };
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(interval) = cli.interval {
        config.interval = interval;
    }
    config.validate()?;

    let key = SecretKey::from_env();
    if key.is_none() && config.notification.smtp.is_some() {
        tracing::warn!("⚠️  CROPDROID_SECRET_KEY not set; enc: secrets cannot be opened");
    }
    let mailer = build_mailer(&config.notification, key.as_ref())?;
    let store = cropdroid_db::open_store(&config)?;

    let mut registry = ServiceRegistry::new(config.clone(), store, mailer);
    if let Some(path) = &cli.history {
        let path = expand_path(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        registry = registry.with_history(Arc::new(SqliteDeviceDataStore::open(&path)?));
        tracing::info!("📈 recording device history to {}", path.display());
    }
    let registry = Arc::new(registry);

    println!("🌱 CropDroid v{}", env!("CARGO_PKG_VERSION"));
    println!("   Mode:       {}", config.mode.as_str());
    println!("   Interval:   {}s", config.interval);
    println!("   Timezone:   {}", config.timezone);
    println!("   Data store: {:?}", config.data_store);

    let farms = registry.start().await?;
    println!("   Farms:      {farms} loaded");
    println!();

    tokio::signal::ctrl_c().await?;
    println!("\n🛑 Shutting down...");
    registry.shutdown().await;
    Ok(())
}
