use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use offline_cache::cache::OfflineCache;
use offline_cache::config::Config;
use offline_cache::storage::StorageError;

/// Get the config directory path (~/.config/offline-cache/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("offline-cache"))
}

#[derive(Parser, Debug)]
#[command(name = "offline-cache", about = "Inspect and maintain the offline content cache")]
struct Args {
    /// Config file (defaults to ~/.config/offline-cache/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file, overriding the config
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show entry counts, image bytes and the oldest entry
    Stats,
    /// Remove every cached article, image and offline read
    Clear,
    /// Remove expired articles and images now
    Purge,
    /// List articles read while offline, most recent first
    Reads,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let limits = config.limits().context("Invalid cache limits in config")?;

    let db_path = match (&args.database, &config.database_path) {
        (Some(path), _) => path.clone(),
        (None, Some(path)) => PathBuf::from(path),
        (None, None) => {
            if !config_dir.exists() {
                std::fs::create_dir_all(&config_dir)
                    .context("Failed to create config directory")?;
            }
            config_dir.join("cache.db")
        }
    };
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    let cache = match OfflineCache::open(db_path_str, limits).await {
        Ok(cache) => cache,
        Err(StorageError::Unavailable(reason)) => {
            eprintln!("Error: The cache database is in use or cannot be opened ({reason}).");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open cache database: {}", e)),
    };

    match args.command {
        Command::Stats => {
            let stats = cache.cache_stats().await;
            println!("Articles:    {}", stats.article_count);
            println!("Images:      {}", stats.image_count);
            println!("Image bytes: {}", stats.total_cache_size);
            match stats.oldest_cache_date {
                Some(oldest) => println!("Oldest:      {}", oldest.to_rfc3339()),
                None => println!("Oldest:      -"),
            }
        }
        Command::Clear => {
            cache
                .clear_cache()
                .await
                .context("Failed to clear cache")?;
            println!("Cache cleared.");
        }
        Command::Purge => {
            let removed = cache
                .purge_expired()
                .await
                .context("Failed to purge expired entries")?;
            println!("Removed {} expired entries.", removed);
        }
        Command::Reads => {
            let reads = cache.reads().get_offline_reads().await;
            if reads.is_empty() {
                println!("No offline reads recorded.");
            }
            for read in reads {
                let progress = read
                    .progress
                    .map(|p| format!("{p}%"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:<4}  {:>4}  {}",
                    read.read_at.to_rfc3339(),
                    read.article_kind.as_str(),
                    progress,
                    read.article_id
                );
            }
        }
    }

    Ok(())
}
