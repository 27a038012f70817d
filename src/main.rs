use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use feedwatch::config::Config;
use feedwatch::feed::{self, validate_feed_url, Feed, FeedRsParser};
use feedwatch::reader::FeedReader;
use feedwatch::storage::{Database, DatabaseError, FeedStore};

/// Get the config directory path (~/.config/feedwatch/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedwatch"))
}

#[derive(Parser, Debug)]
#[command(name = "feedwatch", version, about = "Adaptive feed polling scheduler")]
struct Args {
    /// Config file (default: ~/.config/feedwatch/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll feeds until interrupted
    Run {
        /// Stop after this many minutes
        #[arg(long)]
        minutes: Option<u64>,
    },
    /// Add feeds by URL
    Add {
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,
    },
    /// Add every feed of an OPML file
    Import {
        #[arg(value_name = "OPML")]
        path: PathBuf,
    },
    /// Fetch every stored feed once and store its activity pattern
    Classify {
        /// Feeds fetched at the same time
        #[arg(long, default_value_t = 16)]
        concurrency: usize,
    },
    /// Show the state of every stored feed
    List {
        #[arg(long)]
        json: bool,
    },
}

/// One row of `list`.
#[derive(Serialize)]
struct FeedStatus<'a> {
    id: i64,
    url: &'a str,
    checks: u32,
    update_interval: u32,
    unreachable: u32,
    unparsable: u32,
    activity_pattern: feed::FeedActivityPattern,
    last_result: Option<feed::FeedTaskResult>,
    blocked: bool,
}

impl<'a> From<&'a Feed> for FeedStatus<'a> {
    fn from(feed: &'a Feed) -> Self {
        Self {
            id: feed.id,
            url: &feed.url,
            checks: feed.checks,
            update_interval: feed.update_interval,
            unreachable: feed.unreachable_count,
            unparsable: feed.unparsable_count,
            activity_pattern: feed.activity_pattern,
            last_result: feed.last_feed_task_result,
            blocked: feed.is_blocked(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log_level in config")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700)) {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to set config directory permissions to 0700"
                );
            }
        }
    }

    let db_path = config.database_path(&config_dir);
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: The feed database is locked by another process. Please try again later.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };
    let store: Arc<dyn FeedStore> = Arc::new(db);

    match args.command {
        Command::Run { minutes } => {
            let ctx = config
                .task_context(Arc::clone(&store))
                .context("Failed to create HTTP client")?;
            FeedReader::new(ctx, config.scheduler_settings())
                .with_store_sync(config.store_sync_interval())
                .run_for(minutes.map(|m| Duration::from_secs(m * 60)))
                .await?;
        }
        Command::Add { urls } => {
            for raw in urls {
                let url = match validate_feed_url(&raw) {
                    Ok(url) => url,
                    Err(e) => {
                        eprintln!("Skipping {raw}: {e}");
                        continue;
                    }
                };
                if store.add_feed(&Feed::new(url.as_str())).await.context("Failed to add feed")? {
                    println!("Added {url}");
                } else {
                    println!("Already watching {url}");
                }
            }
        }
        Command::Import { path } => {
            let path_str = path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in OPML path"))?;
            let summary = feed::import(path_str, store.as_ref())
                .await
                .with_context(|| format!("Failed to import {}", path.display()))?;
            println!(
                "Imported {} feeds ({} already present)",
                summary.added, summary.already_present
            );
        }
        Command::Classify { concurrency } => {
            let http = config.http_client().context("Failed to create HTTP client")?;
            let hasher = config.item_hasher();
            let count = feed::classify_store(
                store.as_ref(),
                &http,
                &FeedRsParser,
                hasher.as_ref(),
                concurrency,
            )
            .await
            .context("Failed to classify feeds")?;
            println!("Classified {count} feeds");
        }
        Command::List { json } => {
            let feeds = store.list_feeds().await.context("Failed to load feeds")?;
            let rows: Vec<FeedStatus<'_>> = feeds.iter().map(FeedStatus::from).collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in &rows {
                    println!(
                        "{:>5}  {:<12} {:>5} checks  every {:>4} min  {:<22} {}{}",
                        row.id,
                        row.activity_pattern.as_str(),
                        row.checks,
                        row.update_interval,
                        row.last_result.map_or("-", |r| r.as_str()),
                        row.url,
                        if row.blocked { "  [blocked]" } else { "" }
                    );
                }
            }
        }
    }

    Ok(())
}
