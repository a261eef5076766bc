// src/main.rs
//! `feedgate` binary: poll feeds, dedup, summarize and publish.
//!
//! ```bash
//! feedgate --config ./config/feedgate.toml init
//! feedgate run
//! feedgate watch --interval-secs 300
//! feedgate feeds
//! feedgate prune
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feedgate::bootstrap::{build_pipeline, build_store};
use feedgate::config::{load_config, resolve_config_path};

#[derive(Parser)]
#[command(
    name = "feedgate",
    version,
    about = "Feed poller with two-tier dedup and at-most-once publishing"
)]
struct Cli {
    /// Path to the TOML config. Falls back to $FEEDGATE_CONFIG, then ./config/feedgate.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9000).
    #[arg(long, global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store schema. Safe to run repeatedly.
    Init,
    /// One full pass over every configured feed; prints the run report as JSON.
    Run,
    /// Repeat passes until Ctrl-C. Feeds are only fetched once their interval elapsed.
    Watch {
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },
    /// List configured feeds with their persisted fetch state.
    Feeds,
    /// Forget publications older than the retention window.
    Prune,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feedgate=info,warn"));
    let json = std::env::var("FEEDGATE_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let path = resolve_config_path(cli.config.as_deref())?;
    let cfg = load_config(&path)?;
    info!(config = %path.display(), feeds = cfg.feeds.len(), "config loaded");

    match cli.metrics_addr {
        Some(addr) => {
            feedgate::metrics::install_prometheus(addr)?;
            info!(%addr, "metrics exporter listening");
        }
        None => feedgate::metrics::ensure_described(),
    }

    match cli.command {
        Commands::Init => {
            build_store(&cfg.store).await?;
            println!("Store ready ({} backend).", cfg.store.backend);
        }
        Commands::Run => {
            let pipeline = build_pipeline(&cfg).await?;
            let report = pipeline.run_once(&cfg.feeds).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing run report")?
            );
        }
        Commands::Watch { interval_secs } => {
            let pipeline = build_pipeline(&cfg).await?;
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = pipeline.run_due(&cfg.feeds).await;
                        for w in &report.warnings {
                            warn!(warning = %w, "run warning");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutting down");
                        break;
                    }
                }
            }
        }
        Commands::Feeds => {
            let pipeline = build_pipeline(&cfg).await?;
            for s in pipeline.feed_status(&cfg.feeds).await? {
                println!(
                    "{:>5}  {:<11} errors={:<3} backoff={:>5}s  last={:<3}  {}{}",
                    s.feed_id,
                    format!("{:?}", s.health).to_lowercase(),
                    s.error_count,
                    s.backoff_remaining_secs,
                    s.last_status,
                    s.url,
                    if s.enabled { "" } else { "  (disabled)" }
                );
            }
        }
        Commands::Prune => {
            let pipeline = build_pipeline(&cfg).await?;
            let n = pipeline.prune().await?;
            println!("Pruned {n} publication(s).");
        }
    }
    Ok(())
}
