//! ClipStake round engine service
//!
//! Opens the engine store, restores rounds and stakes, runs the round
//! scheduler on its tick interval and serves the HTTP API.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clipstake_backend::{
    api,
    engine::{EngagementFeed, HttpEngagementFeed, RoundScheduler, StaticEngagementFeed},
    store::EngineDb,
    EngineConfig, PredictionMarket,
};

#[derive(Parser, Debug)]
#[command(name = "clipstake")]
#[command(about = "Prediction round lifecycle and settlement service")]
struct Args {
    /// Optional TOML config file
    #[arg(long, env = "CLIPSTAKE_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config)
    #[arg(long)]
    db: Option<String>,

    /// Listen address (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// Engagement feed base URL (overrides config)
    #[arg(long)]
    feed_url: Option<String>,

    /// Serve the API without running the round scheduler
    #[arg(long, default_value = "false")]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();
    let args = Args::parse();

    let mut config = EngineConfig::load(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.db_path = db;
    }
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(url) = args.feed_url {
        config.feed_url = Some(url);
    }
    config.validate()?;

    info!("🚀 ClipStake engine starting");
    info!(
        categories = ?config.categories,
        round_duration_secs = config.round_duration_secs,
        tick_interval_secs = config.tick_interval_secs,
        min_stake = config.min_stake,
        "Engine configuration loaded"
    );

    let db = Arc::new(EngineDb::new(&config.db_path)?);
    let market = Arc::new(
        PredictionMarket::with_store(config.clone(), db)
            .context("Failed to restore engine state")?,
    );

    let feed: Arc<dyn EngagementFeed> = match &config.feed_url {
        Some(url) => {
            info!(url = %url, "📡 Using HTTP engagement feed");
            Arc::new(HttpEngagementFeed::new(url, config.feed_timeout())?)
        }
        None => {
            warn!("ENGAGEMENT_FEED_URL not set; using empty in-process feed");
            Arc::new(StaticEngagementFeed::new())
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = if args.no_scheduler {
        info!("Round scheduler disabled (--no-scheduler)");
        None
    } else {
        let scheduler = RoundScheduler::new(market.clone(), feed);
        Some(tokio::spawn(async move { scheduler.run(shutdown_rx).await }))
    };

    let app = api::create_router(market)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("🎯 API server listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Scheduler task failed");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clipstake_backend=debug,clipstake=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory
    let _ = dotenv();

    let env_file = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if env_file.exists() {
        let _ = dotenv::from_path(&env_file);
    }
}
