//! kudos-node: HTTP service for the Kudos gamification engine

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kudos::scheduler::spawn_background_tasks;
use kudos_node::config::{NodeConfig, StorageBackend};
use kudos_node::{build_engine, create_router, AppState};

#[derive(Parser)]
#[command(name = "kudos-node")]
#[command(about = "HTTP service for the Kudos gamification engine")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "kudos-node.toml", env = "KUDOS_CONFIG")]
    config: PathBuf,

    /// Listen address (overrides config file)
    #[arg(short, long, env = "KUDOS_LISTEN")]
    listen: Option<String>,

    /// Catalog YAML (overrides config file)
    #[arg(long, env = "KUDOS_CATALOG")]
    catalog: Option<PathBuf>,

    /// Storage backend: memory or sqlite (overrides config file)
    #[arg(long, env = "KUDOS_STORAGE")]
    storage: Option<String>,

    /// SQLite database path (overrides config file)
    #[arg(long, env = "KUDOS_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level for kudos crates
    #[arg(long, default_value = "info", env = "KUDOS_LOG_LEVEL")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long, env = "KUDOS_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("kudos={},kudos_node={},info", log_level, log_level).into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn apply_overrides(config: &mut NodeConfig, cli: &Cli) -> anyhow::Result<()> {
    if let Some(listen) = &cli.listen {
        config.server.listen = listen.clone();
    }
    if let Some(catalog) = &cli.catalog {
        config.catalog.path = catalog.clone();
    }
    if let Some(storage) = &cli.storage {
        config.storage.backend = match storage.as_str() {
            "memory" => StorageBackend::Memory,
            "sqlite" => StorageBackend::Sqlite,
            other => anyhow::bail!("unknown storage backend '{}'", other),
        };
    }
    if let Some(path) = &cli.db_path {
        config.storage.path = path.clone();
    }
    if cli.log_json {
        config.server.log_json = true;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = NodeConfig::load(&cli.config)?;
    apply_overrides(&mut config, &cli)?;

    init_tracing(&cli.log_level, config.server.log_json);

    info!("Starting kudos-node");
    info!("Config file: {}", cli.config.display());
    info!("Catalog: {}", config.catalog.path.display());
    info!("Storage: {:?}", config.storage.backend);

    let engine = Arc::new(build_engine(&config)?);
    let version = engine.initialize().await;
    info!(version, "Leaderboard ready");

    let (shutdown_tx, _) = broadcast::channel(1);
    let tasks = spawn_background_tasks(engine.clone(), &shutdown_tx);

    let app = create_router(Arc::new(AppState::new(engine)));
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    info!("API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down background tasks");
    let _ = shutdown_tx.send(());
    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}
