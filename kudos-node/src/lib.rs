//! kudos-node: HTTP service for the Kudos gamification engine
//!
//! Exposes the engine's write pipeline (actions, awards, reversals) and the
//! read-only query facade as a JSON API, and runs the leaderboard
//! maintenance loops in the background.

pub mod config;
pub mod error;
pub mod routes;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use kudos::{Catalog, GamificationEngine, MemoryStore, SqliteStore};
use std::sync::Arc;
use tracing::info;

use config::{NodeConfig, StorageBackend};

/// State shared across handlers
pub struct AppState {
    pub engine: Arc<GamificationEngine>,
}

impl AppState {
    pub fn new(engine: Arc<GamificationEngine>) -> Self {
        Self { engine }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Writes
        .route("/api/actions", post(routes::record_action))
        .route("/api/awards", post(routes::award_points))
        .route("/api/events/:id/reverse", post(routes::reverse_event))
        // Reads
        .route("/api/users/:id/stats", get(routes::user_stats))
        .route("/api/users/:id/badges", get(routes::user_badges))
        .route("/api/users/:id/missions", get(routes::user_missions))
        .route("/api/users/:id/history", get(routes::user_history))
        .route("/api/leaderboard", get(routes::leaderboard))
        .route("/api/levels", get(routes::levels))
        // Admin
        .route("/api/admin/rebuild", post(routes::rebuild))
        .route("/api/admin/stats", get(routes::stats))
        // Health check
        .route("/health", get(routes::health))
        .with_state(state)
}

/// Load the catalog and open the configured store.
pub fn build_engine(config: &NodeConfig) -> anyhow::Result<GamificationEngine> {
    let catalog_path = &config.catalog.path;
    let yaml = std::fs::read_to_string(catalog_path)
        .with_context(|| format!("reading catalog {}", catalog_path.display()))?;
    let catalog = Catalog::from_yaml(&yaml)
        .with_context(|| format!("loading catalog {}", catalog_path.display()))?;

    let builder = GamificationEngine::builder(catalog).config(config.engine.clone());
    let engine = match config.storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory store");
            builder.build(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Sqlite => {
            info!(path = %config.storage.path.display(), "Opening SQLite store");
            let store = SqliteStore::open(&config.storage.path)
                .with_context(|| format!("opening {}", config.storage.path.display()))?;
            builder.build(Arc::new(store))
        }
    };
    Ok(engine)
}
