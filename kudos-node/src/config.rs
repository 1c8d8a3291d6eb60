//! Node configuration

use anyhow::Context;
use kudos::config::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Engine tuning (retry policy, leaderboard intervals)
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the HTTP API to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_json: false,
        }
    }
}

/// Which store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory; everything is lost on restart
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// YAML file with levels, badges, missions and action rules
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

// Defaults
fn default_listen() -> String { "0.0.0.0:8080".to_string() }
fn default_db_path() -> PathBuf { PathBuf::from("kudos.db") }
fn default_catalog_path() -> PathBuf { PathBuf::from("catalog.yaml") }

impl NodeConfig {
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = NodeConfig::from_toml("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.catalog.path, PathBuf::from("catalog.yaml"));
        assert_eq!(config.engine.ledger.max_attempts, 5);
    }

    #[test]
    fn test_partial_sections() {
        let config = NodeConfig::from_toml(
            r#"
[server]
listen = "127.0.0.1:9000"

[storage]
backend = "memory"

[engine.leaderboard]
rebuild_interval_secs = 60
"#,
        )
        .unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert!(!config.server.log_json);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.engine.leaderboard.rebuild_interval_secs, 60);
        assert_eq!(config.engine.leaderboard.flush_interval_ms, 1000);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(NodeConfig::from_toml("[storage]\nbackend = \"mongo\"\n").is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = NodeConfig::load(Path::new("/nonexistent/kudos-node.toml")).unwrap();
        assert_eq!(config.storage.path, PathBuf::from("kudos.db"));
    }
}
