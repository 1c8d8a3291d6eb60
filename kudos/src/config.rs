//! Runtime configuration for the engine.
//!
//! Product data (levels, badges, missions, action rules) lives in the
//! [`Catalog`](crate::catalog::Catalog); this module only holds tuning knobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`GamificationEngine`](crate::engine::GamificationEngine).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ledger write configuration
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Leaderboard cache configuration
    #[serde(default)]
    pub leaderboard: LeaderboardConfig,
    /// Notification delivery configuration
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl EngineConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// Ledger write configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Attempts for the append + aggregate unit before falling back to repair
    pub max_attempts: u32,
    /// First backoff delay (ms); doubles per attempt
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay (ms)
    pub max_delay_ms: u64,
    /// Compare-and-set rounds when settling a level before giving up
    pub level_settle_rounds: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 500,
            level_settle_rounds: 8,
        }
    }
}

impl LedgerConfig {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Leaderboard cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderboardConfig {
    /// Full rebuild interval (seconds)
    pub rebuild_interval_secs: u64,
    /// Dirty-row flush interval (ms)
    pub flush_interval_ms: u64,
    /// Maximum dirty rows refreshed per flush
    pub max_flush_batch: usize,
    /// Persist each rebuilt version through the store
    pub persist_snapshots: bool,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            rebuild_interval_secs: 300, // 5 minutes
            flush_interval_ms: 1000,
            max_flush_batch: 500,
            persist_snapshots: true,
        }
    }
}

impl LeaderboardConfig {
    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_secs(self.rebuild_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Notification delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Give up on a single delivery after this long (ms)
    pub delivery_timeout_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: 2000,
        }
    }
}
