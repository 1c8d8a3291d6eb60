//! Kudos - Gamification Engine
//!
//! Turns user actions into points, levels, badges, missions and rankings:
//!
//! - **Ledger**: append-only, idempotent point events with reversals
//! - **Progress**: per-user requirement counters, including distinct-entity counts
//! - **Achievements**: badge unlocks and cycle-keyed missions with bonus awards
//! - **Levels**: static threshold table, one notification per level-up
//! - **Leaderboard**: versioned global and weekly rankings
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     GamificationEngine                       │
//! │                                                              │
//! │  ┌─────────┐   ┌──────────┐   ┌──────────────┐               │
//! │  │ Ledger  │──▶│ Progress │──▶│ Achievements │──┐ bonuses    │
//! │  └────┬────┘   └──────────┘   └──────────────┘  │            │
//! │       │  ▲                                      │            │
//! │       │  └──────────────────────────────────────┘            │
//! │       ▼                                                      │
//! │  ┌─────────────┐      ┌──────────────┐                       │
//! │  │ Leaderboard │◀─────│ QueryFacade  │                       │
//! │  └──────┬──────┘      └──────────────┘                       │
//! └─────────┼────────────────────────────────────────────────────┘
//!           ▼
//!     Store (memory | sqlite)
//! ```

pub mod achievements;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod leaderboard;
pub mod ledger;
pub mod levels;
pub mod notify;
pub mod progress;
pub mod query;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export main types
pub use catalog::Catalog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{ActionOutcome, ActionRequest, EngineBuilder, GamificationEngine};
pub use notify::{ChannelNotifier, Notification, Notifier, TracingNotifier};
pub use store::{MemoryStore, SqliteStore, Store};
pub use types::*;
