//! Persistence seams for the engine.
//!
//! The logical tables (`point_events`, `user_aggregates`, `progress_*`,
//! `user_badges`, `user_missions`, `leaderboard_cache`) are reached through
//! four narrow traits, one per component, so that each component depends only
//! on the slice of state it owns:
//!
//! | Trait | Used by |
//! |---|---|
//! | [`LedgerBackend`] | ledger, leaderboard, query facade |
//! | [`ProgressBackend`] | progress tracker |
//! | [`AchievementBackend`] | achievement evaluator, query facade |
//! | [`CacheBackend`] | leaderboard |
//!
//! Any type implementing all four is a [`Store`].

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;

use crate::clock::week_start;
use crate::types::{
    Badge, CycleKey, LeaderboardEntry, Mission, PointEvent, RequirementType, Result,
    UserAggregate, UserBadge, UserMission,
};

/// Outcome of the atomic append + aggregate increment.
#[derive(Debug, Clone)]
pub struct AwardCommit {
    /// The appended event, or the existing one its dedupe key matched
    pub event: PointEvent,
    /// Aggregate as of the end of the unit
    pub aggregate: UserAggregate,
    pub duplicate: bool,
}

/// Outcome of a ledger-only append.
#[derive(Debug, Clone)]
pub struct AppendResult {
    pub event: PointEvent,
    pub duplicate: bool,
}

/// Outcome of recording badge progress.
#[derive(Debug, Clone)]
pub struct BadgeUpdate {
    pub badge: UserBadge,
    /// True only for the single call that set `earned_at`
    pub newly_earned: bool,
}

/// Outcome of advancing a mission row.
#[derive(Debug, Clone)]
pub struct MissionUpdate {
    pub mission: UserMission,
    /// True only for the single call that completed the row
    pub newly_completed: bool,
    /// The source had already advanced this row; nothing was added
    pub replayed: bool,
}

/// One counter an action feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterOp {
    pub requirement_type: RequirementType,
    /// Entity counted by a distinct counter; `None` counts an occurrence
    pub distinct_entity: Option<String>,
}

impl CounterOp {
    pub fn occurrence(requirement_type: RequirementType) -> Self {
        Self {
            requirement_type,
            distinct_entity: None,
        }
    }

    pub fn distinct(requirement_type: RequirementType, entity_id: impl Into<String>) -> Self {
        Self {
            requirement_type,
            distinct_entity: Some(entity_id.into()),
        }
    }
}

/// A counter that moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterChange {
    pub requirement_type: RequirementType,
    pub previous: u64,
    pub current: u64,
}

/// Counter changes attributed to one source.
#[derive(Debug, Clone, Default)]
pub struct AppliedCounters {
    pub changes: Vec<CounterChange>,
    /// An earlier call already applied this source; `changes` are the ones
    /// it recorded
    pub replayed: bool,
}

/// A persisted leaderboard version.
#[derive(Debug, Clone)]
pub struct CachedLeaderboard {
    pub version: u64,
    pub built_at: DateTime<Utc>,
    pub entries: Vec<LeaderboardEntry>,
}

/// Fold one freshly appended event into its owner's aggregate.
///
/// `week_sum` is only called when the event opens a newer ISO week than the
/// aggregate holds, and must return the ledger sum for that week including
/// the event itself. Events older than the aggregate's week leave
/// `weekly_points` alone.
pub(crate) fn fold_event<F>(agg: &mut UserAggregate, event: &PointEvent, week_sum: F) -> Result<()>
where
    F: FnOnce(NaiveDate) -> Result<i64>,
{
    let week = week_start(event.created_at);
    agg.total_points += event.points;
    if week == agg.week_start {
        agg.weekly_points += event.points;
    } else if week > agg.week_start {
        agg.week_start = week;
        agg.weekly_points = week_sum(week)?;
    }
    agg.last_activity_at = Some(
        agg.last_activity_at
            .map_or(event.created_at, |last| last.max(event.created_at)),
    );
    Ok(())
}

/// Append-only ledger plus the transactionally maintained aggregates.
#[async_trait::async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Append `event` and fold it into the user's aggregate as one atomic unit.
    ///
    /// If the event carries a dedupe key already used by the same user,
    /// nothing is written and the existing event is returned. May fail with
    /// [`KudosError::Conflict`](crate::types::KudosError::Conflict), in which
    /// case nothing was written.
    async fn record_award(&self, event: PointEvent) -> Result<AwardCommit>;

    /// Append `event` without touching the aggregate (repair path).
    async fn append_event(&self, event: PointEvent) -> Result<AppendResult>;

    async fn event(&self, id: &str) -> Result<Option<PointEvent>>;

    /// Events for a user, newest first.
    async fn history(&self, user_id: &str, limit: usize) -> Result<Vec<PointEvent>>;

    async fn aggregate(&self, user_id: &str) -> Result<Option<UserAggregate>>;

    /// Snapshot of every aggregate.
    async fn aggregates(&self) -> Result<Vec<UserAggregate>>;

    /// Set `current_level` only if it still equals `expected`.
    async fn compare_and_set_level(&self, user_id: &str, expected: u32, level: u32) -> Result<bool>;

    /// Recompute a user's aggregate from the ledger, keeping its level.
    async fn reconcile_aggregate(&self, user_id: &str, now: DateTime<Utc>) -> Result<UserAggregate>;

    /// Per-user ledger sums for events at or after `since`.
    async fn totals_since(&self, since: DateTime<Utc>) -> Result<HashMap<String, i64>>;
}

/// Monotonic requirement counters.
#[async_trait::async_trait]
pub trait ProgressBackend: Send + Sync {
    /// Apply `ops` on behalf of `source` (normally a ledger event id).
    ///
    /// The counter moves and the record that `source` was applied commit as
    /// one unit. Calling again with the same source changes nothing and
    /// returns the changes stored the first time, flagged `replayed`.
    /// Occurrence ops add one; distinct ops add one only for an entity not
    /// yet counted, and produce no change otherwise.
    async fn apply_counters(
        &self,
        user_id: &str,
        source: &str,
        ops: &[CounterOp],
    ) -> Result<AppliedCounters>;

    async fn counter(&self, user_id: &str, requirement: &RequirementType) -> Result<u64>;
}

/// Badge and mission progress rows.
#[async_trait::async_trait]
pub trait AchievementBackend: Send + Sync {
    async fn user_badge(&self, user_id: &str, badge_key: &str) -> Result<Option<UserBadge>>;

    async fn user_badges(&self, user_id: &str) -> Result<Vec<UserBadge>>;

    /// Raise badge progress to `progress` (never lowers it) and set
    /// `earned_at = at` the first time the requirement is met, bumping the
    /// user's `badges_count` in the same unit.
    async fn record_badge_progress(
        &self,
        user_id: &str,
        badge: &Badge,
        progress: u64,
        at: DateTime<Utc>,
    ) -> Result<BadgeUpdate>;

    async fn user_mission(
        &self,
        user_id: &str,
        mission_id: &str,
        cycle: &CycleKey,
    ) -> Result<Option<UserMission>>;

    /// Every mission row for a user, all cycles.
    async fn user_missions(&self, user_id: &str) -> Result<Vec<UserMission>>;

    /// Add `increment` to the `(user, mission, cycle)` row, creating it on
    /// first use. Completed rows are left untouched.
    ///
    /// Each `source` advances a row at most once; a repeat returns the row
    /// as it stands with `replayed` set.
    async fn advance_mission(
        &self,
        user_id: &str,
        mission: &Mission,
        cycle: &CycleKey,
        source: &str,
        increment: u64,
        at: DateTime<Utc>,
    ) -> Result<MissionUpdate>;
}

/// Versioned leaderboard cache table.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    /// Write a complete version and make it the active one.
    async fn save_leaderboard(&self, snapshot: CachedLeaderboard) -> Result<()>;

    /// The active version, if any.
    async fn load_leaderboard(&self) -> Result<Option<CachedLeaderboard>>;
}

/// A complete storage backend.
pub trait Store: LedgerBackend + ProgressBackend + AchievementBackend + CacheBackend {}

impl<T> Store for T where T: LedgerBackend + ProgressBackend + AchievementBackend + CacheBackend {}
