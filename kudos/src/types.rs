//! Core types for the gamification engine.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Action type recorded for badge unlock bonuses.
pub const BADGE_BONUS: &str = "badge_bonus";
/// Action type recorded for mission completion bonuses.
pub const MISSION_BONUS: &str = "mission_bonus";
/// Action type recorded for compensating (reversal) events.
pub const REVERSAL: &str = "reversal";

/// Stable key identifying a kind of user action (e.g. `review_created`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionKey(String);

impl ActionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Keys the engine writes itself; they never feed progress counters.
    pub fn is_reserved(&self) -> bool {
        matches!(self.0.as_str(), BADGE_BONUS | MISSION_BONUS | REVERSAL)
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Named category of countable actions (e.g. `reviews`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequirementType(String);

impl RequirementType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequirementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequirementType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identity suffix scoping a mission's progress to a reset period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CycleKey(String);

impl CycleKey {
    /// Key shared by every permanent mission row.
    pub fn permanent() -> Self {
        Self("permanent".to_string())
    }

    /// Calendar-day key, `YYYY-MM-DD`.
    pub fn daily(date: NaiveDate) -> Self {
        Self(date.format("%Y-%m-%d").to_string())
    }

    /// ISO-week key, `YYYY-Www`.
    pub fn weekly(date: NaiveDate) -> Self {
        Self(date.format("%G-W%V").to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CycleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// An immutable, point-granting ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointEvent {
    /// Unique event ID
    pub id: String,
    /// User the points belong to
    pub user_id: String,
    /// Signed point delta (negative only for reversals)
    pub points: i64,
    /// What kind of action granted the points
    pub action_type: ActionKey,
    /// Human-readable description
    pub action_description: String,
    /// Idempotency token, unique per user
    pub dedupe_key: Option<String>,
    /// Event this entry compensates, for reversals
    pub reverses: Option<String>,
    /// When the event was appended
    pub created_at: DateTime<Utc>,
}

/// A request to append points to a user's ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwardRequest {
    pub user_id: String,
    pub action_type: ActionKey,
    pub points: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub dedupe_key: Option<String>,
}

impl AwardRequest {
    pub fn new(user_id: impl Into<String>, action_type: impl Into<ActionKey>, points: i64) -> Self {
        Self {
            user_id: user_id.into(),
            action_type: action_type.into(),
            points,
            description: None,
            dedupe_key: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Result of an award: either a fresh event or the one a dedupe key matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "event", rename_all = "snake_case")]
pub enum AwardReceipt {
    Recorded(PointEvent),
    Duplicate(PointEvent),
}

impl AwardReceipt {
    pub fn event(&self) -> &PointEvent {
        match self {
            AwardReceipt::Recorded(e) | AwardReceipt::Duplicate(e) => e,
        }
    }

    pub fn into_event(self) -> PointEvent {
        match self {
            AwardReceipt::Recorded(e) | AwardReceipt::Duplicate(e) => e,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AwardReceipt::Duplicate(_))
    }
}

/// Derived per-user summary kept consistent with the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAggregate {
    pub user_id: String,
    /// Sum of every ledger event for the user
    pub total_points: i64,
    /// Resolved level; 0 until the first resolution
    pub current_level: u32,
    /// Sum of ledger events inside `week_start`'s ISO week
    pub weekly_points: i64,
    /// Monday of the ISO week `weekly_points` belongs to
    pub week_start: NaiveDate,
    pub badges_count: u32,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl UserAggregate {
    /// A fresh aggregate with no points.
    pub fn empty(user_id: impl Into<String>, week_start: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            total_points: 0,
            current_level: 0,
            weekly_points: 0,
            week_start,
            badges_count: 0,
            last_activity_at: None,
        }
    }

    /// Weekly points as of `current_week`; stale weeks read as zero.
    pub fn weekly_points_in(&self, current_week: NaiveDate) -> i64 {
        if self.week_start == current_week {
            self.weekly_points
        } else {
            0
        }
    }
}

// ============================================================================
// Static definitions
// ============================================================================

/// A level band in the static threshold table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub level: u32,
    pub min_points: i64,
    /// `None` for the top level
    #[serde(default)]
    pub max_points: Option<i64>,
    pub name: String,
}

impl Level {
    pub fn contains(&self, points: i64) -> bool {
        points >= self.min_points && self.max_points.map_or(true, |max| points <= max)
    }
}

/// Badge rarity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Rarity {
    #[default]
    Common,
    Uncommon,
    Rare,
    Epic,
    Legendary,
}

impl Rarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rarity::Common => "common",
            Rarity::Uncommon => "uncommon",
            Rarity::Rare => "rare",
            Rarity::Epic => "epic",
            Rarity::Legendary => "legendary",
        }
    }
}

/// Static badge definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub requirement_type: RequirementType,
    pub requirement_count: u64,
    #[serde(default)]
    pub points_reward: i64,
    #[serde(default)]
    pub rarity: Rarity,
}

impl Badge {
    /// Dedupe key for this badge's one-time bonus.
    pub fn bonus_dedupe_key(&self) -> String {
        format!("badge:{}", self.key)
    }
}

/// A user's progress toward one badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBadge {
    pub user_id: String,
    pub badge_key: String,
    pub progress: u64,
    pub earned_at: Option<DateTime<Utc>>,
}

impl UserBadge {
    pub fn is_earned(&self) -> bool {
        self.earned_at.is_some()
    }
}

/// Reset period of a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionType {
    Daily,
    Weekly,
    Permanent,
}

impl MissionType {
    /// Cycle a moment in time belongs to for this mission type.
    pub fn cycle_key(&self, at: DateTime<Utc>) -> CycleKey {
        match self {
            MissionType::Daily => CycleKey::daily(at.date_naive()),
            MissionType::Weekly => CycleKey::weekly(at.date_naive()),
            MissionType::Permanent => CycleKey::permanent(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MissionType::Daily => "daily",
            MissionType::Weekly => "weekly",
            MissionType::Permanent => "permanent",
        }
    }
}

/// Static mission definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Requirement type whose increments count toward the mission
    pub action_key: RequirementType,
    pub target_count: u64,
    #[serde(default)]
    pub points: i64,
    #[serde(rename = "type")]
    pub mission_type: MissionType,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Mission {
    /// Dedupe key for this mission's bonus within one cycle.
    pub fn bonus_dedupe_key(&self, cycle: &CycleKey) -> String {
        format!("mission:{}:{}", self.id, cycle)
    }
}

/// A user's progress on one mission within one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMission {
    pub user_id: String,
    pub mission_id: String,
    pub cycle_key: CycleKey,
    pub progress: u64,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UserMission {
    pub fn new(user_id: impl Into<String>, mission_id: impl Into<String>, cycle_key: CycleKey) -> Self {
        Self {
            user_id: user_id.into(),
            mission_id: mission_id.into(),
            cycle_key,
            progress: 0,
            completed: false,
            completed_at: None,
        }
    }
}

// ============================================================================
// Progress
// ============================================================================

/// A requirement counter that changed because of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterDelta {
    pub requirement_type: RequirementType,
    pub previous: u64,
    pub current: u64,
    /// Time of the triggering event
    pub occurred_at: DateTime<Utc>,
}

impl CounterDelta {
    pub fn increment(&self) -> u64 {
        self.current.saturating_sub(self.previous)
    }
}

// ============================================================================
// Leaderboard
// ============================================================================

/// Which ranking a leaderboard read addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardScope {
    #[default]
    Global,
    Weekly,
}

impl LeaderboardScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaderboardScope::Global => "global",
            LeaderboardScope::Weekly => "weekly",
        }
    }
}

impl FromStr for LeaderboardScope {
    type Err = KudosError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(LeaderboardScope::Global),
            "weekly" => Ok(LeaderboardScope::Weekly),
            other => Err(KudosError::InvalidRequest(format!(
                "unknown leaderboard scope '{}'",
                other
            ))),
        }
    }
}

/// A cached leaderboard row with read-time rank positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user_id: String,
    pub total_points: i64,
    pub weekly_points: i64,
    pub current_level: u32,
    pub badges_count: u32,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub rank_position: usize,
    pub weekly_rank_position: usize,
}

// ============================================================================
// Errors
// ============================================================================

/// Error types for the gamification engine.
#[derive(Debug, thiserror::Error)]
pub enum KudosError {
    /// Unknown action, badge or mission key, or an invalid catalog
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed request from a caller
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent write conflict; safe to retry
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Notification delivery failure
    #[error("Notification error: {0}")]
    Notification(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for KudosError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::Conflict(err.to_string())
            }
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for KudosError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration(format!("YAML error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, KudosError>;
