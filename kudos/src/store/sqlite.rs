//! SQLite store.
//!
//! A single connection behind a mutex, driven from `spawn_blocking`. Every
//! multi-row write runs in an `IMMEDIATE` transaction so the append, the
//! aggregate update and any counter bump commit or roll back together.
//!
//! Counter bumps and mission advances are keyed by their source event:
//! `progress_applied` and `mission_applied` record which sources already
//! landed, inside the same transaction as the bump, so a replayed source
//! changes nothing.
//!
//! Timestamps are stored as INTEGER milliseconds since the epoch; ISO week
//! starts as `YYYY-MM-DD` text.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use super::{
    fold_event, AchievementBackend, AppendResult, AppliedCounters, AwardCommit, BadgeUpdate,
    CacheBackend, CachedLeaderboard, CounterChange, CounterOp, LedgerBackend, MissionUpdate,
    ProgressBackend,
};
use crate::clock::{next_week_start, week_start, week_start_instant};
use crate::types::{
    ActionKey, Badge, CycleKey, KudosError, LeaderboardEntry, Mission, PointEvent,
    RequirementType, Result, UserAggregate, UserBadge, UserMission,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS point_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    user_id TEXT NOT NULL,
    points INTEGER NOT NULL,
    action_type TEXT NOT NULL,
    action_description TEXT NOT NULL,
    dedupe_key TEXT,
    reverses TEXT,
    created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_point_events_dedupe
    ON point_events(user_id, dedupe_key) WHERE dedupe_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_point_events_user ON point_events(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_point_events_created ON point_events(created_at);

CREATE TABLE IF NOT EXISTS user_aggregates (
    user_id TEXT PRIMARY KEY,
    total_points INTEGER NOT NULL DEFAULT 0,
    current_level INTEGER NOT NULL DEFAULT 0,
    weekly_points INTEGER NOT NULL DEFAULT 0,
    week_start TEXT NOT NULL,
    badges_count INTEGER NOT NULL DEFAULT 0,
    last_activity_at INTEGER
);

CREATE TABLE IF NOT EXISTS progress_counters (
    user_id TEXT NOT NULL,
    requirement_type TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, requirement_type)
);

CREATE TABLE IF NOT EXISTS progress_distinct (
    user_id TEXT NOT NULL,
    requirement_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    PRIMARY KEY (user_id, requirement_type, entity_id)
);

CREATE TABLE IF NOT EXISTS progress_sources (
    user_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    PRIMARY KEY (user_id, source_id)
);

CREATE TABLE IF NOT EXISTS progress_applied (
    user_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    requirement_type TEXT NOT NULL,
    previous INTEGER NOT NULL,
    current INTEGER NOT NULL,
    PRIMARY KEY (user_id, source_id, position)
);

CREATE TABLE IF NOT EXISTS user_badges (
    user_id TEXT NOT NULL,
    badge_key TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    earned_at INTEGER,
    PRIMARY KEY (user_id, badge_key)
);

CREATE TABLE IF NOT EXISTS user_missions (
    user_id TEXT NOT NULL,
    mission_id TEXT NOT NULL,
    cycle_key TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    completed INTEGER NOT NULL DEFAULT 0,
    completed_at INTEGER,
    PRIMARY KEY (user_id, mission_id, cycle_key)
);

CREATE TABLE IF NOT EXISTS mission_applied (
    user_id TEXT NOT NULL,
    mission_id TEXT NOT NULL,
    cycle_key TEXT NOT NULL,
    source_id TEXT NOT NULL,
    PRIMARY KEY (user_id, mission_id, cycle_key, source_id)
);

CREATE TABLE IF NOT EXISTS leaderboard_versions (
    version INTEGER PRIMARY KEY,
    built_at INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS leaderboard_cache (
    version INTEGER NOT NULL,
    user_id TEXT NOT NULL,
    total_points INTEGER NOT NULL,
    weekly_points INTEGER NOT NULL,
    current_level INTEGER NOT NULL,
    badges_count INTEGER NOT NULL,
    last_activity_at INTEGER,
    rank_position INTEGER NOT NULL,
    weekly_rank_position INTEGER NOT NULL,
    PRIMARY KEY (version, user_id)
);
"#;

/// Store backed by a SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening SQLite store at {:?}", path);

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory SQLite store");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(50))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| KudosError::Storage(format!("Lock poisoned: {}", e)))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| KudosError::Internal(format!("Blocking task failed: {}", e)))?
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn event_from_row(row: &Row) -> rusqlite::Result<PointEvent> {
    Ok(PointEvent {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        points: row.get("points")?,
        action_type: ActionKey::new(row.get::<_, String>("action_type")?),
        action_description: row.get("action_description")?,
        dedupe_key: row.get("dedupe_key")?,
        reverses: row.get("reverses")?,
        created_at: from_millis(row.get("created_at")?),
    })
}

fn aggregate_from_row(row: &Row) -> rusqlite::Result<UserAggregate> {
    Ok(UserAggregate {
        user_id: row.get("user_id")?,
        total_points: row.get("total_points")?,
        current_level: row.get::<_, i64>("current_level")? as u32,
        weekly_points: row.get("weekly_points")?,
        week_start: parse_date(&row.get::<_, String>("week_start")?)?,
        badges_count: row.get::<_, i64>("badges_count")? as u32,
        last_activity_at: row.get::<_, Option<i64>>("last_activity_at")?.map(from_millis),
    })
}

fn badge_from_row(row: &Row) -> rusqlite::Result<UserBadge> {
    Ok(UserBadge {
        user_id: row.get("user_id")?,
        badge_key: row.get("badge_key")?,
        progress: row.get::<_, i64>("progress")? as u64,
        earned_at: row.get::<_, Option<i64>>("earned_at")?.map(from_millis),
    })
}

fn mission_from_row(row: &Row) -> rusqlite::Result<UserMission> {
    Ok(UserMission {
        user_id: row.get("user_id")?,
        mission_id: row.get("mission_id")?,
        cycle_key: CycleKey::from_raw(row.get::<_, String>("cycle_key")?),
        progress: row.get::<_, i64>("progress")? as u64,
        completed: row.get("completed")?,
        completed_at: row.get::<_, Option<i64>>("completed_at")?.map(from_millis),
    })
}

fn entry_from_row(row: &Row) -> rusqlite::Result<LeaderboardEntry> {
    Ok(LeaderboardEntry {
        user_id: row.get("user_id")?,
        total_points: row.get("total_points")?,
        weekly_points: row.get("weekly_points")?,
        current_level: row.get::<_, i64>("current_level")? as u32,
        badges_count: row.get::<_, i64>("badges_count")? as u32,
        last_activity_at: row.get::<_, Option<i64>>("last_activity_at")?.map(from_millis),
        rank_position: row.get::<_, i64>("rank_position")? as usize,
        weekly_rank_position: row.get::<_, i64>("weekly_rank_position")? as usize,
    })
}

// ============================================================================
// Statements shared by several operations
// ============================================================================

const EVENT_COLUMNS: &str =
    "id, user_id, points, action_type, action_description, dedupe_key, reverses, created_at";

fn find_by_dedupe(conn: &Connection, user_id: &str, dedupe_key: &str) -> Result<Option<PointEvent>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM point_events WHERE user_id = ?1 AND dedupe_key = ?2",
        EVENT_COLUMNS
    ))?;
    Ok(stmt
        .query_row(params![user_id, dedupe_key], event_from_row)
        .optional()?)
}

fn insert_event(tx: &Transaction, event: &PointEvent) -> Result<()> {
    let result = tx.execute(
        "INSERT INTO point_events
            (id, user_id, points, action_type, action_description, dedupe_key, reverses, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.id,
            event.user_id,
            event.points,
            event.action_type.as_str(),
            event.action_description,
            event.dedupe_key,
            event.reverses,
            to_millis(event.created_at),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        // Another writer took the dedupe key between our lookup and insert
        Err(rusqlite::Error::SqliteFailure(e, msg))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(KudosError::Conflict(
                msg.unwrap_or_else(|| "dedupe key taken concurrently".to_string()),
            ))
        }
        Err(e) => Err(e.into()),
    }
}

fn load_aggregate(conn: &Connection, user_id: &str) -> Result<Option<UserAggregate>> {
    let mut stmt = conn.prepare_cached(
        "SELECT user_id, total_points, current_level, weekly_points, week_start,
                badges_count, last_activity_at
         FROM user_aggregates WHERE user_id = ?1",
    )?;
    Ok(stmt.query_row(params![user_id], aggregate_from_row).optional()?)
}

fn store_aggregate(tx: &Transaction, agg: &UserAggregate) -> Result<()> {
    tx.execute(
        "INSERT INTO user_aggregates
            (user_id, total_points, current_level, weekly_points, week_start, badges_count, last_activity_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(user_id) DO UPDATE SET
            total_points = excluded.total_points,
            current_level = excluded.current_level,
            weekly_points = excluded.weekly_points,
            week_start = excluded.week_start,
            badges_count = excluded.badges_count,
            last_activity_at = excluded.last_activity_at",
        params![
            agg.user_id,
            agg.total_points,
            agg.current_level as i64,
            agg.weekly_points,
            agg.week_start.format("%Y-%m-%d").to_string(),
            agg.badges_count as i64,
            agg.last_activity_at.map(to_millis),
        ],
    )?;
    Ok(())
}

fn sum_between(
    conn: &Connection,
    user_id: &str,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<i64> {
    let mut stmt = conn.prepare_cached(
        "SELECT COALESCE(SUM(points), 0) FROM point_events
         WHERE user_id = ?1 AND created_at >= ?2 AND created_at < ?3",
    )?;
    Ok(stmt.query_row(params![user_id, to_millis(from), to_millis(until)], |row| row.get(0))?)
}

fn immediate(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

fn applied_changes(tx: &Transaction, user_id: &str, source: &str) -> Result<Vec<CounterChange>> {
    let mut stmt = tx.prepare_cached(
        "SELECT requirement_type, previous, current FROM progress_applied
         WHERE user_id = ?1 AND source_id = ?2
         ORDER BY position",
    )?;
    let changes = stmt
        .query_map(params![user_id, source], |row| {
            Ok(CounterChange {
                requirement_type: RequirementType::new(row.get::<_, String>(0)?),
                previous: row.get::<_, i64>(1)? as u64,
                current: row.get::<_, i64>(2)? as u64,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(changes)
}

// ============================================================================
// Backends
// ============================================================================

#[async_trait::async_trait]
impl LedgerBackend for SqliteStore {
    async fn record_award(&self, event: PointEvent) -> Result<AwardCommit> {
        self.with_conn(move |conn| {
            let tx = immediate(conn)?;

            if let Some(key) = &event.dedupe_key {
                if let Some(existing) = find_by_dedupe(&tx, &event.user_id, key)? {
                    let aggregate = load_aggregate(&tx, &event.user_id)?.unwrap_or_else(|| {
                        UserAggregate::empty(&event.user_id, week_start(event.created_at))
                    });
                    return Ok(AwardCommit {
                        event: existing,
                        aggregate,
                        duplicate: true,
                    });
                }
            }

            insert_event(&tx, &event)?;
            let mut aggregate = load_aggregate(&tx, &event.user_id)?.unwrap_or_else(|| {
                UserAggregate::empty(&event.user_id, week_start(event.created_at))
            });
            fold_event(&mut aggregate, &event, |_| {
                sum_between(
                    &tx,
                    &event.user_id,
                    week_start_instant(event.created_at),
                    next_week_start(event.created_at),
                )
            })?;
            store_aggregate(&tx, &aggregate)?;
            tx.commit()?;

            Ok(AwardCommit {
                event,
                aggregate,
                duplicate: false,
            })
        })
        .await
    }

    async fn append_event(&self, event: PointEvent) -> Result<AppendResult> {
        self.with_conn(move |conn| {
            let tx = immediate(conn)?;
            if let Some(key) = &event.dedupe_key {
                if let Some(existing) = find_by_dedupe(&tx, &event.user_id, key)? {
                    return Ok(AppendResult {
                        event: existing,
                        duplicate: true,
                    });
                }
            }
            insert_event(&tx, &event)?;
            tx.commit()?;
            Ok(AppendResult {
                event,
                duplicate: false,
            })
        })
        .await
    }

    async fn event(&self, id: &str) -> Result<Option<PointEvent>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM point_events WHERE id = ?1",
                EVENT_COLUMNS
            ))?;
            Ok(stmt.query_row(params![id], event_from_row).optional()?)
        })
        .await
    }

    async fn history(&self, user_id: &str, limit: usize) -> Result<Vec<PointEvent>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM point_events WHERE user_id = ?1 ORDER BY seq DESC LIMIT ?2",
                EVENT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![user_id, limit as i64], event_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn aggregate(&self, user_id: &str) -> Result<Option<UserAggregate>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| load_aggregate(conn, &user_id)).await
    }

    async fn aggregates(&self) -> Result<Vec<UserAggregate>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT user_id, total_points, current_level, weekly_points, week_start,
                        badges_count, last_activity_at
                 FROM user_aggregates",
            )?;
            let rows = stmt.query_map([], aggregate_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn compare_and_set_level(&self, user_id: &str, expected: u32, level: u32) -> Result<bool> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE user_aggregates SET current_level = ?3
                 WHERE user_id = ?1 AND current_level = ?2",
                params![user_id, expected as i64, level as i64],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn reconcile_aggregate(&self, user_id: &str, now: DateTime<Utc>) -> Result<UserAggregate> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let tx = immediate(conn)?;

            let (count, total, last): (i64, i64, Option<i64>) = tx.query_row(
                "SELECT COUNT(*), COALESCE(SUM(points), 0), MAX(created_at)
                 FROM point_events WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            let existing = load_aggregate(&tx, &user_id)?;
            if count == 0 && existing.is_none() {
                return Err(KudosError::NotFound(format!("no ledger for user {}", user_id)));
            }

            let weekly = sum_between(&tx, &user_id, week_start_instant(now), next_week_start(now))?;
            let badges_count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM user_badges WHERE user_id = ?1 AND earned_at IS NOT NULL",
                params![user_id],
                |row| row.get(0),
            )?;

            let mut agg = existing.unwrap_or_else(|| UserAggregate::empty(&user_id, week_start(now)));
            agg.total_points = total;
            agg.weekly_points = weekly;
            agg.week_start = week_start(now);
            agg.badges_count = badges_count as u32;
            agg.last_activity_at = last.map(from_millis);

            store_aggregate(&tx, &agg)?;
            tx.commit()?;

            debug!(user_id = %agg.user_id, total, weekly, "Aggregate reconciled from ledger");
            Ok(agg)
        })
        .await
    }

    async fn totals_since(&self, since: DateTime<Utc>) -> Result<HashMap<String, i64>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT user_id, SUM(points) FROM point_events
                 WHERE created_at >= ?1 GROUP BY user_id",
            )?;
            let rows = stmt.query_map(params![to_millis(since)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
        })
        .await
    }
}

#[async_trait::async_trait]
impl ProgressBackend for SqliteStore {
    async fn apply_counters(
        &self,
        user_id: &str,
        source: &str,
        ops: &[CounterOp],
    ) -> Result<AppliedCounters> {
        let user_id = user_id.to_string();
        let source = source.to_string();
        let ops = ops.to_vec();
        self.with_conn(move |conn| {
            let tx = immediate(conn)?;

            let fresh = tx.execute(
                "INSERT OR IGNORE INTO progress_sources (user_id, source_id) VALUES (?1, ?2)",
                params![user_id, source],
            )?;
            if fresh == 0 {
                let changes = applied_changes(&tx, &user_id, &source)?;
                return Ok(AppliedCounters {
                    changes,
                    replayed: true,
                });
            }

            let mut changes = Vec::with_capacity(ops.len());
            for op in &ops {
                let requirement = op.requirement_type.as_str();
                if let Some(entity_id) = &op.distinct_entity {
                    let inserted = tx.execute(
                        "INSERT OR IGNORE INTO progress_distinct (user_id, requirement_type, entity_id)
                         VALUES (?1, ?2, ?3)",
                        params![user_id, requirement, entity_id],
                    )?;
                    if inserted == 0 {
                        continue;
                    }
                }
                let current: i64 = tx.query_row(
                    "INSERT INTO progress_counters (user_id, requirement_type, count)
                     VALUES (?1, ?2, 1)
                     ON CONFLICT(user_id, requirement_type) DO UPDATE SET count = count + 1
                     RETURNING count",
                    params![user_id, requirement],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO progress_applied
                        (user_id, source_id, position, requirement_type, previous, current)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![user_id, source, changes.len() as i64, requirement, current - 1, current],
                )?;
                changes.push(CounterChange {
                    requirement_type: op.requirement_type.clone(),
                    previous: (current - 1) as u64,
                    current: current as u64,
                });
            }
            tx.commit()?;

            Ok(AppliedCounters {
                changes,
                replayed: false,
            })
        })
        .await
    }

    async fn counter(&self, user_id: &str, requirement: &RequirementType) -> Result<u64> {
        let user_id = user_id.to_string();
        let requirement = requirement.as_str().to_string();
        self.with_conn(move |conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT count FROM progress_counters WHERE user_id = ?1 AND requirement_type = ?2",
                    params![user_id, requirement],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0) as u64)
        })
        .await
    }
}

const BADGE_COLUMNS: &str = "user_id, badge_key, progress, earned_at";
const MISSION_COLUMNS: &str = "user_id, mission_id, cycle_key, progress, completed, completed_at";

#[async_trait::async_trait]
impl AchievementBackend for SqliteStore {
    async fn user_badge(&self, user_id: &str, badge_key: &str) -> Result<Option<UserBadge>> {
        let user_id = user_id.to_string();
        let badge_key = badge_key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM user_badges WHERE user_id = ?1 AND badge_key = ?2",
                BADGE_COLUMNS
            ))?;
            Ok(stmt
                .query_row(params![user_id, badge_key], badge_from_row)
                .optional()?)
        })
        .await
    }

    async fn user_badges(&self, user_id: &str) -> Result<Vec<UserBadge>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM user_badges WHERE user_id = ?1 ORDER BY badge_key",
                BADGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![user_id], badge_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn record_badge_progress(
        &self,
        user_id: &str,
        badge: &Badge,
        progress: u64,
        at: DateTime<Utc>,
    ) -> Result<BadgeUpdate> {
        let user_id = user_id.to_string();
        let badge = badge.clone();
        self.with_conn(move |conn| {
            let tx = immediate(conn)?;

            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM user_badges WHERE user_id = ?1 AND badge_key = ?2",
                        BADGE_COLUMNS
                    ),
                    params![user_id, badge.key],
                    badge_from_row,
                )
                .optional()?;
            let mut row = existing.unwrap_or_else(|| UserBadge {
                user_id: user_id.clone(),
                badge_key: badge.key.clone(),
                progress: 0,
                earned_at: None,
            });

            row.progress = row.progress.max(progress);
            let newly_earned = row.earned_at.is_none() && row.progress >= badge.requirement_count;
            if newly_earned {
                row.earned_at = Some(at);
            }

            tx.execute(
                "INSERT INTO user_badges (user_id, badge_key, progress, earned_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, badge_key) DO UPDATE SET
                    progress = excluded.progress,
                    earned_at = excluded.earned_at",
                params![
                    row.user_id,
                    row.badge_key,
                    row.progress as i64,
                    row.earned_at.map(to_millis),
                ],
            )?;

            if newly_earned {
                tx.execute(
                    "INSERT INTO user_aggregates (user_id, week_start, badges_count)
                     VALUES (?1, ?2, 1)
                     ON CONFLICT(user_id) DO UPDATE SET badges_count = badges_count + 1",
                    params![user_id, week_start(at).format("%Y-%m-%d").to_string()],
                )?;
            }

            tx.commit()?;
            Ok(BadgeUpdate {
                badge: row,
                newly_earned,
            })
        })
        .await
    }

    async fn user_mission(
        &self,
        user_id: &str,
        mission_id: &str,
        cycle: &CycleKey,
    ) -> Result<Option<UserMission>> {
        let user_id = user_id.to_string();
        let mission_id = mission_id.to_string();
        let cycle = cycle.as_str().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM user_missions
                 WHERE user_id = ?1 AND mission_id = ?2 AND cycle_key = ?3",
                MISSION_COLUMNS
            ))?;
            Ok(stmt
                .query_row(params![user_id, mission_id, cycle], mission_from_row)
                .optional()?)
        })
        .await
    }

    async fn user_missions(&self, user_id: &str) -> Result<Vec<UserMission>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM user_missions WHERE user_id = ?1 ORDER BY mission_id, cycle_key",
                MISSION_COLUMNS
            ))?;
            let rows = stmt.query_map(params![user_id], mission_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn advance_mission(
        &self,
        user_id: &str,
        mission: &Mission,
        cycle: &CycleKey,
        source: &str,
        increment: u64,
        at: DateTime<Utc>,
    ) -> Result<MissionUpdate> {
        let user_id = user_id.to_string();
        let mission = mission.clone();
        let cycle = cycle.clone();
        let source = source.to_string();
        self.with_conn(move |conn| {
            let tx = immediate(conn)?;

            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM user_missions
                         WHERE user_id = ?1 AND mission_id = ?2 AND cycle_key = ?3",
                        MISSION_COLUMNS
                    ),
                    params![user_id, mission.id, cycle.as_str()],
                    mission_from_row,
                )
                .optional()?;
            let mut row =
                existing.unwrap_or_else(|| UserMission::new(&user_id, &mission.id, cycle.clone()));

            let fresh = tx.execute(
                "INSERT OR IGNORE INTO mission_applied (user_id, mission_id, cycle_key, source_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, mission.id, cycle.as_str(), source],
            )?;
            if fresh == 0 {
                return Ok(MissionUpdate {
                    mission: row,
                    newly_completed: false,
                    replayed: true,
                });
            }
            if row.completed {
                // Dropping the transaction rolls back the marker
                return Ok(MissionUpdate {
                    mission: row,
                    newly_completed: false,
                    replayed: false,
                });
            }

            row.progress = (row.progress + increment).min(mission.target_count);
            let newly_completed = row.progress >= mission.target_count;
            if newly_completed {
                row.completed = true;
                row.completed_at = Some(at);
            }

            tx.execute(
                "INSERT INTO user_missions
                    (user_id, mission_id, cycle_key, progress, completed, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, mission_id, cycle_key) DO UPDATE SET
                    progress = excluded.progress,
                    completed = excluded.completed,
                    completed_at = excluded.completed_at",
                params![
                    row.user_id,
                    row.mission_id,
                    row.cycle_key.as_str(),
                    row.progress as i64,
                    row.completed,
                    row.completed_at.map(to_millis),
                ],
            )?;
            tx.commit()?;

            Ok(MissionUpdate {
                mission: row,
                newly_completed,
                replayed: false,
            })
        })
        .await
    }
}

#[async_trait::async_trait]
impl CacheBackend for SqliteStore {
    async fn save_leaderboard(&self, snapshot: CachedLeaderboard) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = immediate(conn)?;
            let version = snapshot.version as i64;

            tx.execute(
                "INSERT OR REPLACE INTO leaderboard_versions (version, built_at, active)
                 VALUES (?1, ?2, 0)",
                params![version, to_millis(snapshot.built_at)],
            )?;
            tx.execute("DELETE FROM leaderboard_cache WHERE version = ?1", params![version])?;
            {
                let mut insert = tx.prepare_cached(
                    "INSERT INTO leaderboard_cache
                        (version, user_id, total_points, weekly_points, current_level,
                         badges_count, last_activity_at, rank_position, weekly_rank_position)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for entry in &snapshot.entries {
                    insert.execute(params![
                        version,
                        entry.user_id,
                        entry.total_points,
                        entry.weekly_points,
                        entry.current_level as i64,
                        entry.badges_count as i64,
                        entry.last_activity_at.map(to_millis),
                        entry.rank_position as i64,
                        entry.weekly_rank_position as i64,
                    ])?;
                }
            }

            // Swap the active pointer, then drop superseded versions
            tx.execute(
                "UPDATE leaderboard_versions SET active = (version = ?1)",
                params![version],
            )?;
            tx.execute("DELETE FROM leaderboard_cache WHERE version <> ?1", params![version])?;
            tx.execute("DELETE FROM leaderboard_versions WHERE version <> ?1", params![version])?;
            tx.commit()?;

            debug!(version, rows = snapshot.entries.len(), "Leaderboard version persisted");
            Ok(())
        })
        .await
    }

    async fn load_leaderboard(&self) -> Result<Option<CachedLeaderboard>> {
        self.with_conn(|conn| {
            let active: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT version, built_at FROM leaderboard_versions WHERE active = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((version, built_at)) = active else {
                return Ok(None);
            };

            let mut stmt = conn.prepare_cached(
                "SELECT user_id, total_points, weekly_points, current_level, badges_count,
                        last_activity_at, rank_position, weekly_rank_position
                 FROM leaderboard_cache WHERE version = ?1 ORDER BY rank_position",
            )?;
            let entries = stmt
                .query_map(params![version], entry_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(Some(CachedLeaderboard {
                version: version as u64,
                built_at: from_millis(built_at),
                entries,
            }))
        })
        .await
    }
}
