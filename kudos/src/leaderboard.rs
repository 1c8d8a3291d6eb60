//! Leaderboard Aggregator.
//!
//! Two consistency tiers over one in-memory table:
//!
//! ```text
//!   touch(user) ──► dirty set ──► flush_dirty() ──► upsert rows in place
//!                                                    (batched, advisory)
//!
//!   rebuild() ──► snapshot aggregates + weekly ledger sums
//!             ──► build a new table off-lock
//!             ──► persist version (optional) ──► swap under write lock
//! ```
//!
//! Rows sit in two ordered indexes (global and weekly). Rank positions are
//! never stored per write: the first read after a change walks both indexes
//! once and caches a position map, which the next upsert discards. Ordering
//! is points descending, then earlier `last_activity_at`, then user id, which
//! makes it a strict total order.

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashSet;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::clock::{week_start, week_start_instant, Clock};
use crate::config::LeaderboardConfig;
use crate::store::{CacheBackend, CachedLeaderboard, LedgerBackend};
use crate::types::{LeaderboardEntry, LeaderboardScope, Result, UserAggregate};

/// Sort key inside one index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RankKey {
    points: Reverse<i64>,
    /// Millis of last activity; users with none sort last
    last_activity: i64,
    user_id: String,
}

#[derive(Debug, Clone)]
struct Row {
    user_id: String,
    total_points: i64,
    weekly_points: i64,
    current_level: u32,
    badges_count: u32,
    last_activity_at: Option<DateTime<Utc>>,
}

impl Row {
    fn from_aggregate(agg: &UserAggregate, weekly_points: i64) -> Self {
        Self {
            user_id: agg.user_id.clone(),
            total_points: agg.total_points,
            weekly_points,
            current_level: agg.current_level,
            badges_count: agg.badges_count,
            last_activity_at: agg.last_activity_at,
        }
    }

    fn key(&self, scope: LeaderboardScope) -> RankKey {
        let points = match scope {
            LeaderboardScope::Global => self.total_points,
            LeaderboardScope::Weekly => self.weekly_points,
        };
        RankKey {
            points: Reverse(points),
            last_activity: self
                .last_activity_at
                .map_or(i64::MAX, |at| at.timestamp_millis()),
            user_id: self.user_id.clone(),
        }
    }
}

/// One leaderboard version.
#[derive(Debug)]
struct LeaderboardTable {
    version: u64,
    built_at: Option<DateTime<Utc>>,
    /// ISO week the weekly points belong to
    week_start: NaiveDate,
    rows: HashMap<String, Row>,
    global: BTreeSet<RankKey>,
    weekly: BTreeSet<RankKey>,
    /// Rank positions for the current index contents
    positions: OnceLock<Positions>,
}

/// 1-based positions of every user in both indexes.
#[derive(Debug, Default)]
struct Positions {
    global: HashMap<String, usize>,
    weekly: HashMap<String, usize>,
}

impl Positions {
    fn compute(global: &BTreeSet<RankKey>, weekly: &BTreeSet<RankKey>) -> Self {
        let enumerate = |index: &BTreeSet<RankKey>| {
            index
                .iter()
                .enumerate()
                .map(|(idx, key)| (key.user_id.clone(), idx + 1))
                .collect::<HashMap<_, _>>()
        };
        Self {
            global: enumerate(global),
            weekly: enumerate(weekly),
        }
    }
}

impl LeaderboardTable {
    fn empty(version: u64, week_start: NaiveDate) -> Self {
        Self {
            version,
            built_at: None,
            week_start,
            rows: HashMap::new(),
            global: BTreeSet::new(),
            weekly: BTreeSet::new(),
            positions: OnceLock::new(),
        }
    }

    fn index(&self, scope: LeaderboardScope) -> &BTreeSet<RankKey> {
        match scope {
            LeaderboardScope::Global => &self.global,
            LeaderboardScope::Weekly => &self.weekly,
        }
    }

    fn upsert(&mut self, row: Row) {
        if let Some(old) = self.rows.remove(&row.user_id) {
            self.global.remove(&old.key(LeaderboardScope::Global));
            self.weekly.remove(&old.key(LeaderboardScope::Weekly));
        }
        self.global.insert(row.key(LeaderboardScope::Global));
        self.weekly.insert(row.key(LeaderboardScope::Weekly));
        self.rows.insert(row.user_id.clone(), row);
        self.positions = OnceLock::new();
    }

    fn positions(&self) -> &Positions {
        self.positions
            .get_or_init(|| Positions::compute(&self.global, &self.weekly))
    }

    fn entry(&self, row: &Row) -> LeaderboardEntry {
        let positions = self.positions();
        let position = |map: &HashMap<String, usize>| map.get(&row.user_id).copied().unwrap_or(0);
        LeaderboardEntry {
            user_id: row.user_id.clone(),
            total_points: row.total_points,
            weekly_points: row.weekly_points,
            current_level: row.current_level,
            badges_count: row.badges_count,
            last_activity_at: row.last_activity_at,
            rank_position: position(&positions.global),
            weekly_rank_position: position(&positions.weekly),
        }
    }

    fn page(&self, scope: LeaderboardScope, limit: usize, offset: usize) -> Vec<LeaderboardEntry> {
        self.index(scope)
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|key| self.rows.get(&key.user_id))
            .map(|row| self.entry(row))
            .collect()
    }

    fn snapshot(&self) -> CachedLeaderboard {
        CachedLeaderboard {
            version: self.version,
            built_at: self.built_at.unwrap_or_default(),
            entries: self.page(LeaderboardScope::Global, usize::MAX, 0),
        }
    }

    fn from_snapshot(snapshot: CachedLeaderboard) -> Self {
        let mut table = Self::empty(snapshot.version, week_start(snapshot.built_at));
        table.built_at = Some(snapshot.built_at);
        for entry in snapshot.entries {
            table.upsert(Row {
                user_id: entry.user_id,
                total_points: entry.total_points,
                weekly_points: entry.weekly_points,
                current_level: entry.current_level,
                badges_count: entry.badges_count,
                last_activity_at: entry.last_activity_at,
            });
        }
        table
    }
}

/// Point-in-time leaderboard health.
#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardStats {
    pub version: u64,
    /// ISO week the served weekly points belong to
    pub week_start: NaiveDate,
    pub rows: usize,
    pub dirty: usize,
    pub rebuilds: u64,
    pub rebuild_failures: u64,
    pub rows_flushed: u64,
    pub last_rebuild_at: Option<DateTime<Utc>>,
    pub last_rebuild_error: Option<String>,
}

#[derive(Debug, Default)]
struct RebuildStatus {
    last_rebuild_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Cached, ranked view over user aggregates.
pub struct Leaderboard {
    backend: Arc<dyn LedgerBackend>,
    cache: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    config: LeaderboardConfig,
    table: RwLock<LeaderboardTable>,
    dirty: DashSet<String>,
    /// Serializes flushes and rebuilds against each other
    refresh_lock: Mutex<()>,
    rebuilds: AtomicU64,
    rebuild_failures: AtomicU64,
    rows_flushed: AtomicU64,
    status: RwLock<RebuildStatus>,
}

impl Leaderboard {
    pub fn new(
        backend: Arc<dyn LedgerBackend>,
        cache: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        config: LeaderboardConfig,
    ) -> Self {
        let week = week_start(clock.now());
        Self {
            backend,
            cache,
            clock,
            config,
            table: RwLock::new(LeaderboardTable::empty(0, week)),
            dirty: DashSet::new(),
            refresh_lock: Mutex::new(()),
            rebuilds: AtomicU64::new(0),
            rebuild_failures: AtomicU64::new(0),
            rows_flushed: AtomicU64::new(0),
            status: RwLock::new(RebuildStatus::default()),
        }
    }

    /// Mark a user's row as needing a refresh.
    pub fn touch(&self, user_id: &str) {
        if self.dirty.insert(user_id.to_string()) {
            debug!(user_id, "Leaderboard row marked dirty");
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Refresh up to `max_flush_batch` dirty rows from their aggregates.
    ///
    /// Returns how many rows were refreshed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let _guard = self.refresh_lock.lock().await;

        let batch: Vec<String> = self
            .dirty
            .iter()
            .take(self.config.max_flush_batch.max(1))
            .map(|user| user.key().clone())
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }
        for user_id in &batch {
            self.dirty.remove(user_id);
        }

        let current_week = week_start(self.clock.now());
        let mut rows = Vec::with_capacity(batch.len());
        for (idx, user_id) in batch.iter().enumerate() {
            match self.backend.aggregate(user_id).await {
                Ok(Some(agg)) => {
                    let weekly = agg.weekly_points_in(current_week);
                    rows.push(Row::from_aggregate(&agg, weekly));
                }
                Ok(None) => {}
                Err(e) => {
                    // Put the unprocessed remainder back for the next flush
                    for user_id in &batch[idx..] {
                        self.dirty.insert(user_id.clone());
                    }
                    return Err(e);
                }
            }
        }

        let refreshed = rows.len();
        {
            let mut table = self.table.write().await;
            for row in rows {
                table.upsert(row);
            }
        }
        self.rows_flushed.fetch_add(refreshed as u64, Ordering::Relaxed);
        debug!(refreshed, "Leaderboard dirty rows flushed");
        Ok(refreshed)
    }

    /// Recompute every row from a snapshot of the aggregates and swap the
    /// result in as a new version.
    ///
    /// On failure the current version keeps serving and the error is kept in
    /// [`LeaderboardStats::last_rebuild_error`].
    pub async fn rebuild(&self) -> Result<u64> {
        let _guard = self.refresh_lock.lock().await;
        let now = self.clock.now();

        match self.build(now).await {
            Ok(table) => {
                let version = table.version;
                let rows = table.rows.len();
                *self.table.write().await = table;

                self.rebuilds.fetch_add(1, Ordering::Relaxed);
                let mut status = self.status.write().await;
                status.last_rebuild_at = Some(now);
                status.last_error = None;

                info!(version, rows, "Leaderboard rebuilt");
                Ok(version)
            }
            Err(e) => {
                self.rebuild_failures.fetch_add(1, Ordering::Relaxed);
                self.status.write().await.last_error = Some(e.to_string());
                error!(error = %e, "Leaderboard rebuild failed, keeping current version");
                Err(e)
            }
        }
    }

    async fn build(&self, now: DateTime<Utc>) -> Result<LeaderboardTable> {
        let aggregates = self.backend.aggregates().await?;
        let weekly = self.backend.totals_since(week_start_instant(now)).await?;
        let version = self.table.read().await.version + 1;

        let mut table = LeaderboardTable::empty(version, week_start(now));
        table.built_at = Some(now);
        for agg in &aggregates {
            let weekly_points = weekly.get(&agg.user_id).copied().unwrap_or(0);
            table.upsert(Row::from_aggregate(agg, weekly_points));
        }

        if self.config.persist_snapshots {
            self.cache.save_leaderboard(table.snapshot()).await?;
        }
        Ok(table)
    }

    /// Serve the last persisted version until the first rebuild lands.
    ///
    /// Returns the loaded version, if any.
    pub async fn warm_from_cache(&self) -> Result<Option<u64>> {
        let Some(snapshot) = self.cache.load_leaderboard().await? else {
            return Ok(None);
        };
        let table = LeaderboardTable::from_snapshot(snapshot);
        let version = table.version;
        let rows = table.rows.len();
        *self.table.write().await = table;
        info!(version, rows, "Leaderboard warmed from persisted version");
        Ok(Some(version))
    }

    /// A page of the leaderboard with read-time rank positions.
    pub async fn rank(&self, scope: LeaderboardScope, limit: usize, offset: usize) -> Vec<LeaderboardEntry> {
        self.table.read().await.page(scope, limit, offset)
    }

    /// A single user's cached row.
    pub async fn rank_of(&self, user_id: &str) -> Option<LeaderboardEntry> {
        let table = self.table.read().await;
        table.rows.get(user_id).map(|row| table.entry(row))
    }

    pub async fn row_count(&self) -> usize {
        self.table.read().await.rows.len()
    }

    pub async fn version(&self) -> u64 {
        self.table.read().await.version
    }

    pub async fn stats(&self) -> LeaderboardStats {
        let (version, week_start, rows) = {
            let table = self.table.read().await;
            (table.version, table.week_start, table.rows.len())
        };
        let status = self.status.read().await;
        LeaderboardStats {
            version,
            week_start,
            rows,
            dirty: self.dirty.len(),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            rebuild_failures: self.rebuild_failures.load(Ordering::Relaxed),
            rows_flushed: self.rows_flushed.load(Ordering::Relaxed),
            last_rebuild_at: status.last_rebuild_at,
            last_rebuild_error: status.last_error.clone(),
        }
    }
}
