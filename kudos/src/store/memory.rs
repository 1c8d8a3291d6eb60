//! In-memory store.
//!
//! Per-user state lives in `DashMap` entries; holding a user's entry is the
//! per-user lock that makes append + aggregate increment atomic. Writes for
//! different users land on different shards and rarely contend.

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    fold_event, AchievementBackend, AppendResult, AppliedCounters, AwardCommit, BadgeUpdate,
    CacheBackend, CachedLeaderboard, CounterChange, CounterOp, LedgerBackend, MissionUpdate,
    ProgressBackend,
};
use crate::clock::week_start;
use crate::types::{
    Badge, CycleKey, KudosError, Mission, PointEvent, RequirementType, Result, UserAggregate,
    UserBadge, UserMission,
};

/// One user's slice of the ledger.
#[derive(Debug, Default)]
struct UserLedger {
    /// Events in append order
    events: Vec<PointEvent>,
    /// dedupe key -> index into `events`
    dedupe: HashMap<String, usize>,
    aggregate: Option<UserAggregate>,
}

impl UserLedger {
    fn find_duplicate(&self, event: &PointEvent) -> Option<&PointEvent> {
        event
            .dedupe_key
            .as_ref()
            .and_then(|key| self.dedupe.get(key))
            .map(|&idx| &self.events[idx])
    }

    fn push(&mut self, event: PointEvent) {
        if let Some(key) = &event.dedupe_key {
            self.dedupe.insert(key.clone(), self.events.len());
        }
        self.events.push(event);
    }

    /// Fold the most recently pushed event into the aggregate.
    fn fold(&mut self, event: &PointEvent) -> Result<UserAggregate> {
        let events = &self.events;
        let agg = self
            .aggregate
            .get_or_insert_with(|| UserAggregate::empty(&event.user_id, week_start(event.created_at)));
        fold_event(agg, event, |week| Ok(week_sum(events, week)))?;
        Ok(agg.clone())
    }
}

/// One user's requirement counters.
#[derive(Debug, Default)]
struct UserProgress {
    counts: HashMap<RequirementType, u64>,
    /// Entities already counted by distinct counters
    entities: HashMap<RequirementType, HashSet<String>>,
    /// source -> changes it made
    applied: HashMap<String, Vec<CounterChange>>,
}

impl UserProgress {
    fn apply(&mut self, op: &CounterOp) -> Option<CounterChange> {
        if let Some(entity) = &op.distinct_entity {
            let seen = self.entities.entry(op.requirement_type.clone()).or_default();
            if !seen.insert(entity.clone()) {
                return None;
            }
        }
        let count = self.counts.entry(op.requirement_type.clone()).or_insert(0);
        let previous = *count;
        *count += 1;
        Some(CounterChange {
            requirement_type: op.requirement_type.clone(),
            previous,
            current: *count,
        })
    }
}

/// A mission row and the sources that advanced it.
#[derive(Debug)]
struct MissionRow {
    mission: UserMission,
    sources: HashSet<String>,
}

fn week_sum(events: &[PointEvent], week: NaiveDate) -> i64 {
    events
        .iter()
        .filter(|e| week_start(e.created_at) == week)
        .map(|e| e.points)
        .sum()
}

/// Store that keeps every table in process memory.
pub struct MemoryStore {
    users: DashMap<String, UserLedger>,
    /// event id -> user id
    event_owners: DashMap<String, String>,
    progress: DashMap<String, UserProgress>,
    badges: DashMap<String, HashMap<String, UserBadge>>,
    missions: DashMap<String, HashMap<(String, CycleKey), MissionRow>>,
    leaderboard: RwLock<Option<CachedLeaderboard>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            event_owners: DashMap::new(),
            progress: DashMap::new(),
            badges: DashMap::new(),
            missions: DashMap::new(),
            leaderboard: RwLock::new(None),
        }
    }

    /// Number of ledger events across all users.
    pub fn event_count(&self) -> usize {
        self.event_owners.len()
    }

    fn earned_badges(&self, user_id: &str) -> u32 {
        self.badges
            .get(user_id)
            .map(|rows| rows.values().filter(|b| b.is_earned()).count() as u32)
            .unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LedgerBackend for MemoryStore {
    async fn record_award(&self, event: PointEvent) -> Result<AwardCommit> {
        let mut ledger = self.users.entry(event.user_id.clone()).or_default();

        if let Some(existing) = ledger.find_duplicate(&event) {
            let existing = existing.clone();
            let aggregate = ledger.aggregate.clone().unwrap_or_else(|| {
                UserAggregate::empty(&event.user_id, week_start(event.created_at))
            });
            return Ok(AwardCommit {
                event: existing,
                aggregate,
                duplicate: true,
            });
        }

        self.event_owners
            .insert(event.id.clone(), event.user_id.clone());
        ledger.push(event.clone());
        let aggregate = ledger.fold(&event)?;

        Ok(AwardCommit {
            event,
            aggregate,
            duplicate: false,
        })
    }

    async fn append_event(&self, event: PointEvent) -> Result<AppendResult> {
        let mut ledger = self.users.entry(event.user_id.clone()).or_default();

        if let Some(existing) = ledger.find_duplicate(&event) {
            return Ok(AppendResult {
                event: existing.clone(),
                duplicate: true,
            });
        }

        self.event_owners
            .insert(event.id.clone(), event.user_id.clone());
        ledger.push(event.clone());
        Ok(AppendResult {
            event,
            duplicate: false,
        })
    }

    async fn event(&self, id: &str) -> Result<Option<PointEvent>> {
        let Some(owner) = self.event_owners.get(id).map(|o| o.value().clone()) else {
            return Ok(None);
        };
        Ok(self
            .users
            .get(&owner)
            .and_then(|ledger| ledger.events.iter().find(|e| e.id == id).cloned()))
    }

    async fn history(&self, user_id: &str, limit: usize) -> Result<Vec<PointEvent>> {
        Ok(self
            .users
            .get(user_id)
            .map(|ledger| ledger.events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn aggregate(&self, user_id: &str) -> Result<Option<UserAggregate>> {
        Ok(self
            .users
            .get(user_id)
            .and_then(|ledger| ledger.aggregate.clone()))
    }

    async fn aggregates(&self) -> Result<Vec<UserAggregate>> {
        Ok(self
            .users
            .iter()
            .filter_map(|entry| entry.aggregate.clone())
            .collect())
    }

    async fn compare_and_set_level(&self, user_id: &str, expected: u32, level: u32) -> Result<bool> {
        let Some(mut ledger) = self.users.get_mut(user_id) else {
            return Ok(false);
        };
        match ledger.aggregate.as_mut() {
            Some(agg) if agg.current_level == expected => {
                agg.current_level = level;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reconcile_aggregate(&self, user_id: &str, now: DateTime<Utc>) -> Result<UserAggregate> {
        let badges_count = self.earned_badges(user_id);
        let mut ledger = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| KudosError::NotFound(format!("no ledger for user {}", user_id)))?;

        let week = week_start(now);
        let total: i64 = ledger.events.iter().map(|e| e.points).sum();
        let weekly = week_sum(&ledger.events, week);
        let last = ledger.events.iter().map(|e| e.created_at).max();

        let agg = ledger
            .aggregate
            .get_or_insert_with(|| UserAggregate::empty(user_id, week));
        agg.total_points = total;
        agg.weekly_points = weekly;
        agg.week_start = week;
        agg.badges_count = badges_count;
        agg.last_activity_at = last;

        debug!(user_id, total, weekly, "Aggregate reconciled from ledger");
        Ok(agg.clone())
    }

    async fn totals_since(&self, since: DateTime<Utc>) -> Result<HashMap<String, i64>> {
        let mut totals = HashMap::new();
        for entry in self.users.iter() {
            let mut in_range = entry
                .events
                .iter()
                .filter(|e| e.created_at >= since)
                .peekable();
            if in_range.peek().is_some() {
                totals.insert(entry.key().clone(), in_range.map(|e| e.points).sum());
            }
        }
        Ok(totals)
    }
}

#[async_trait::async_trait]
impl ProgressBackend for MemoryStore {
    async fn apply_counters(
        &self,
        user_id: &str,
        source: &str,
        ops: &[CounterOp],
    ) -> Result<AppliedCounters> {
        let mut progress = self.progress.entry(user_id.to_string()).or_default();

        if let Some(changes) = progress.applied.get(source) {
            return Ok(AppliedCounters {
                changes: changes.clone(),
                replayed: true,
            });
        }

        let changes: Vec<CounterChange> = ops.iter().filter_map(|op| progress.apply(op)).collect();
        progress.applied.insert(source.to_string(), changes.clone());
        Ok(AppliedCounters {
            changes,
            replayed: false,
        })
    }

    async fn counter(&self, user_id: &str, requirement: &RequirementType) -> Result<u64> {
        Ok(self
            .progress
            .get(user_id)
            .and_then(|p| p.counts.get(requirement).copied())
            .unwrap_or(0))
    }
}

#[async_trait::async_trait]
impl AchievementBackend for MemoryStore {
    async fn user_badge(&self, user_id: &str, badge_key: &str) -> Result<Option<UserBadge>> {
        Ok(self
            .badges
            .get(user_id)
            .and_then(|rows| rows.get(badge_key).cloned()))
    }

    async fn user_badges(&self, user_id: &str) -> Result<Vec<UserBadge>> {
        let mut badges: Vec<UserBadge> = self
            .badges
            .get(user_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        badges.sort_by(|a, b| a.badge_key.cmp(&b.badge_key));
        Ok(badges)
    }

    async fn record_badge_progress(
        &self,
        user_id: &str,
        badge: &Badge,
        progress: u64,
        at: DateTime<Utc>,
    ) -> Result<BadgeUpdate> {
        let update = {
            let mut rows = self.badges.entry(user_id.to_string()).or_default();
            let row = rows.entry(badge.key.clone()).or_insert_with(|| UserBadge {
                user_id: user_id.to_string(),
                badge_key: badge.key.clone(),
                progress: 0,
                earned_at: None,
            });

            row.progress = row.progress.max(progress);
            let newly_earned = row.earned_at.is_none() && row.progress >= badge.requirement_count;
            if newly_earned {
                row.earned_at = Some(at);
            }
            BadgeUpdate {
                badge: row.clone(),
                newly_earned,
            }
        };

        if update.newly_earned {
            let mut ledger = self.users.entry(user_id.to_string()).or_default();
            let agg = ledger
                .aggregate
                .get_or_insert_with(|| UserAggregate::empty(user_id, week_start(at)));
            agg.badges_count += 1;
        }

        Ok(update)
    }

    async fn user_mission(
        &self,
        user_id: &str,
        mission_id: &str,
        cycle: &CycleKey,
    ) -> Result<Option<UserMission>> {
        Ok(self.missions.get(user_id).and_then(|rows| {
            rows.get(&(mission_id.to_string(), cycle.clone()))
                .map(|row| row.mission.clone())
        }))
    }

    async fn user_missions(&self, user_id: &str) -> Result<Vec<UserMission>> {
        let mut missions: Vec<UserMission> = self
            .missions
            .get(user_id)
            .map(|rows| rows.values().map(|row| row.mission.clone()).collect())
            .unwrap_or_default();
        missions.sort_by(|a, b| {
            (&a.mission_id, &a.cycle_key).cmp(&(&b.mission_id, &b.cycle_key))
        });
        Ok(missions)
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
        let mut rows = self.missions.entry(user_id.to_string()).or_default();
        let entry = rows
            .entry((mission.id.clone(), cycle.clone()))
            .or_insert_with(|| MissionRow {
                mission: UserMission::new(user_id, &mission.id, cycle.clone()),
                sources: HashSet::new(),
            });

        if entry.sources.contains(source) {
            return Ok(MissionUpdate {
                mission: entry.mission.clone(),
                newly_completed: false,
                replayed: true,
            });
        }

        let row = &mut entry.mission;
        if row.completed {
            return Ok(MissionUpdate {
                mission: row.clone(),
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
        let update = MissionUpdate {
            mission: row.clone(),
            newly_completed,
            replayed: false,
        };
        entry.sources.insert(source.to_string());
        Ok(update)
    }
}

#[async_trait::async_trait]
impl CacheBackend for MemoryStore {
    async fn save_leaderboard(&self, snapshot: CachedLeaderboard) -> Result<()> {
        let mut slot = self.leaderboard.write().await;
        *slot = Some(snapshot);
        Ok(())
    }

    async fn load_leaderboard(&self) -> Result<Option<CachedLeaderboard>> {
        Ok(self.leaderboard.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(user: &str, points: i64, dedupe: Option<&str>, at: DateTime<Utc>) -> PointEvent {
        PointEvent {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.to_string(),
            points,
            action_type: "review_created".into(),
            action_description: "Wrote a review".to_string(),
            dedupe_key: dedupe.map(str::to_string),
            reverses: None,
            created_at: at,
        }
    }

    fn saturday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_record_award_folds_aggregate() {
        let store = MemoryStore::new();
        store.record_award(event("u1", 10, None, saturday())).await.unwrap();
        let commit = store.record_award(event("u1", 5, None, saturday())).await.unwrap();

        assert!(!commit.duplicate);
        assert_eq!(commit.aggregate.total_points, 15);
        assert_eq!(commit.aggregate.weekly_points, 15);
        assert_eq!(store.event_count(), 2);
    }

    #[tokio::test]
    async fn test_dedupe_returns_existing() {
        let store = MemoryStore::new();
        let first = store
            .record_award(event("u1", 10, Some("review-123"), saturday()))
            .await
            .unwrap();
        let second = store
            .record_award(event("u1", 10, Some("review-123"), saturday()))
            .await
            .unwrap();

        assert!(second.duplicate);
        assert_eq!(second.event.id, first.event.id);
        assert_eq!(second.aggregate.total_points, 10);
        assert_eq!(store.event_count(), 1);

        // Same key, different user: independent
        let other = store
            .record_award(event("u2", 10, Some("review-123"), saturday()))
            .await
            .unwrap();
        assert!(!other.duplicate);
    }

    #[tokio::test]
    async fn test_week_rollover_recomputes_weekly() {
        let store = MemoryStore::new();
        store.record_award(event("u1", 40, None, saturday())).await.unwrap();

        let next_monday = Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap();
        let commit = store.record_award(event("u1", 7, None, next_monday)).await.unwrap();

        assert_eq!(commit.aggregate.total_points, 47);
        assert_eq!(commit.aggregate.weekly_points, 7);
        assert_eq!(commit.aggregate.week_start, week_start(next_monday));
    }

    #[tokio::test]
    async fn test_append_only_path_leaves_aggregate() {
        let store = MemoryStore::new();
        store.record_award(event("u1", 10, None, saturday())).await.unwrap();
        store.append_event(event("u1", 5, None, saturday())).await.unwrap();

        assert_eq!(store.aggregate("u1").await.unwrap().unwrap().total_points, 10);
        let repaired = store.reconcile_aggregate("u1", saturday()).await.unwrap();
        assert_eq!(repaired.total_points, 15);
        assert_eq!(repaired.weekly_points, 15);
    }

    #[tokio::test]
    async fn test_compare_and_set_level() {
        let store = MemoryStore::new();
        store.record_award(event("u1", 10, None, saturday())).await.unwrap();

        assert!(store.compare_and_set_level("u1", 0, 1).await.unwrap());
        assert!(!store.compare_and_set_level("u1", 0, 2).await.unwrap());
        assert_eq!(store.aggregate("u1").await.unwrap().unwrap().current_level, 1);
    }

    #[tokio::test]
    async fn test_distinct_counter() {
        let store = MemoryStore::new();
        let favorites = RequirementType::new("favorites");
        let fav = |entity: &str| [CounterOp::distinct(favorites.clone(), entity)];

        let first = store.apply_counters("u1", "e1", &fav("biz-1")).await.unwrap();
        assert_eq!((first.changes[0].previous, first.changes[0].current), (0, 1));
        assert!(store.apply_counters("u1", "e2", &fav("biz-1")).await.unwrap().changes.is_empty());
        let third = store.apply_counters("u1", "e3", &fav("biz-2")).await.unwrap();
        assert_eq!((third.changes[0].previous, third.changes[0].current), (1, 2));
        assert_eq!(store.counter("u1", &favorites).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_counters_apply_once_per_source() {
        let store = MemoryStore::new();
        let ops = [
            CounterOp::occurrence("reviews".into()),
            CounterOp::occurrence("contributions".into()),
        ];

        let first = store.apply_counters("u1", "event-1", &ops).await.unwrap();
        let again = store.apply_counters("u1", "event-1", &ops).await.unwrap();

        assert!(!first.replayed);
        assert!(again.replayed);
        assert_eq!(again.changes, first.changes);
        assert_eq!(store.counter("u1", &"reviews".into()).await.unwrap(), 1);

        let next = store.apply_counters("u1", "event-2", &ops).await.unwrap();
        assert_eq!((next.changes[0].previous, next.changes[0].current), (1, 2));
    }

    #[tokio::test]
    async fn test_mission_advances_once_per_source() {
        let store = MemoryStore::new();
        let mission: Mission = serde_yaml::from_str(
            "{ id: daily-review, title: Daily review, action_key: reviews, target_count: 2, points: 3, type: daily }",
        )
        .unwrap();
        let cycle = CycleKey::from_raw("2026-10-17");

        let first = store
            .advance_mission("u1", &mission, &cycle, "event-1", 1, saturday())
            .await
            .unwrap();
        let replay = store
            .advance_mission("u1", &mission, &cycle, "event-1", 1, saturday())
            .await
            .unwrap();
        let second = store
            .advance_mission("u1", &mission, &cycle, "event-2", 1, saturday())
            .await
            .unwrap();

        assert_eq!(first.mission.progress, 1);
        assert!(replay.replayed);
        assert_eq!(replay.mission.progress, 1);
        assert!(second.newly_completed);
        assert!(!second.replayed);
    }

    #[tokio::test]
    async fn test_badge_earned_once() {
        let store = MemoryStore::new();
        let badge = Badge {
            key: "first_review".to_string(),
            name: "First Review".to_string(),
            description: String::new(),
            requirement_type: "reviews".into(),
            requirement_count: 1,
            points_reward: 5,
            rarity: Default::default(),
        };

        let first = store.record_badge_progress("u1", &badge, 1, saturday()).await.unwrap();
        let again = store
            .record_badge_progress("u1", &badge, 3, saturday() + chrono::Duration::hours(1))
            .await
            .unwrap();
        let lower = store.record_badge_progress("u1", &badge, 2, saturday()).await.unwrap();

        assert!(first.newly_earned);
        assert!(!again.newly_earned);
        assert_eq!(again.badge.earned_at, Some(saturday()));
        assert_eq!(lower.badge.progress, 3);
        assert_eq!(store.aggregate("u1").await.unwrap().unwrap().badges_count, 1);
    }
}
