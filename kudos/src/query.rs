//! Query Facade: read-only projections for the UI layer.
//!
//! Points, levels and badge/mission state come from the transactional
//! aggregate and progress rows; rank positions come from the leaderboard
//! cache. Nothing here scans the full ledger.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::clock::{week_start, Clock};
use crate::leaderboard::Leaderboard;
use crate::store::{AchievementBackend, LedgerBackend};
use crate::types::{
    CycleKey, LeaderboardEntry, LeaderboardScope, Level, MissionType, PointEvent, Rarity,
    RequirementType, Result, UserAggregate,
};

/// Largest leaderboard page served.
pub const MAX_PAGE_SIZE: usize = 100;
/// Largest history page served.
pub const MAX_HISTORY: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    pub user_id: String,
    pub total_points: i64,
    pub weekly_points: i64,
    pub current_level: u32,
    pub level_name: String,
    pub next_level: Option<u32>,
    /// `None` at the top level
    pub points_to_next_level: Option<i64>,
    pub badges_count: u32,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// From the leaderboard cache; `None` until the user's row is cached
    pub rank_position: Option<usize>,
    pub weekly_rank_position: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BadgeProgress {
    pub key: String,
    pub name: String,
    pub description: String,
    pub rarity: Rarity,
    pub requirement_type: RequirementType,
    pub requirement_count: u64,
    pub points_reward: i64,
    pub progress: u64,
    pub earned: bool,
    pub earned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionProgress {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub mission_type: MissionType,
    pub cycle_key: CycleKey,
    pub target_count: u64,
    pub points: i64,
    pub progress: u64,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardPage {
    pub scope: LeaderboardScope,
    pub version: u64,
    pub limit: usize,
    pub offset: usize,
    pub entries: Vec<LeaderboardEntry>,
}

pub struct QueryFacade {
    catalog: Arc<Catalog>,
    ledger: Arc<dyn LedgerBackend>,
    achievements: Arc<dyn AchievementBackend>,
    leaderboard: Arc<Leaderboard>,
    clock: Arc<dyn Clock>,
}

impl QueryFacade {
    pub fn new(
        catalog: Arc<Catalog>,
        ledger: Arc<dyn LedgerBackend>,
        achievements: Arc<dyn AchievementBackend>,
        leaderboard: Arc<Leaderboard>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            achievements,
            leaderboard,
            clock,
        }
    }

    /// Points, level and rank for a user. Users with no activity read as
    /// zero points at the first level.
    pub async fn get_user_stats(&self, user_id: &str) -> Result<UserStats> {
        let now = self.clock.now();
        let agg = self
            .ledger
            .aggregate(user_id)
            .await?
            .unwrap_or_else(|| UserAggregate::empty(user_id, week_start(now)));

        let levels = self.catalog.levels();
        let level = levels
            .get(agg.current_level)
            .unwrap_or_else(|| levels.resolve(agg.total_points));
        let next = levels.next_after(level.level);
        let ranked = self.leaderboard.rank_of(user_id).await;

        Ok(UserStats {
            user_id: user_id.to_string(),
            total_points: agg.total_points,
            weekly_points: agg.weekly_points_in(week_start(now)),
            current_level: level.level,
            level_name: level.name.clone(),
            next_level: next.map(|l| l.level),
            points_to_next_level: next.map(|l| (l.min_points - agg.total_points).max(0)),
            badges_count: agg.badges_count,
            last_activity_at: agg.last_activity_at,
            rank_position: ranked.as_ref().map(|e| e.rank_position),
            weekly_rank_position: ranked.as_ref().map(|e| e.weekly_rank_position),
        })
    }

    /// Every badge in the catalog with the user's progress toward it.
    pub async fn get_user_badges(&self, user_id: &str) -> Result<Vec<BadgeProgress>> {
        let rows: HashMap<String, _> = self
            .achievements
            .user_badges(user_id)
            .await?
            .into_iter()
            .map(|b| (b.badge_key.clone(), b))
            .collect();

        Ok(self
            .catalog
            .badges()
            .iter()
            .map(|badge| {
                let row = rows.get(&badge.key);
                BadgeProgress {
                    key: badge.key.clone(),
                    name: badge.name.clone(),
                    description: badge.description.clone(),
                    rarity: badge.rarity,
                    requirement_type: badge.requirement_type.clone(),
                    requirement_count: badge.requirement_count,
                    points_reward: badge.points_reward,
                    progress: row.map_or(0, |r| r.progress),
                    earned: row.map_or(false, |r| r.is_earned()),
                    earned_at: row.and_then(|r| r.earned_at),
                }
            })
            .collect())
    }

    /// Active missions with the user's progress in the current cycle.
    pub async fn get_user_missions(&self, user_id: &str) -> Result<Vec<MissionProgress>> {
        let now = self.clock.now();
        let mut missions = Vec::new();

        for mission in self.catalog.missions().iter().filter(|m| m.active) {
            let cycle = mission.mission_type.cycle_key(now);
            let row = self
                .achievements
                .user_mission(user_id, &mission.id, &cycle)
                .await?;

            missions.push(MissionProgress {
                id: mission.id.clone(),
                title: mission.title.clone(),
                mission_type: mission.mission_type,
                cycle_key: cycle,
                target_count: mission.target_count,
                points: mission.points,
                progress: row.as_ref().map_or(0, |r| r.progress),
                completed: row.as_ref().map_or(false, |r| r.completed),
                completed_at: row.as_ref().and_then(|r| r.completed_at),
            });
        }

        Ok(missions)
    }

    /// A page of the cached leaderboard; `limit` is clamped to
    /// [`MAX_PAGE_SIZE`].
    pub async fn get_leaderboard(
        &self,
        scope: LeaderboardScope,
        limit: usize,
        offset: usize,
    ) -> Result<LeaderboardPage> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let entries = self.leaderboard.rank(scope, limit, offset).await;
        Ok(LeaderboardPage {
            scope,
            version: self.leaderboard.version().await,
            limit,
            offset,
            entries,
        })
    }

    /// Newest-first ledger events for a user.
    pub async fn get_point_history(&self, user_id: &str, limit: usize) -> Result<Vec<PointEvent>> {
        self.ledger
            .history(user_id, limit.clamp(1, MAX_HISTORY))
            .await
    }

    pub fn get_levels(&self) -> Vec<Level> {
        self.catalog.levels().levels().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LeaderboardConfig;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    const CATALOG: &str = r#"
levels:
  - { level: 1, min_points: 0, max_points: 99, name: Newcomer }
  - { level: 2, min_points: 100, name: Neighbor }
actions:
  - key: review_created
    points: 10
    counters: [{ requirement_type: reviews }]
badges:
  - { key: first_review, name: First Review, requirement_type: reviews, requirement_count: 1 }
  - { key: critic, name: Critic, requirement_type: reviews, requirement_count: 10 }
missions:
  - { id: daily-review, action_key: reviews, target_count: 1, type: daily }
  - { id: retired, action_key: reviews, target_count: 1, type: weekly, active: false }
"#;

    fn facade() -> (QueryFacade, Arc<MemoryStore>) {
        let catalog = Arc::new(Catalog::from_yaml(CATALOG).unwrap());
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap()));
        let leaderboard = Arc::new(Leaderboard::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            LeaderboardConfig::default(),
        ));
        let facade = QueryFacade::new(catalog, store.clone(), store.clone(), leaderboard, clock);
        (facade, store)
    }

    #[tokio::test]
    async fn test_unknown_user_reads_as_newcomer() {
        let (facade, _store) = facade();
        let stats = facade.get_user_stats("nobody").await.unwrap();
        assert_eq!(stats.total_points, 0);
        assert_eq!(stats.current_level, 1);
        assert_eq!(stats.level_name, "Newcomer");
        assert_eq!(stats.points_to_next_level, Some(100));
        assert!(stats.rank_position.is_none());
    }

    #[tokio::test]
    async fn test_badges_merge_definitions_and_progress() {
        let (facade, store) = facade();
        let critic = facade.catalog.badge("critic").unwrap().clone();
        store
            .record_badge_progress("u1", &critic, 4, Utc::now())
            .await
            .unwrap();

        let badges = facade.get_user_badges("u1").await.unwrap();
        assert_eq!(badges.len(), 2);
        let critic = badges.iter().find(|b| b.key == "critic").unwrap();
        assert_eq!(critic.progress, 4);
        assert!(!critic.earned);
        let first = badges.iter().find(|b| b.key == "first_review").unwrap();
        assert_eq!(first.progress, 0);
    }

    #[tokio::test]
    async fn test_missions_show_current_cycle_only() {
        let (facade, _store) = facade();
        let missions = facade.get_user_missions("u1").await.unwrap();
        assert_eq!(missions.len(), 1);
        assert_eq!(missions[0].id, "daily-review");
        assert_eq!(missions[0].cycle_key.as_str(), "2026-10-17");
        assert_eq!(missions[0].progress, 0);
    }

    #[tokio::test]
    async fn test_leaderboard_limit_clamped() {
        let (facade, _store) = facade();
        let page = facade
            .get_leaderboard(LeaderboardScope::Global, 10_000, 0)
            .await
            .unwrap();
        assert_eq!(page.limit, MAX_PAGE_SIZE);
        assert!(page.entries.is_empty());
    }
}
