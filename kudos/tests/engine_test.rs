//! End-to-end engine tests
//!
//! Drives the full award pipeline (ledger, progress, achievements, levels,
//! leaderboard) through the public engine API:
//! - Idempotent actions and bonus awards
//! - Level-up notifications under concurrency
//! - Mission cycles and weekly leaderboard resets
//! - Conflict retries and the repair queue
//! - Retries finishing runs cut short by storage faults
//! - SQLite persistence across restarts

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use kudos::config::{EngineConfig, LedgerConfig};
use kudos::store::{
    AchievementBackend, AppendResult, AppliedCounters, AwardCommit, BadgeUpdate, CacheBackend,
    CachedLeaderboard, CounterOp, LedgerBackend, MissionUpdate, ProgressBackend,
};
use kudos::{
    ActionRequest, AwardReceipt, AwardRequest, Badge, Catalog, ChannelNotifier, CycleKey,
    GamificationEngine, KudosError, LeaderboardScope, ManualClock, MemoryStore, Mission,
    Notification, PointEvent, RequirementType, Result, SqliteStore, UserAggregate, UserBadge,
    UserMission, BADGE_BONUS, MISSION_BONUS,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

const CATALOG: &str = r#"
levels:
  - { level: 1, min_points: 0, max_points: 99, name: Newcomer }
  - { level: 2, min_points: 100, max_points: 249, name: Neighbor }
  - { level: 3, min_points: 250, name: Local Hero }
actions:
  - key: review_created
    points: 10
    description: Wrote a review
    counters: [{ requirement_type: reviews }]
  - key: business_favorited
    points: 2
    counters: [{ requirement_type: favorites, distinct: true }]
badges:
  - { key: first_review, name: First Review, requirement_type: reviews, requirement_count: 1, points_reward: 5 }
  - { key: collector, name: Collector, requirement_type: favorites, requirement_count: 3, points_reward: 15 }
missions:
  - { id: daily-reviews, title: Two reviews a day, action_key: reviews, target_count: 2, points: 8, type: daily }
"#;

/// Saturday, 2026-10-17 12:00 UTC
fn saturday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap()
}

struct Harness {
    engine: Arc<GamificationEngine>,
    clock: Arc<ManualClock>,
    rx: UnboundedReceiver<Notification>,
}

impl Harness {
    fn level_ups(&mut self) -> Vec<(u32, u32)> {
        let mut moves = Vec::new();
        while let Ok(notification) = self.rx.try_recv() {
            if let Notification::LevelUp { from, to, .. } = notification {
                moves.push((from, to));
            }
        }
        moves
    }
}

fn harness_with<S: kudos::Store + 'static>(store: Arc<S>, config: EngineConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(saturday()));
    let (notifier, rx) = ChannelNotifier::new();
    let engine = GamificationEngine::builder(Catalog::from_yaml(CATALOG).unwrap())
        .config(config)
        .clock(clock.clone())
        .notifier(Arc::new(notifier))
        .build(store);
    Harness {
        engine: Arc::new(engine),
        clock,
        rx,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new()), EngineConfig::default())
}

// =============================================================================
// Idempotency
// =============================================================================

#[tokio::test]
async fn test_retried_action_counts_once() {
    let h = harness();
    let request = ActionRequest::new("alice", "review_created").with_dedupe_key("review-123");

    let first = h.engine.record_action(request.clone()).await.unwrap();
    let second = h.engine.record_action(request.clone()).await.unwrap();
    let third = h.engine.record_action(request).await.unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate && third.duplicate);
    let original_id = first.event.as_ref().unwrap().id.clone();
    assert_eq!(second.event.unwrap().id, original_id);

    let history = h.engine.query().get_point_history("alice", 50).await.unwrap();
    let dedupe_keys: Vec<_> = history.iter().map(|e| e.dedupe_key.clone()).collect();
    assert_eq!(history.len(), 2);
    assert!(dedupe_keys.contains(&Some("review-123".to_string())));
    assert!(dedupe_keys.contains(&Some("badge:first_review".to_string())));

    let stats = h.engine.query().get_user_stats("alice").await.unwrap();
    assert_eq!(stats.total_points, 15);
    assert_eq!(stats.badges_count, 1);
}

#[tokio::test]
async fn test_distinct_favorites_unlock_badge() {
    let h = harness();
    for business in ["biz-1", "biz-2", "biz-2", "biz-3"] {
        h.engine
            .record_action(ActionRequest::new("bob", "business_favorited").with_entity(business))
            .await
            .unwrap();
    }

    let badges = h.engine.query().get_user_badges("bob").await.unwrap();
    let collector = badges.iter().find(|b| b.key == "collector").unwrap();
    assert!(collector.earned);
    assert_eq!(collector.progress, 3);

    // 4 favorites at 2 points, plus the badge reward
    let stats = h.engine.query().get_user_stats("bob").await.unwrap();
    assert_eq!(stats.total_points, 4 * 2 + 15);
}

// =============================================================================
// Levels
// =============================================================================

#[tokio::test]
async fn test_single_level_up_notification() {
    let mut h = harness();
    h.engine
        .award_points(AwardRequest::new("carol", "import", 95))
        .await
        .unwrap();
    assert!(h.level_ups().is_empty());

    h.engine
        .record_action(ActionRequest::new("carol", "review_created"))
        .await
        .unwrap();

    assert_eq!(h.level_ups(), vec![(1, 2)]);
    let stats = h.engine.query().get_user_stats("carol").await.unwrap();
    assert_eq!(stats.current_level, 2);
    assert_eq!(stats.level_name, "Neighbor");
    assert_eq!(stats.points_to_next_level, Some(250 - stats.total_points));
}

#[tokio::test]
async fn test_concurrent_awards_notify_once() {
    let mut h = harness();
    let awards = (0..20).map(|i| {
        let engine = h.engine.clone();
        async move {
            engine
                .award_points(
                    AwardRequest::new("dave", "import", 10).with_dedupe_key(format!("batch-{}", i)),
                )
                .await
        }
    });
    let results = futures::future::join_all(awards).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let stats = h.engine.query().get_user_stats("dave").await.unwrap();
    assert_eq!(stats.total_points, 200);
    assert_eq!(stats.current_level, 2);
    assert_eq!(h.level_ups(), vec![(1, 2)]);
}

#[tokio::test]
async fn test_reversal_lowers_level_silently() {
    let mut h = harness();
    let outcome = h
        .engine
        .award_points(AwardRequest::new("erin", "import", 120))
        .await
        .unwrap();
    assert_eq!(h.level_ups(), vec![(1, 2)]);

    let event_id = outcome.event.unwrap().id;
    let receipt = h.engine.reverse(&event_id, None).await.unwrap();
    assert_eq!(receipt.event().points, -120);
    assert!(h.level_ups().is_empty());

    let again = h.engine.reverse(&event_id, None).await.unwrap();
    assert!(matches!(again, AwardReceipt::Duplicate(_)));

    let stats = h.engine.query().get_user_stats("erin").await.unwrap();
    assert_eq!(stats.total_points, 0);
    assert_eq!(stats.current_level, 1);
}

#[tokio::test]
async fn test_negative_award_rejected() {
    let h = harness();
    let err = h
        .engine
        .award_points(AwardRequest::new("erin", "import", -5))
        .await
        .unwrap_err();
    assert!(matches!(err, KudosError::InvalidRequest(_)));
}

// =============================================================================
// Missions and weekly resets
// =============================================================================

#[tokio::test]
async fn test_daily_mission_cycles_do_not_mix() {
    let h = harness();
    let review = || ActionRequest::new("frank", "review_created");

    h.engine.record_action(review()).await.unwrap();
    h.clock.advance(Duration::days(1));
    let sunday_first = h.engine.record_action(review()).await.unwrap();
    assert!(sunday_first.evaluation.newly_completed_missions.is_empty());

    let sunday_second = h.engine.record_action(review()).await.unwrap();
    let completed = &sunday_second.evaluation.newly_completed_missions;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].cycle_key, CycleKey::from_raw("2026-10-18"));

    let missions = h.engine.query().get_user_missions("frank").await.unwrap();
    assert!(missions[0].completed);
    assert_eq!(missions[0].progress, 2);

    // A third review the same day does not pay the mission twice
    let sunday_third = h.engine.record_action(review()).await.unwrap();
    assert!(sunday_third.evaluation.newly_completed_missions.is_empty());
    let mission_bonuses = h
        .engine
        .query()
        .get_point_history("frank", 50)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.dedupe_key.as_deref() == Some("mission:daily-reviews:2026-10-18"))
        .count();
    assert_eq!(mission_bonuses, 1);
}

#[tokio::test]
async fn test_weekly_leaderboard_resets_on_monday() {
    let h = harness();
    h.engine.award_points(AwardRequest::new("gina", "import", 50)).await.unwrap();
    h.clock.advance(Duration::minutes(1));
    h.engine.award_points(AwardRequest::new("hank", "import", 30)).await.unwrap();
    h.engine.rebuild().await.unwrap();

    let weekly = h.engine.query().get_leaderboard(LeaderboardScope::Weekly, 10, 0).await.unwrap();
    assert_eq!(weekly.entries[0].user_id, "gina");

    // Monday 2026-10-19
    h.clock.set(Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap());
    h.engine.award_points(AwardRequest::new("hank", "import", 5)).await.unwrap();
    let version = h.engine.rebuild().await.unwrap();

    let weekly = h.engine.query().get_leaderboard(LeaderboardScope::Weekly, 10, 0).await.unwrap();
    assert_eq!(weekly.version, version);
    assert_eq!(weekly.entries[0].user_id, "hank");
    assert_eq!(weekly.entries[0].weekly_points, 5);
    assert_eq!(weekly.entries[1].weekly_points, 0);

    let global = h.engine.query().get_leaderboard(LeaderboardScope::Global, 10, 0).await.unwrap();
    assert_eq!(global.entries[0].user_id, "gina");
    assert_eq!(global.entries[1].total_points, 35);

    let gina = h.engine.query().get_user_stats("gina").await.unwrap();
    assert_eq!(gina.weekly_points, 0);
    assert_eq!(gina.total_points, 50);
}

#[tokio::test]
async fn test_ties_ranked_by_earliest_activity() {
    let h = harness();
    h.engine.award_points(AwardRequest::new("zed", "import", 40)).await.unwrap();
    h.clock.advance(Duration::seconds(30));
    h.engine.award_points(AwardRequest::new("amy", "import", 40)).await.unwrap();
    h.engine.rebuild().await.unwrap();

    let page = h.engine.query().get_leaderboard(LeaderboardScope::Global, 10, 0).await.unwrap();
    let order: Vec<_> = page.entries.iter().map(|e| e.user_id.as_str()).collect();
    assert_eq!(order, vec!["zed", "amy"]);
    assert_eq!(page.entries[1].rank_position, 2);
}

#[tokio::test]
async fn test_flush_shows_activity_before_rebuild() {
    let h = harness();
    h.engine.rebuild().await.unwrap();
    h.engine.award_points(AwardRequest::new("ivy", "import", 10)).await.unwrap();
    assert!(h.engine.query().get_user_stats("ivy").await.unwrap().rank_position.is_none());

    assert_eq!(h.engine.flush_leaderboard().await.unwrap(), 1);
    let stats = h.engine.query().get_user_stats("ivy").await.unwrap();
    assert_eq!(stats.rank_position, Some(1));
}

// =============================================================================
// Conflicts and repair
// =============================================================================

/// Memory store with injectable faults. Each counter is the number of
/// upcoming calls of that kind that fail.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    /// `record_award` conflicts
    conflicts_left: AtomicU32,
    /// `record_award` storage errors for mission bonus events
    mission_bonus_failures: AtomicU32,
    counter_failures: AtomicU32,
    badge_failures: AtomicU32,
    cache_failures: AtomicU32,
}

impl FaultyStore {
    fn contended(conflicts: u32) -> Self {
        Self {
            conflicts_left: AtomicU32::new(conflicts),
            ..Self::default()
        }
    }
}

/// Consume one pending fault, if any.
fn trip(faults: &AtomicU32) -> bool {
    faults
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn storage_fault(what: &str) -> KudosError {
    KudosError::Storage(format!("{} unavailable", what))
}

#[async_trait]
impl LedgerBackend for FaultyStore {
    async fn record_award(&self, event: PointEvent) -> Result<AwardCommit> {
        if trip(&self.conflicts_left) {
            return Err(KudosError::Conflict("aggregate row busy".to_string()));
        }
        if event.action_type.as_str() == MISSION_BONUS && trip(&self.mission_bonus_failures) {
            return Err(storage_fault("point_events"));
        }
        self.inner.record_award(event).await
    }

    async fn append_event(&self, event: PointEvent) -> Result<AppendResult> {
        self.inner.append_event(event).await
    }

    async fn event(&self, id: &str) -> Result<Option<PointEvent>> {
        self.inner.event(id).await
    }

    async fn history(&self, user_id: &str, limit: usize) -> Result<Vec<PointEvent>> {
        self.inner.history(user_id, limit).await
    }

    async fn aggregate(&self, user_id: &str) -> Result<Option<UserAggregate>> {
        self.inner.aggregate(user_id).await
    }

    async fn aggregates(&self) -> Result<Vec<UserAggregate>> {
        self.inner.aggregates().await
    }

    async fn compare_and_set_level(&self, user_id: &str, expected: u32, level: u32) -> Result<bool> {
        self.inner.compare_and_set_level(user_id, expected, level).await
    }

    async fn reconcile_aggregate(&self, user_id: &str, now: DateTime<Utc>) -> Result<UserAggregate> {
        self.inner.reconcile_aggregate(user_id, now).await
    }

    async fn totals_since(&self, since: DateTime<Utc>) -> Result<HashMap<String, i64>> {
        self.inner.totals_since(since).await
    }
}

#[async_trait]
impl ProgressBackend for FaultyStore {
    async fn apply_counters(
        &self,
        user_id: &str,
        source: &str,
        ops: &[CounterOp],
    ) -> Result<AppliedCounters> {
        if trip(&self.counter_failures) {
            return Err(storage_fault("progress_counters"));
        }
        self.inner.apply_counters(user_id, source, ops).await
    }

    async fn counter(&self, user_id: &str, requirement: &RequirementType) -> Result<u64> {
        self.inner.counter(user_id, requirement).await
    }
}

#[async_trait]
impl AchievementBackend for FaultyStore {
    async fn user_badge(&self, user_id: &str, badge_key: &str) -> Result<Option<UserBadge>> {
        self.inner.user_badge(user_id, badge_key).await
    }

    async fn user_badges(&self, user_id: &str) -> Result<Vec<UserBadge>> {
        self.inner.user_badges(user_id).await
    }

    async fn record_badge_progress(
        &self,
        user_id: &str,
        badge: &Badge,
        progress: u64,
        at: DateTime<Utc>,
    ) -> Result<BadgeUpdate> {
        if trip(&self.badge_failures) {
            return Err(storage_fault("user_badges"));
        }
        self.inner.record_badge_progress(user_id, badge, progress, at).await
    }

    async fn user_mission(
        &self,
        user_id: &str,
        mission_id: &str,
        cycle: &CycleKey,
    ) -> Result<Option<UserMission>> {
        self.inner.user_mission(user_id, mission_id, cycle).await
    }

    async fn user_missions(&self, user_id: &str) -> Result<Vec<UserMission>> {
        self.inner.user_missions(user_id).await
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
        self.inner
            .advance_mission(user_id, mission, cycle, source, increment, at)
            .await
    }
}

#[async_trait]
impl CacheBackend for FaultyStore {
    async fn save_leaderboard(&self, snapshot: CachedLeaderboard) -> Result<()> {
        if trip(&self.cache_failures) {
            return Err(storage_fault("leaderboard_cache"));
        }
        self.inner.save_leaderboard(snapshot).await
    }

    async fn load_leaderboard(&self) -> Result<Option<CachedLeaderboard>> {
        self.inner.load_leaderboard().await
    }
}

fn fast_retries(max_attempts: u32) -> EngineConfig {
    EngineConfig {
        ledger: LedgerConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
            ..LedgerConfig::default()
        },
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn test_conflicts_retried_then_committed() {
    let h = harness_with(Arc::new(FaultyStore::contended(2)), fast_retries(3));
    h.engine.award_points(AwardRequest::new("jo", "import", 20)).await.unwrap();

    let stats = h.engine.stats().await;
    assert_eq!(stats.ledger.conflict_retries, 2);
    assert_eq!(stats.pending_repairs, 0);
    assert_eq!(h.engine.query().get_user_stats("jo").await.unwrap().total_points, 20);
}

#[tokio::test]
async fn test_exhausted_retries_queue_repair() {
    let h = harness_with(Arc::new(FaultyStore::contended(u32::MAX)), fast_retries(3));
    let outcome = h
        .engine
        .award_points(AwardRequest::new("kim", "import", 120))
        .await
        .unwrap();

    // The event is in the ledger even though the aggregate missed it
    assert!(outcome.event.is_some());
    assert_eq!(h.engine.ledger().pending_repairs(), vec!["kim".to_string()]);
    assert!(h.engine.ledger().aggregate("kim").await.unwrap().is_none());

    h.engine.rebuild().await.unwrap();

    assert!(h.engine.ledger().pending_repairs().is_empty());
    let stats = h.engine.query().get_user_stats("kim").await.unwrap();
    assert_eq!(stats.total_points, 120);
    assert_eq!(stats.current_level, 2);
    assert_eq!(stats.rank_position, Some(1));
}

// =============================================================================
// Interrupted runs
// =============================================================================

#[tokio::test]
async fn test_retry_finishes_counters_after_progress_fault() {
    let store = Arc::new(FaultyStore::default());
    store.counter_failures.store(1, Ordering::SeqCst);
    let h = harness_with(store.clone(), EngineConfig::default());
    let request = ActionRequest::new("alice", "review_created").with_dedupe_key("review-123");

    let err = h.engine.record_action(request.clone()).await.unwrap_err();
    assert!(matches!(err, KudosError::Storage(_)));
    // The ledger write landed before the fault
    assert_eq!(h.engine.query().get_user_stats("alice").await.unwrap().total_points, 10);

    let retry = h.engine.record_action(request.clone()).await.unwrap();
    assert!(retry.duplicate);
    assert_eq!(retry.counters.len(), 1);
    assert_eq!(retry.evaluation.newly_earned_badges[0].key, "first_review");

    let again = h.engine.record_action(request).await.unwrap();
    assert!(again.duplicate);
    assert!(again.counters.is_empty());
    assert!(again.evaluation.newly_earned_badges.is_empty());

    let reviews = RequirementType::new("reviews");
    assert_eq!(store.counter("alice", &reviews).await.unwrap(), 1);
    let badges = h.engine.query().get_user_badges("alice").await.unwrap();
    assert!(badges.iter().any(|b| b.key == "first_review" && b.earned));
    let stats = h.engine.query().get_user_stats("alice").await.unwrap();
    assert_eq!(stats.total_points, 15);
    assert_eq!(stats.badges_count, 1);
}

#[tokio::test]
async fn test_retry_marks_badge_after_unlock_fault() {
    let store = Arc::new(FaultyStore::default());
    store.badge_failures.store(1, Ordering::SeqCst);
    let h = harness_with(store.clone(), EngineConfig::default());
    let request = ActionRequest::new("bea", "review_created").with_dedupe_key("review-7");

    // Bonus paid, unlock mark lost
    assert!(h.engine.record_action(request.clone()).await.is_err());

    let retry = h.engine.record_action(request.clone()).await.unwrap();
    assert!(retry.duplicate);
    assert_eq!(retry.evaluation.newly_earned_badges[0].key, "first_review");
    assert!(retry.evaluation.bonus_events.is_empty());

    h.engine.record_action(request).await.unwrap();
    let reviews = RequirementType::new("reviews");
    assert_eq!(store.counter("bea", &reviews).await.unwrap(), 1);
    let missions = h.engine.query().get_user_missions("bea").await.unwrap();
    assert_eq!(missions[0].progress, 1);

    let stats = h.engine.query().get_user_stats("bea").await.unwrap();
    assert_eq!(stats.total_points, 15);
    assert_eq!(stats.badges_count, 1);
}

#[tokio::test]
async fn test_retry_pays_mission_bonus_after_fault() {
    let store = Arc::new(FaultyStore::default());
    let mut h = harness_with(store.clone(), EngineConfig::default());
    h.engine
        .record_action(ActionRequest::new("cal", "review_created").with_dedupe_key("review-1"))
        .await
        .unwrap();

    store.mission_bonus_failures.store(1, Ordering::SeqCst);
    let second = ActionRequest::new("cal", "review_created").with_dedupe_key("review-2");
    assert!(h.engine.record_action(second.clone()).await.is_err());

    let retry = h.engine.record_action(second.clone()).await.unwrap();
    assert!(retry.duplicate);
    let completed = &retry.evaluation.newly_completed_missions;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].mission.id, "daily-reviews");
    assert_eq!(retry.evaluation.bonus_events[0].action_type.as_str(), MISSION_BONUS);

    let again = h.engine.record_action(second).await.unwrap();
    assert!(again.evaluation.newly_completed_missions.is_empty());

    let missions = h.engine.query().get_user_missions("cal").await.unwrap();
    assert_eq!(missions[0].progress, 2);
    // Two reviews, the badge reward and one mission bonus
    let stats = h.engine.query().get_user_stats("cal").await.unwrap();
    assert_eq!(stats.total_points, 2 * 10 + 5 + 8);

    let completions = std::iter::from_fn(|| h.rx.try_recv().ok())
        .filter(|n| matches!(n, Notification::MissionCompleted { .. }))
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn test_initialize_survives_failed_rebuild() {
    let store = Arc::new(FaultyStore::default());
    store.cache_failures.store(1, Ordering::SeqCst);
    let h = harness_with(store, EngineConfig::default());
    h.engine.award_points(AwardRequest::new("dot", "import", 10)).await.unwrap();

    assert_eq!(h.engine.initialize().await, 0);
    let stats = h.engine.stats().await;
    assert_eq!(stats.leaderboard.rebuild_failures, 1);
    assert!(stats.leaderboard.last_rebuild_error.is_some());

    // The next scheduled rebuild recovers
    assert_eq!(h.engine.rebuild().await.unwrap(), 1);
}

// =============================================================================
// SQLite persistence
// =============================================================================

#[tokio::test]
async fn test_sqlite_engine_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("kudos.db");

    let version = {
        let h = harness_with(Arc::new(SqliteStore::open(&path).unwrap()), EngineConfig::default());
        h.engine
            .record_action(ActionRequest::new("lee", "review_created").with_dedupe_key("review-9"))
            .await
            .unwrap();
        h.engine.initialize().await
    };

    let h = harness_with(Arc::new(SqliteStore::open(&path).unwrap()), EngineConfig::default());
    let warmed = h.engine.leaderboard().warm_from_cache().await.unwrap();
    assert_eq!(warmed, Some(version));

    let stats = h.engine.query().get_user_stats("lee").await.unwrap();
    assert_eq!(stats.total_points, 15);
    assert_eq!(stats.rank_position, Some(1));

    // The dedupe key is still honoured after the restart
    let retry = h
        .engine
        .record_action(ActionRequest::new("lee", "review_created").with_dedupe_key("review-9"))
        .await
        .unwrap();
    assert!(retry.duplicate);

    let badges = h.engine.query().get_user_badges("lee").await.unwrap();
    assert!(badges.iter().any(|b| b.key == "first_review" && b.earned));
    let bonus = h
        .engine
        .query()
        .get_point_history("lee", 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.action_type.as_str() == BADGE_BONUS)
        .count();
    assert_eq!(bonus, 1);
}
