//! The engine wires the components into the award pipeline:
//!
//! ```text
//! action ──► LedgerStore::award_points ──► event (new or duplicate)
//!        ──► ProgressTracker::record_action(source = event id) ──► [CounterDelta]
//!        ──► AchievementEvaluator::evaluate ──► bonus awards
//!        ──► Leaderboard::touch
//! ```
//!
//! Every step after the ledger write is keyed by the event id, so a retry
//! that hits a duplicate runs the rest of the pipeline again and finishes
//! whatever an interrupted first run left undone, without counting twice.
//!
//! Level settlement happens inside every ledger write, bonus awards included.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::achievements::{AchievementEvaluator, Evaluation};
use crate::catalog::Catalog;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::leaderboard::{Leaderboard, LeaderboardStats};
use crate::ledger::{LedgerStatsSnapshot, LedgerStore};
use crate::notify::{Notifier, TracingNotifier};
use crate::progress::{ActionMetadata, ProgressStatsSnapshot, ProgressTracker, TrackedAction};
use crate::query::QueryFacade;
use crate::store::{AchievementBackend, CacheBackend, LedgerBackend, ProgressBackend, Store};
use crate::types::{
    ActionKey, AwardReceipt, AwardRequest, CounterDelta, KudosError, PointEvent, Result,
};

/// A raw user action entering the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub user_id: String,
    pub action_key: ActionKey,
    /// Entity the action targeted (business, review, poll...)
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Idempotency token, usually derived from the entity id
    #[serde(default)]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ActionRequest {
    pub fn new(user_id: impl Into<String>, action_key: impl Into<ActionKey>) -> Self {
        Self {
            user_id: user_id.into(),
            action_key: action_key.into(),
            entity_id: None,
            dedupe_key: None,
            description: None,
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Everything one pipeline run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    /// The ledger event for the action itself, if one was written or matched
    pub event: Option<PointEvent>,
    /// The action was a retry of one already recorded
    pub duplicate: bool,
    pub counters: Vec<CounterDelta>,
    #[serde(flatten)]
    pub evaluation: Evaluation,
    /// Points were kept but no counter rule matched the action type
    pub unmapped: bool,
}

impl ActionOutcome {
    fn duplicate(event: PointEvent) -> Self {
        Self {
            event: Some(event),
            duplicate: true,
            counters: Vec::new(),
            evaluation: Evaluation::default(),
            unmapped: false,
        }
    }
}

/// Deltas worth reporting: a replayed source already reported its own.
fn fresh_counters(tracked: TrackedAction) -> Vec<CounterDelta> {
    if tracked.replayed {
        Vec::new()
    } else {
        tracked.deltas
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub ledger: LedgerStatsSnapshot,
    pub progress: ProgressStatsSnapshot,
    pub leaderboard: LeaderboardStats,
    pub pending_repairs: usize,
}

/// The gamification engine.
pub struct GamificationEngine {
    catalog: Arc<Catalog>,
    config: EngineConfig,
    ledger: Arc<LedgerStore>,
    progress: ProgressTracker,
    achievements: AchievementEvaluator,
    leaderboard: Arc<Leaderboard>,
    query: QueryFacade,
    clock: Arc<dyn Clock>,
}

impl GamificationEngine {
    pub fn builder(catalog: Catalog) -> EngineBuilder {
        EngineBuilder::new(catalog)
    }

    /// Run an action through the full pipeline.
    ///
    /// Retrying with the same dedupe key returns the original event and
    /// does not count the action again.
    pub async fn record_action(&self, request: ActionRequest) -> Result<ActionOutcome> {
        if request.user_id.trim().is_empty() {
            return Err(KudosError::InvalidRequest("user_id is required".to_string()));
        }
        if request.action_key.is_reserved() {
            return Err(KudosError::InvalidRequest(format!(
                "action key '{}' is reserved",
                request.action_key
            )));
        }
        let rule = self.progress.rule(&request.action_key)?;

        // Zero-point actions only reach the ledger when they need a dedupe marker
        let (event, duplicate) = if rule.points > 0 || request.dedupe_key.is_some() {
            let mut award = AwardRequest::new(&request.user_id, request.action_key.clone(), rule.points);
            award.description = request.description.clone();
            award.dedupe_key = request.dedupe_key.clone();
            match self.ledger.award_points(award).await? {
                AwardReceipt::Duplicate(existing) => {
                    if !self.replayable(&existing) {
                        return Ok(ActionOutcome::duplicate(existing));
                    }
                    (Some(existing), true)
                }
                AwardReceipt::Recorded(event) => (Some(event), false),
            }
        } else {
            (None, false)
        };

        let (source, action_key, occurred_at) = match &event {
            Some(e) => (e.id.clone(), e.action_type.clone(), e.created_at),
            None => (
                uuid::Uuid::new_v4().to_string(),
                request.action_key.clone(),
                self.clock.now(),
            ),
        };
        let metadata = ActionMetadata {
            entity_id: request.entity_id,
            occurred_at,
        };

        let (tracked, evaluation) = self
            .track(&request.user_id, &source, &action_key, &metadata)
            .await?;
        self.leaderboard.touch(&request.user_id);

        debug!(
            user_id = %request.user_id,
            action_key = %action_key,
            counters = tracked.deltas.len(),
            duplicate,
            "Action processed"
        );

        Ok(ActionOutcome {
            event,
            duplicate,
            counters: fresh_counters(tracked),
            evaluation,
            unmapped: false,
        })
    }

    /// Award an explicit amount of points.
    ///
    /// Action types with a counter rule also advance progress. Types without
    /// one keep their points and are reported as `unmapped`.
    pub async fn award_points(&self, request: AwardRequest) -> Result<ActionOutcome> {
        let user_id = request.user_id.clone();

        let (event, duplicate) = match self.ledger.award_points(request).await? {
            AwardReceipt::Duplicate(existing) => {
                if !self.replayable(&existing) {
                    return Ok(ActionOutcome::duplicate(existing));
                }
                (existing, true)
            }
            AwardReceipt::Recorded(event) => (event, false),
        };

        let mut outcome = ActionOutcome {
            event: None,
            duplicate,
            counters: Vec::new(),
            evaluation: Evaluation::default(),
            unmapped: false,
        };

        let action_type = event.action_type.clone();
        let metadata = ActionMetadata::at(event.created_at);
        match self.track(&user_id, &event.id, &action_type, &metadata).await {
            Ok((tracked, evaluation)) => {
                outcome.evaluation = evaluation;
                outcome.counters = fresh_counters(tracked);
            }
            Err(KudosError::Configuration(reason)) => {
                warn!(
                    user_id = %user_id,
                    action_type = %action_type,
                    reason = %reason,
                    "Points kept, counter update dropped"
                );
                outcome.unmapped = true;
            }
            Err(e) => return Err(e),
        }

        self.leaderboard.touch(&user_id);
        outcome.event = Some(event);
        Ok(outcome)
    }

    /// Counters then achievements for one source.
    async fn track(
        &self,
        user_id: &str,
        source: &str,
        action_key: &ActionKey,
        metadata: &ActionMetadata,
    ) -> Result<(TrackedAction, Evaluation)> {
        let tracked = self
            .progress
            .record_action(user_id, source, action_key, metadata)
            .await?;
        let evaluation = self
            .achievements
            .evaluate(user_id, source, &tracked.deltas)
            .await?;
        Ok((tracked, evaluation))
    }

    /// A duplicate is worth replaying only if its action feeds counters.
    fn replayable(&self, event: &PointEvent) -> bool {
        !event.action_type.is_reserved() && self.catalog.action(&event.action_type).is_some()
    }

    /// Compensate a ledger event.
    pub async fn reverse(&self, event_id: &str, reason: Option<String>) -> Result<AwardReceipt> {
        let receipt = self.ledger.reverse(event_id, reason).await?;
        self.leaderboard.touch(&receipt.event().user_id);
        Ok(receipt)
    }

    /// Repair queued aggregates, then rebuild the leaderboard.
    pub async fn rebuild(&self) -> Result<u64> {
        let repaired = self.ledger.repair_pending().await?;
        if repaired > 0 {
            info!(repaired, "Repaired aggregates before rebuild");
        }
        self.leaderboard.rebuild().await
    }

    pub async fn flush_leaderboard(&self) -> Result<usize> {
        self.leaderboard.flush_dirty().await
    }

    /// Serve the last persisted leaderboard, then rebuild from the store.
    ///
    /// A failed rebuild is logged and the warmed (or empty) version keeps
    /// serving until the next scheduled rebuild. Returns the version served.
    pub async fn initialize(&self) -> u64 {
        match self.leaderboard.warm_from_cache().await {
            Ok(Some(version)) => debug!(version, "Leaderboard cache loaded"),
            Ok(None) => debug!("No persisted leaderboard"),
            Err(e) => warn!(error = %e, "Could not load persisted leaderboard"),
        }
        match self.rebuild().await {
            Ok(version) => version,
            Err(e) => {
                warn!(error = %e, "Initial leaderboard rebuild failed, serving last known version");
                self.leaderboard.version().await
            }
        }
    }

    pub fn query(&self) -> &QueryFacade {
        &self.query
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn leaderboard(&self) -> &Leaderboard {
        &self.leaderboard
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            ledger: self.ledger.stats(),
            progress: self.progress.stats(),
            leaderboard: self.leaderboard.stats().await,
            pending_repairs: self.ledger.pending_repairs().len(),
        }
    }
}

/// Builder for [`GamificationEngine`].
pub struct EngineBuilder {
    catalog: Catalog,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
}

impl EngineBuilder {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Build the engine over `store`.
    pub fn build<S: Store + 'static>(self, store: Arc<S>) -> GamificationEngine {
        let ledger_backend: Arc<dyn LedgerBackend> = store.clone();
        let progress_backend: Arc<dyn ProgressBackend> = store.clone();
        let achievement_backend: Arc<dyn AchievementBackend> = store.clone();
        let cache_backend: Arc<dyn CacheBackend> = store;

        let catalog = Arc::new(self.catalog);
        let notify_timeout =
            std::time::Duration::from_millis(self.config.notifications.delivery_timeout_ms);

        let ledger = Arc::new(LedgerStore::new(
            ledger_backend.clone(),
            catalog.clone(),
            self.notifier.clone(),
            self.clock.clone(),
            self.config.ledger.clone(),
            notify_timeout,
        ));
        let progress = ProgressTracker::new(catalog.clone(), progress_backend);
        let achievements = AchievementEvaluator::new(
            catalog.clone(),
            achievement_backend.clone(),
            ledger.clone(),
            self.notifier,
            notify_timeout,
        );
        let leaderboard = Arc::new(Leaderboard::new(
            ledger_backend.clone(),
            cache_backend,
            self.clock.clone(),
            self.config.leaderboard.clone(),
        ));
        let query = QueryFacade::new(
            catalog.clone(),
            ledger_backend,
            achievement_backend,
            leaderboard.clone(),
            self.clock.clone(),
        );

        info!(
            levels = catalog.levels().levels().len(),
            badges = catalog.badges().len(),
            missions = catalog.missions().len(),
            "Gamification engine built"
        );

        GamificationEngine {
            catalog,
            config: self.config,
            ledger,
            progress,
            achievements,
            leaderboard,
            query,
            clock: self.clock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::BADGE_BONUS;
    use chrono::{TimeZone, Utc};

    const CATALOG: &str = r#"
levels:
  - { level: 1, min_points: 0, max_points: 99, name: Newcomer }
  - { level: 2, min_points: 100, name: Neighbor }
actions:
  - key: review_created
    points: 10
    description: Wrote a review
    counters: [{ requirement_type: reviews }]
  - key: poll_answered
    points: 0
    counters: [{ requirement_type: polls }]
badges:
  - { key: first_review, name: First Review, requirement_type: reviews, requirement_count: 1, points_reward: 5 }
  - { key: pollster, name: Pollster, requirement_type: polls, requirement_count: 2, points_reward: 20 }
"#;

    fn engine() -> GamificationEngine {
        GamificationEngine::builder(Catalog::from_yaml(CATALOG).unwrap())
            .clock(Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap(),
            )))
            .build(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_action_retries_count_once() {
        let engine = engine();
        let request = ActionRequest::new("u1", "review_created").with_dedupe_key("review-123");

        let first = engine.record_action(request.clone()).await.unwrap();
        let retry = engine.record_action(request).await.unwrap();

        assert!(!first.duplicate);
        assert_eq!(first.counters.len(), 1);
        assert_eq!(first.evaluation.newly_earned_badges.len(), 1);
        assert!(retry.duplicate);
        assert!(retry.counters.is_empty());

        let stats = engine.query().get_user_stats("u1").await.unwrap();
        assert_eq!(stats.total_points, 15);
    }

    #[tokio::test]
    async fn test_zero_point_action_still_counts() {
        let engine = engine();
        engine.record_action(ActionRequest::new("u1", "poll_answered")).await.unwrap();
        let second = engine.record_action(ActionRequest::new("u1", "poll_answered")).await.unwrap();

        assert!(second.event.is_none());
        assert_eq!(second.evaluation.newly_earned_badges[0].key, "pollster");
        let bonus = &second.evaluation.bonus_events[0];
        assert_eq!(bonus.action_type.as_str(), BADGE_BONUS);
        assert_eq!(engine.query().get_user_stats("u1").await.unwrap().total_points, 20);
    }

    #[tokio::test]
    async fn test_unknown_action_rejected() {
        let engine = engine();
        let err = engine
            .record_action(ActionRequest::new("u1", "listing_deleted"))
            .await
            .unwrap_err();
        assert!(matches!(err, KudosError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unmapped_award_keeps_points() {
        let engine = engine();
        let outcome = engine
            .award_points(AwardRequest::new("u1", "admin_grant", 40))
            .await
            .unwrap();
        assert!(outcome.unmapped);
        assert_eq!(outcome.event.unwrap().points, 40);
        assert_eq!(engine.stats().await.progress.unmapped_actions, 1);
    }

    #[tokio::test]
    async fn test_rebuild_after_actions() {
        let engine = engine();
        engine.record_action(ActionRequest::new("u1", "review_created")).await.unwrap();
        engine.record_action(ActionRequest::new("u2", "poll_answered")).await.unwrap();

        assert_eq!(engine.rebuild().await.unwrap(), 1);
        let page = engine
            .query()
            .get_leaderboard(crate::types::LeaderboardScope::Global, 10, 0)
            .await
            .unwrap();
        assert_eq!(page.entries[0].user_id, "u1");
        assert_eq!(page.entries[0].total_points, 15);
    }
}
