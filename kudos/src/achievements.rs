//! Achievement Evaluator: turns counter deltas into badge unlocks, mission
//! completions and their bonus awards.
//!
//! No lock guards an unlock. Two evaluations racing on the same threshold both
//! try the dedupe-keyed bonus award; the ledger lets exactly one through and
//! the store sets `earned_at` / `completed` exactly once.
//!
//! Evaluating the same source twice is safe. Badge progress only rises,
//! mission rows remember which sources advanced them, and a replay that finds
//! a completed mission re-issues the deduped bonus, which is how a run cut
//! short between completion and bonus gets finished.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::ledger::LedgerStore;
use crate::notify::{dispatch, Notification, Notifier};
use crate::store::AchievementBackend;
use crate::types::{
    AwardRequest, Badge, CounterDelta, CycleKey, Mission, PointEvent, Result, BADGE_BONUS,
    MISSION_BONUS,
};

/// A mission finished within one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedMission {
    pub mission: Mission,
    pub cycle_key: CycleKey,
    pub completed_at: DateTime<Utc>,
}

/// What one evaluation unlocked.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Evaluation {
    pub newly_earned_badges: Vec<Badge>,
    pub newly_completed_missions: Vec<CompletedMission>,
    /// Bonus events this evaluation appended (duplicates excluded)
    pub bonus_events: Vec<PointEvent>,
}

impl Evaluation {
    pub fn is_empty(&self) -> bool {
        self.newly_earned_badges.is_empty() && self.newly_completed_missions.is_empty()
    }
}

pub struct AchievementEvaluator {
    catalog: Arc<Catalog>,
    backend: Arc<dyn AchievementBackend>,
    ledger: Arc<LedgerStore>,
    notifier: Arc<dyn Notifier>,
    notify_timeout: Duration,
}

impl AchievementEvaluator {
    pub fn new(
        catalog: Arc<Catalog>,
        backend: Arc<dyn AchievementBackend>,
        ledger: Arc<LedgerStore>,
        notifier: Arc<dyn Notifier>,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            backend,
            ledger,
            notifier,
            notify_timeout,
        }
    }

    /// Check every badge and active mission keyed to the changed counters.
    ///
    /// `source` is the action the deltas came from.
    pub async fn evaluate(
        &self,
        user_id: &str,
        source: &str,
        deltas: &[CounterDelta],
    ) -> Result<Evaluation> {
        let mut evaluation = Evaluation::default();

        for delta in deltas {
            for badge in self.catalog.badges_for(&delta.requirement_type) {
                self.evaluate_badge(user_id, badge, delta, &mut evaluation).await?;
            }
            for mission in self.catalog.missions_for(&delta.requirement_type) {
                self.evaluate_mission(user_id, source, mission, delta, &mut evaluation)
                    .await?;
            }
        }

        if !evaluation.is_empty() {
            debug!(
                user_id,
                badges = evaluation.newly_earned_badges.len(),
                missions = evaluation.newly_completed_missions.len(),
                bonuses = evaluation.bonus_events.len(),
                "Evaluation unlocked achievements"
            );
        }
        Ok(evaluation)
    }

    async fn evaluate_badge(
        &self,
        user_id: &str,
        badge: &Badge,
        delta: &CounterDelta,
        evaluation: &mut Evaluation,
    ) -> Result<()> {
        if let Some(existing) = self.backend.user_badge(user_id, &badge.key).await? {
            if existing.is_earned() {
                return Ok(());
            }
        }

        // Bonus before the unlock mark: a failure in between is healed by
        // the next evaluation, where the bonus dedupes and the mark lands.
        if delta.current >= badge.requirement_count && badge.points_reward > 0 {
            let request = AwardRequest::new(user_id, BADGE_BONUS, badge.points_reward)
                .with_description(format!("Badge unlocked: {}", display_name(&badge.name, &badge.key)))
                .with_dedupe_key(badge.bonus_dedupe_key());
            let receipt = self.ledger.award_bonus(request).await?;
            if !receipt.is_duplicate() {
                evaluation.bonus_events.push(receipt.into_event());
            }
        }

        let update = self
            .backend
            .record_badge_progress(user_id, badge, delta.current, delta.occurred_at)
            .await?;

        if update.newly_earned {
            info!(user_id, badge = %badge.key, rarity = badge.rarity.as_str(), "Badge earned");
            evaluation.newly_earned_badges.push(badge.clone());
            dispatch(
                &self.notifier,
                Notification::BadgeUnlocked {
                    user_id: user_id.to_string(),
                    badge_key: badge.key.clone(),
                    badge_name: badge.name.clone(),
                    at: delta.occurred_at,
                },
                self.notify_timeout,
            )
            .await;
        }
        Ok(())
    }

    async fn evaluate_mission(
        &self,
        user_id: &str,
        source: &str,
        mission: &Mission,
        delta: &CounterDelta,
        evaluation: &mut Evaluation,
    ) -> Result<()> {
        let cycle = mission.mission_type.cycle_key(delta.occurred_at);
        let update = self
            .backend
            .advance_mission(
                user_id,
                mission,
                &cycle,
                source,
                delta.increment(),
                delta.occurred_at,
            )
            .await?;

        // A replay of the completing source only matters if its bonus never landed
        let resumed = update.replayed && update.mission.completed;
        if !update.newly_completed && !resumed {
            return Ok(());
        }

        let mut bonus_paid = false;
        if mission.points > 0 {
            let request = AwardRequest::new(user_id, MISSION_BONUS, mission.points)
                .with_description(format!(
                    "Mission completed: {}",
                    display_name(&mission.title, &mission.id)
                ))
                .with_dedupe_key(mission.bonus_dedupe_key(&cycle));
            let receipt = self.ledger.award_bonus(request).await?;
            if !receipt.is_duplicate() {
                bonus_paid = true;
                evaluation.bonus_events.push(receipt.into_event());
            }
        }

        if !update.newly_completed && !bonus_paid {
            return Ok(());
        }

        let completed_at = update.mission.completed_at.unwrap_or(delta.occurred_at);
        info!(user_id, mission = %mission.id, cycle = %cycle, resumed, "Mission completed");

        dispatch(
            &self.notifier,
            Notification::MissionCompleted {
                user_id: user_id.to_string(),
                mission_id: mission.id.clone(),
                cycle_key: cycle.to_string(),
                at: completed_at,
            },
            self.notify_timeout,
        )
        .await;

        evaluation.newly_completed_missions.push(CompletedMission {
            mission: mission.clone(),
            cycle_key: cycle,
            completed_at,
        });
        Ok(())
    }
}

fn display_name<'a>(name: &'a str, key: &'a str) -> &'a str {
    if name.is_empty() {
        key
    } else {
        name
    }
}
