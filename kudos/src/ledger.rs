//! Ledger Store: idempotent point awards, reversals and level settlement.
//!
//! Every award is one atomic append + aggregate increment in the backend.
//! Conflicts are retried with bounded exponential backoff; once the attempts
//! are spent the event is appended on its own and the user is queued for
//! repair, so points are never lost, only briefly missing from the aggregate.
//!
//! After each committed write the user's level is settled with a
//! compare-and-set loop, which is what guarantees a single level-up
//! notification per transition even under concurrent awards.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::notify::{dispatch, Notification, Notifier};
use crate::store::LedgerBackend;
use crate::types::{
    ActionKey, AwardReceipt, AwardRequest, KudosError, PointEvent, Result, UserAggregate, REVERSAL,
};

/// Dedupe key namespaces the engine writes itself.
const RESERVED_DEDUPE_PREFIXES: [&str; 3] = ["badge:", "mission:", "reversal:"];

/// Counters describing ledger activity.
#[derive(Debug, Default)]
pub struct LedgerStats {
    pub recorded: AtomicU64,
    pub duplicates: AtomicU64,
    pub conflict_retries: AtomicU64,
    pub repairs_queued: AtomicU64,
    pub level_changes: AtomicU64,
}

impl LedgerStats {
    pub fn snapshot(&self) -> LedgerStatsSnapshot {
        LedgerStatsSnapshot {
            recorded: self.recorded.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            conflict_retries: self.conflict_retries.load(Ordering::Relaxed),
            repairs_queued: self.repairs_queued.load(Ordering::Relaxed),
            level_changes: self.level_changes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerStatsSnapshot {
    pub recorded: u64,
    pub duplicates: u64,
    pub conflict_retries: u64,
    pub repairs_queued: u64,
    pub level_changes: u64,
}

/// Append-only point ledger.
pub struct LedgerStore {
    backend: Arc<dyn LedgerBackend>,
    catalog: Arc<Catalog>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
    notify_timeout: Duration,
    /// Users whose aggregate must be reconciled from the ledger
    repairs: DashMap<String, DateTime<Utc>>,
    stats: LedgerStats,
}

impl LedgerStore {
    pub fn new(
        backend: Arc<dyn LedgerBackend>,
        catalog: Arc<Catalog>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: LedgerConfig,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            catalog,
            notifier,
            clock,
            config,
            notify_timeout,
            repairs: DashMap::new(),
            stats: LedgerStats::default(),
        }
    }

    /// Append points for a user.
    ///
    /// A request whose dedupe key the user already used returns
    /// [`AwardReceipt::Duplicate`] with the original event and writes nothing.
    ///
    /// Engine-written action types and their dedupe key namespaces are
    /// refused here; bonuses go through `award_bonus`, reversals through
    /// [`reverse`](Self::reverse).
    pub async fn award_points(&self, request: AwardRequest) -> Result<AwardReceipt> {
        if request.action_type.as_str() == REVERSAL {
            return Err(KudosError::InvalidRequest(
                "reversals are recorded through reverse()".to_string(),
            ));
        }
        if request.action_type.is_reserved() {
            return Err(KudosError::InvalidRequest(format!(
                "action type '{}' is reserved",
                request.action_type
            )));
        }
        if let Some(prefix) = request
            .dedupe_key
            .as_deref()
            .and_then(|key| RESERVED_DEDUPE_PREFIXES.iter().find(|p| key.starts_with(*p)))
        {
            return Err(KudosError::InvalidRequest(format!(
                "dedupe keys starting with '{}' are reserved",
                prefix
            )));
        }
        self.award(request).await
    }

    /// Badge and mission bonus path; skips the reserved-type checks.
    pub(crate) async fn award_bonus(&self, request: AwardRequest) -> Result<AwardReceipt> {
        self.award(request).await
    }

    async fn award(&self, request: AwardRequest) -> Result<AwardReceipt> {
        if request.user_id.trim().is_empty() {
            return Err(KudosError::InvalidRequest("user_id is required".to_string()));
        }
        if request.action_type.as_str().is_empty() {
            return Err(KudosError::InvalidRequest("action_type is required".to_string()));
        }
        if request.points < 0 {
            return Err(KudosError::InvalidRequest(format!(
                "negative awards are not allowed ({}); reverse the original event instead",
                request.points
            )));
        }
        if matches!(&request.dedupe_key, Some(key) if key.is_empty()) {
            return Err(KudosError::InvalidRequest("dedupe_key must not be empty".to_string()));
        }

        let description = request
            .description
            .unwrap_or_else(|| self.default_description(&request.action_type));
        let event = self.new_event(
            request.user_id,
            request.action_type,
            request.points,
            description,
            request.dedupe_key,
            None,
        );
        self.append(event).await
    }

    /// Insert a compensating event of equal and opposite magnitude.
    ///
    /// Reversing the same event twice returns the first reversal.
    pub async fn reverse(&self, event_id: &str, reason: Option<String>) -> Result<AwardReceipt> {
        let original = self
            .backend
            .event(event_id)
            .await?
            .ok_or_else(|| KudosError::NotFound(format!("event {}", event_id)))?;

        if original.reverses.is_some() || original.action_type.as_str() == REVERSAL {
            return Err(KudosError::InvalidRequest(format!(
                "event {} is itself a reversal",
                event_id
            )));
        }
        if original.points == 0 {
            return Err(KudosError::InvalidRequest(format!(
                "event {} carries no points to reverse",
                event_id
            )));
        }

        let description = reason.unwrap_or_else(|| format!("Reversal of {}", original.id));
        let event = self.new_event(
            original.user_id.clone(),
            ActionKey::new(REVERSAL),
            -original.points,
            description,
            Some(format!("reversal:{}", original.id)),
            Some(original.id.clone()),
        );

        info!(
            event_id = %original.id,
            user_id = %original.user_id,
            points = -original.points,
            "Reversing event"
        );
        self.append(event).await
    }

    pub async fn event(&self, event_id: &str) -> Result<Option<PointEvent>> {
        self.backend.event(event_id).await
    }

    /// Newest-first events for a user.
    pub async fn history(&self, user_id: &str, limit: usize) -> Result<Vec<PointEvent>> {
        self.backend.history(user_id, limit).await
    }

    pub async fn aggregate(&self, user_id: &str) -> Result<Option<UserAggregate>> {
        self.backend.aggregate(user_id).await
    }

    /// Users waiting for aggregate repair.
    pub fn pending_repairs(&self) -> Vec<String> {
        let mut users: Vec<String> = self.repairs.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    /// Reconcile every queued user's aggregate from the ledger.
    ///
    /// Users whose repair fails stay queued. Returns how many were repaired.
    pub async fn repair_pending(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut repaired = 0;

        for user_id in self.pending_repairs() {
            match self.backend.reconcile_aggregate(&user_id, now).await {
                Ok(agg) => {
                    self.repairs.remove(&user_id);
                    repaired += 1;
                    info!(
                        user_id = %user_id,
                        total_points = agg.total_points,
                        "Aggregate repaired"
                    );
                    if let Err(e) = self.settle_level(&user_id, now).await {
                        warn!(user_id = %user_id, error = %e, "Level settle after repair failed");
                        self.queue_repair(&user_id, "level settle failed");
                    }
                }
                Err(e) => {
                    error!(user_id = %user_id, error = %e, "Aggregate repair failed");
                }
            }
        }

        Ok(repaired)
    }

    pub fn stats(&self) -> LedgerStatsSnapshot {
        self.stats.snapshot()
    }

    fn default_description(&self, action_type: &ActionKey) -> String {
        self.catalog
            .action(action_type)
            .map(|rule| rule.description.clone())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| action_type.to_string())
    }

    fn new_event(
        &self,
        user_id: String,
        action_type: ActionKey,
        points: i64,
        action_description: String,
        dedupe_key: Option<String>,
        reverses: Option<String>,
    ) -> PointEvent {
        PointEvent {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            points,
            action_type,
            action_description,
            dedupe_key,
            reverses,
            created_at: self.clock.now(),
        }
    }

    fn queue_repair(&self, user_id: &str, reason: &str) {
        if self
            .repairs
            .insert(user_id.to_string(), self.clock.now())
            .is_none()
        {
            self.stats.repairs_queued.fetch_add(1, Ordering::Relaxed);
        }
        warn!(user_id, reason, "User queued for aggregate repair");
    }

    async fn append(&self, event: PointEvent) -> Result<AwardReceipt> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.backend.record_award(event.clone()).await {
                Ok(commit) if commit.duplicate => {
                    self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        user_id = %event.user_id,
                        dedupe_key = ?event.dedupe_key,
                        existing_id = %commit.event.id,
                        "Duplicate award ignored"
                    );
                    return Ok(AwardReceipt::Duplicate(commit.event));
                }
                Ok(commit) => {
                    self.stats.recorded.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        event_id = %commit.event.id,
                        user_id = %commit.event.user_id,
                        points = commit.event.points,
                        action_type = %commit.event.action_type,
                        total_points = commit.aggregate.total_points,
                        "Points recorded"
                    );
                    if let Err(e) = self.settle_level(&event.user_id, event.created_at).await {
                        warn!(user_id = %event.user_id, error = %e, "Level settle failed");
                        self.queue_repair(&event.user_id, "level settle failed");
                    }
                    return Ok(AwardReceipt::Recorded(commit.event));
                }
                Err(KudosError::Conflict(reason)) if attempt < self.config.max_attempts => {
                    self.stats.conflict_retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.config.backoff(attempt);
                    debug!(
                        user_id = %event.user_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Aggregate conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(KudosError::Conflict(reason)) => {
                    warn!(
                        user_id = %event.user_id,
                        attempts = attempt,
                        reason = %reason,
                        "Aggregate update exhausted retries, appending event alone"
                    );
                    let appended = self.backend.append_event(event.clone()).await?;
                    if appended.duplicate {
                        self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                        return Ok(AwardReceipt::Duplicate(appended.event));
                    }
                    self.stats.recorded.fetch_add(1, Ordering::Relaxed);
                    self.queue_repair(&event.user_id, "aggregate conflict");
                    return Ok(AwardReceipt::Recorded(appended.event));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bring `current_level` in line with `total_points`.
    ///
    /// Only the caller whose compare-and-set lands emits the notification.
    async fn settle_level(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let levels = self.catalog.levels();

        for _ in 0..self.config.level_settle_rounds.max(1) {
            let Some(agg) = self.backend.aggregate(user_id).await? else {
                return Ok(());
            };
            let resolved = levels.resolve(agg.total_points);
            if resolved.level == agg.current_level {
                return Ok(());
            }

            if !self
                .backend
                .compare_and_set_level(user_id, agg.current_level, resolved.level)
                .await?
            {
                continue;
            }

            // 0 means never resolved; treat the starting level as the origin
            let from = if agg.current_level == 0 {
                levels.first().level
            } else {
                agg.current_level
            };

            if resolved.level > from {
                self.stats.level_changes.fetch_add(1, Ordering::Relaxed);
                info!(user_id, from, to = resolved.level, "Level up");
                dispatch(
                    &self.notifier,
                    Notification::LevelUp {
                        user_id: user_id.to_string(),
                        from,
                        to: resolved.level,
                        level_name: resolved.name.clone(),
                        at,
                    },
                    self.notify_timeout,
                )
                .await;
            } else if resolved.level < from {
                self.stats.level_changes.fetch_add(1, Ordering::Relaxed);
                info!(user_id, from, to = resolved.level, "Level lowered after reversal");
            }
            return Ok(());
        }

        Err(KudosError::Conflict(format!(
            "level for {} kept moving during settle",
            user_id
        )))
    }
}
