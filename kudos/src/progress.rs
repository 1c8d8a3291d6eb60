//! Progress Tracker: maps raw actions onto requirement counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::catalog::{ActionRule, Catalog};
use crate::store::{CounterOp, ProgressBackend};
use crate::types::{ActionKey, CounterDelta, KudosError, Result};

/// Context for one recorded action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMetadata {
    /// Entity the action targeted; required by distinct counters
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Event time, used for mission cycles and unlock timestamps
    pub occurred_at: DateTime<Utc>,
}

impl ActionMetadata {
    pub fn at(occurred_at: DateTime<Utc>) -> Self {
        Self {
            entity_id: None,
            occurred_at,
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

/// Counter deltas one source produced.
#[derive(Debug, Clone, Default)]
pub struct TrackedAction {
    pub deltas: Vec<CounterDelta>,
    /// The source had been tracked before; `deltas` are the original ones
    pub replayed: bool,
}

#[derive(Debug, Default)]
pub struct ProgressStats {
    pub actions: AtomicU64,
    pub unmapped_actions: AtomicU64,
    pub skipped_distinct: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressStatsSnapshot {
    pub actions: u64,
    pub unmapped_actions: u64,
    pub skipped_distinct: u64,
}

impl ProgressStats {
    pub fn snapshot(&self) -> ProgressStatsSnapshot {
        ProgressStatsSnapshot {
            actions: self.actions.load(Ordering::Relaxed),
            unmapped_actions: self.unmapped_actions.load(Ordering::Relaxed),
            skipped_distinct: self.skipped_distinct.load(Ordering::Relaxed),
        }
    }
}

/// Maintains per-user requirement counters.
pub struct ProgressTracker {
    catalog: Arc<Catalog>,
    backend: Arc<dyn ProgressBackend>,
    stats: ProgressStats,
}

impl ProgressTracker {
    pub fn new(catalog: Arc<Catalog>, backend: Arc<dyn ProgressBackend>) -> Self {
        Self {
            catalog,
            backend,
            stats: ProgressStats::default(),
        }
    }

    /// The registry entry for `action_key`.
    ///
    /// Unknown keys are a configuration error and are counted.
    pub fn rule(&self, action_key: &ActionKey) -> Result<&ActionRule> {
        self.catalog.action(action_key).ok_or_else(|| {
            self.stats.unmapped_actions.fetch_add(1, Ordering::Relaxed);
            warn!(action_key = %action_key, "Unmapped action, counter update dropped");
            KudosError::Configuration(format!("unknown action key '{}'", action_key))
        })
    }

    /// Apply an action to every counter it feeds.
    ///
    /// `source` identifies the action (its ledger event id when one was
    /// written) and makes the call safe to repeat: a second call with the
    /// same source moves nothing and hands back the original deltas.
    ///
    /// Only counters that changed produce a delta; repeated distinct entities
    /// and distinct counters without an entity id produce none.
    pub async fn record_action(
        &self,
        user_id: &str,
        source: &str,
        action_key: &ActionKey,
        metadata: &ActionMetadata,
    ) -> Result<TrackedAction> {
        let rule = self.rule(action_key)?;

        let mut ops = Vec::with_capacity(rule.counters.len());
        let mut skipped = 0;
        for counter in &rule.counters {
            if !counter.distinct {
                ops.push(CounterOp::occurrence(counter.requirement_type.clone()));
                continue;
            }
            match metadata.entity_id.as_deref() {
                Some(entity_id) => {
                    ops.push(CounterOp::distinct(counter.requirement_type.clone(), entity_id))
                }
                None => {
                    skipped += 1;
                    warn!(
                        user_id,
                        action_key = %action_key,
                        requirement_type = %counter.requirement_type,
                        "Distinct counter needs an entity id, skipped"
                    );
                }
            }
        }

        let applied = self.backend.apply_counters(user_id, source, &ops).await?;
        if !applied.replayed {
            self.stats.actions.fetch_add(1, Ordering::Relaxed);
            self.stats.skipped_distinct.fetch_add(skipped, Ordering::Relaxed);
        }

        let deltas: Vec<CounterDelta> = applied
            .changes
            .into_iter()
            .map(|change| CounterDelta {
                requirement_type: change.requirement_type,
                previous: change.previous,
                current: change.current,
                occurred_at: metadata.occurred_at,
            })
            .collect();

        debug!(
            user_id,
            source,
            action_key = %action_key,
            changed = deltas.len(),
            replayed = applied.replayed,
            "Action tracked"
        );
        Ok(TrackedAction {
            deltas,
            replayed: applied.replayed,
        })
    }

    pub fn stats(&self) -> ProgressStatsSnapshot {
        self.stats.snapshot()
    }
}
