//! Notifications for level-ups and unlocks.
//!
//! Delivery is fire-and-forget: [`dispatch`] bounds each delivery with a
//! timeout and logs failures, so a broken notifier can never roll back or
//! stall a ledger write.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::{KudosError, Result};

/// Something a user achieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    LevelUp {
        user_id: String,
        from: u32,
        to: u32,
        level_name: String,
        at: DateTime<Utc>,
    },
    BadgeUnlocked {
        user_id: String,
        badge_key: String,
        badge_name: String,
        at: DateTime<Utc>,
    },
    MissionCompleted {
        user_id: String,
        mission_id: String,
        cycle_key: String,
        at: DateTime<Utc>,
    },
}

impl Notification {
    pub fn user_id(&self) -> &str {
        match self {
            Notification::LevelUp { user_id, .. }
            | Notification::BadgeUnlocked { user_id, .. }
            | Notification::MissionCompleted { user_id, .. } => user_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::LevelUp { .. } => "level_up",
            Notification::BadgeUnlocked { .. } => "badge_unlocked",
            Notification::MissionCompleted { .. } => "mission_completed",
        }
    }
}

/// External notification collaborator.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Notifier that only writes a log line.
pub struct TracingNotifier;

#[async_trait::async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        match &notification {
            Notification::LevelUp { user_id, from, to, level_name, .. } => {
                info!(user_id = %user_id, from, to, level = %level_name, "Level up");
            }
            Notification::BadgeUnlocked { user_id, badge_key, .. } => {
                info!(user_id = %user_id, badge = %badge_key, "Badge unlocked");
            }
            Notification::MissionCompleted { user_id, mission_id, cycle_key, .. } => {
                info!(user_id = %user_id, mission = %mission_id, cycle = %cycle_key, "Mission completed");
            }
        }
        Ok(())
    }
}

/// Notifier that forwards onto an mpsc channel.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.tx
            .send(notification)
            .map_err(|_| KudosError::Notification("receiver dropped".to_string()))
    }
}

/// Deliver one notification, swallowing failure and timeouts.
pub async fn dispatch(notifier: &Arc<dyn Notifier>, notification: Notification, timeout: Duration) {
    let user_id = notification.user_id().to_string();
    let kind = notification.kind();

    match tokio::time::timeout(timeout, notifier.notify(notification)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(user_id = %user_id, kind, error = %e, "Notification delivery failed");
        }
        Err(_) => {
            warn!(user_id = %user_id, kind, "Notification delivery timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StuckNotifier;

    #[async_trait::async_trait]
    impl Notifier for StuckNotifier {
        async fn notify(&self, _notification: Notification) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn level_up() -> Notification {
        Notification::LevelUp {
            user_id: "u1".to_string(),
            from: 1,
            to: 2,
            level_name: "Neighbor".to_string(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::new();
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);

        dispatch(&notifier, level_up(), Duration::from_secs(1)).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind(), "level_up");
        assert_eq!(received.user_id(), "u1");
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_swallowed() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);
        dispatch(&notifier, level_up(), Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stuck_notifier_times_out() {
        let notifier: Arc<dyn Notifier> = Arc::new(StuckNotifier);
        dispatch(&notifier, level_up(), Duration::from_millis(100)).await;
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let json = serde_json::to_value(level_up()).unwrap();
        assert_eq!(json["kind"], "level_up");
        assert_eq!(json["to"], 2);
    }
}
