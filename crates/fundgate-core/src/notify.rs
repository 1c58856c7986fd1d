use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    UsageApproved,
    UsageRejected,
    UsageSpent,
    WithdrawalExecuted,
}

impl NotificationKind {
    pub fn type_tag(self) -> &'static str {
        match self {
            Self::UsageApproved => "usage_request_approved",
            Self::UsageRejected => "usage_request_rejected",
            Self::UsageSpent => "usage_request_spent",
            Self::WithdrawalExecuted => "withdrawal_executed",
        }
    }
}

/// Request handed to the external notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient_id: UserId,
    pub campaign_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// External notification transport.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sink that drops everything, for deployments without a notification service.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

#[async_trait]
impl NotificationSink for DiscardSink {
    async fn deliver(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Deliver each notification, logging failures. Never fails the caller.
pub async fn notify_best_effort(sink: &dyn NotificationSink, notifications: Vec<Notification>) {
    for notification in notifications {
        match sink.deliver(&notification).await {
            Ok(()) => debug!(
                recipient = %notification.recipient_id,
                kind = notification.kind.type_tag(),
                "Notification delivered"
            ),
            Err(err) => warn!(
                recipient = %notification.recipient_id,
                campaign_id = %notification.campaign_id,
                kind = notification.kind.type_tag(),
                error = %err,
                "Notification delivery failed"
            ),
        }
    }
}
