//! Collaborator adapters for fundgate.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundgate_core::authority::{
    AuthoritativeCampaignState, AuthoritativeLedger, ConfirmationRef, ReleaseInstruction,
};
use fundgate_core::error::GovernanceError;
use fundgate_core::notify::{Notification, NotificationSink, NotifyError};
use fundgate_core::types::{LedgerRef, UserId};
use fundgate_core::withdrawal::{TransferError, ValueTransfer};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ledger returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<AdapterError> for GovernanceError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::NotFound(what) => GovernanceError::NotFound(what),
            other => GovernanceError::External(other.to_string()),
        }
    }
}

/// Wire shape of `GET {base}/campaigns/{ref}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStateBody {
    pub raised_minor: u64,
    pub goal_minor: u64,
    pub deadline: DateTime<Utc>,
    pub withdrawn: bool,
}

impl From<CampaignStateBody> for AuthoritativeCampaignState {
    fn from(body: CampaignStateBody) -> Self {
        Self {
            raised_minor: body.raised_minor,
            goal_minor: body.goal_minor,
            deadline: body.deadline,
            withdrawn: body.withdrawn,
        }
    }
}

#[derive(Debug, Serialize)]
struct ExecuteWithdrawalBody<'a> {
    caller: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExecuteWithdrawalResponse {
    confirmation: String,
}

/// HTTP client for a remote authoritative ledger.
pub struct HttpLedgerClient {
    client: Client,
    base_url: String,
}

impl HttpLedgerClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, AdapterError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn campaign_url(&self, ledger_ref: &LedgerRef) -> String {
        format!("{}/campaigns/{}", self.base_url, ledger_ref)
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        what: String,
    ) -> Result<T, AdapterError> {
        let status = response.status();

        if status.is_success() {
            Ok(response.json().await?)
        } else if status == StatusCode::NOT_FOUND {
            Err(AdapterError::NotFound(what))
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(AdapterError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl AuthoritativeLedger for HttpLedgerClient {
    async fn campaign_state(
        &self,
        ledger_ref: &LedgerRef,
    ) -> Result<AuthoritativeCampaignState, GovernanceError> {
        let response = self
            .client
            .get(self.campaign_url(ledger_ref))
            .send()
            .await
            .map_err(AdapterError::from)?;
        let body: CampaignStateBody = self
            .handle_response(response, format!("ledger campaign '{ledger_ref}'"))
            .await?;
        Ok(body.into())
    }

    async fn submit_release(
        &self,
        release: ReleaseInstruction,
    ) -> Result<ConfirmationRef, GovernanceError> {
        let url = format!(
            "{}/withdrawals/{}/execute",
            self.campaign_url(&release.ledger_ref),
            release.withdrawal_id
        );
        let response = self
            .client
            .post(url)
            .json(&ExecuteWithdrawalBody {
                caller: release.caller.as_str(),
            })
            .send()
            .await
            .map_err(AdapterError::from)?;
        let body: ExecuteWithdrawalResponse = self
            .handle_response(
                response,
                format!(
                    "withdrawal {} of '{}'",
                    release.withdrawal_id, release.ledger_ref
                ),
            )
            .await?;
        Ok(ConfirmationRef(body.confirmation))
    }
}

/// Ledger that is never reachable, for failure-isolation drills.
#[derive(Debug, Clone, Default)]
pub struct UnreachableLedger;

#[async_trait]
impl AuthoritativeLedger for UnreachableLedger {
    async fn campaign_state(
        &self,
        ledger_ref: &LedgerRef,
    ) -> Result<AuthoritativeCampaignState, GovernanceError> {
        Err(GovernanceError::external(format!(
            "authoritative ledger unreachable for '{ledger_ref}'"
        )))
    }

    async fn submit_release(
        &self,
        _release: ReleaseInstruction,
    ) -> Result<ConfirmationRef, GovernanceError> {
        Err(GovernanceError::external("authoritative ledger unreachable"))
    }
}

/// Value transfer that always succeeds and remembers what it moved.
#[derive(Debug, Default)]
pub struct MockTransfer {
    transfers: Mutex<Vec<(UserId, u64)>>,
}

impl MockTransfer {
    pub fn transfers(&self) -> Vec<(UserId, u64)> {
        self.transfers
            .lock()
            .map(|transfers| transfers.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ValueTransfer for MockTransfer {
    async fn transfer(&self, recipient: &UserId, amount_minor: u64) -> Result<(), TransferError> {
        self.transfers
            .lock()
            .map_err(|_| TransferError("transfer log poisoned".to_string()))?
            .push((recipient.clone(), amount_minor));
        Ok(())
    }
}

/// Deterministic failing transfer useful for rollback drills.
#[derive(Debug, Clone)]
pub struct AlwaysFailTransfer {
    reason: String,
}

impl AlwaysFailTransfer {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ValueTransfer for AlwaysFailTransfer {
    async fn transfer(&self, _recipient: &UserId, _amount_minor: u64) -> Result<(), TransferError> {
        Err(TransferError(self.reason.clone()))
    }
}

/// Sink that writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            recipient = %notification.recipient_id,
            campaign_id = %notification.campaign_id,
            kind = notification.kind.type_tag(),
            title = %notification.title,
            "Notification"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    delivered: Mutex<Vec<Notification>>,
}

impl RecordingNotificationSink {
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered
            .lock()
            .map(|delivered| delivered.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.delivered
            .lock()
            .map_err(|_| NotifyError("recording sink poisoned".to_string()))?
            .push(notification.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailingNotificationSink;

#[async_trait]
impl NotificationSink for FailingNotificationSink {
    async fn deliver(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Err(NotifyError("notification service unavailable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use fundgate_core::clock::{Clock, ManualClock};
    use fundgate_core::notify::NotificationKind;
    use fundgate_core::withdrawal::{NewWithdrawal, WithdrawalLedger};
    use std::sync::Arc;

    async fn executable(
        transfer: Arc<dyn ValueTransfer>,
        sink: Arc<dyn NotificationSink>,
    ) -> (WithdrawalLedger, UserId, LedgerRef) {
        let clock = Arc::new(ManualClock::default());
        let ledger = WithdrawalLedger::new(transfer, sink, clock.clone());
        let creator = UserId::new("creator");
        let campaign = ledger
            .create_campaign(&creator, 50, clock.now() + ChronoDuration::days(1))
            .await
            .unwrap();
        ledger.donate(&UserId::new("d"), &campaign, 50).await.unwrap();
        clock.advance(ChronoDuration::days(2));
        ledger
            .request_withdrawal(
                &creator,
                &campaign,
                NewWithdrawal {
                    amount_minor: 50,
                    usage: "All of it".to_string(),
                    supporting_doc: None,
                    approval_percentage: 100,
                },
            )
            .await
            .unwrap();
        ledger
            .approve_withdrawal(&UserId::new("d"), &campaign, 0)
            .await
            .unwrap();
        (ledger, creator, campaign)
    }

    #[tokio::test]
    async fn mock_transfer_records_release_and_sink_records_notices() {
        let transfer = Arc::new(MockTransfer::default());
        let sink = Arc::new(RecordingNotificationSink::default());
        let (ledger, creator, campaign) = executable(transfer.clone(), sink.clone()).await;

        ledger.execute_withdrawal(&creator, &campaign, 0).await.unwrap();

        assert_eq!(transfer.transfers(), vec![(creator.clone(), 50)]);
        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 2);
        assert!(delivered
            .iter()
            .all(|n| n.kind == NotificationKind::WithdrawalExecuted));
    }

    #[tokio::test]
    async fn always_fail_transfer_leaves_withdrawal_pending() {
        let sink = Arc::new(RecordingNotificationSink::default());
        let (ledger, creator, campaign) =
            executable(Arc::new(AlwaysFailTransfer::new("rail down")), sink.clone()).await;

        let err = ledger
            .execute_withdrawal(&creator, &campaign, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::External(_)));
        assert!(!ledger.withdrawal(&campaign, 0).await.unwrap().executed);
        assert!(sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn failing_sink_does_not_fail_execution() {
        let (ledger, creator, campaign) = executable(
            Arc::new(MockTransfer::default()),
            Arc::new(FailingNotificationSink),
        )
        .await;
        assert!(ledger.execute_withdrawal(&creator, &campaign, 0).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_ledger_reports_external_error() {
        let err = UnreachableLedger
            .campaign_state(&LedgerRef::new("c-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::External(_)));
    }

    #[test]
    fn http_client_normalizes_endpoint() {
        let client = HttpLedgerClient::new("http://ledger.local/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "http://ledger.local/api");
        assert_eq!(
            client.campaign_url(&LedgerRef::new("campaign-7")),
            "http://ledger.local/api/campaigns/campaign-7"
        );
    }

    #[test]
    fn not_found_maps_to_governance_not_found() {
        let err: GovernanceError = AdapterError::NotFound("ledger campaign 'x'".to_string()).into();
        assert!(matches!(err, GovernanceError::NotFound(_)));

        let err: GovernanceError = AdapterError::Api {
            status: 503,
            message: "maintenance".to_string(),
        }
        .into();
        assert!(matches!(err, GovernanceError::External(_)));
    }

    #[test]
    fn wire_body_converts_to_state() {
        let body: CampaignStateBody = serde_json::from_str(
            r#"{"raised_minor":120,"goal_minor":100,"deadline":"2026-01-01T00:00:00Z","withdrawn":false}"#,
        )
        .unwrap();
        let state: AuthoritativeCampaignState = body.into();
        assert_eq!(state.raised_minor, 120);
        assert!(!state.withdrawn);
    }
}
