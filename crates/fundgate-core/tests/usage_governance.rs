use async_trait::async_trait;
use chrono::{Duration, Utc};
use fundgate_core::{
    Actor, Campaign, CastVote, DocumentRef, GovernanceError, ManualClock, MarkSpent,
    MemoryGovernanceStore, NewCampaign, NewUsageRequest, Notification, NotificationKind,
    NotificationSink, NotifyError, RequestId, UsageGovernance, UsageStatus,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

struct OfflineSink;

#[async_trait]
impl NotificationSink for OfflineSink {
    async fn deliver(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Err(NotifyError("notification service unreachable".to_string()))
    }
}

fn owner() -> Actor {
    Actor::member("owner")
}

async fn campaign_with(
    governance: &UsageGovernance,
    donations: &[(&str, u64)],
) -> Campaign {
    let campaign = governance
        .register_campaign(
            &owner(),
            NewCampaign {
                title: "Clinic equipment".to_string(),
                goal_minor: 100,
                deadline: Utc::now() + Duration::days(10),
                ledger_ref: None,
            },
        )
        .await
        .unwrap();
    for (donor, amount) in donations {
        governance
            .record_contribution(&Actor::member(*donor), campaign.id, *amount)
            .await
            .unwrap();
    }
    campaign
}

fn governance_with(sink: Arc<dyn NotificationSink>) -> UsageGovernance {
    UsageGovernance::new(
        Arc::new(MemoryGovernanceStore::new()),
        sink,
        Arc::new(ManualClock::default()),
    )
}

fn proposal(campaign: &Campaign, amount: u64, category: &str) -> NewUsageRequest {
    NewUsageRequest {
        campaign_id: campaign.id,
        title: format!("{category} purchase"),
        requested_minor: amount,
        category: category.to_string(),
        description: String::new(),
        supporting_doc: None,
    }
}

async fn propose(governance: &UsageGovernance, campaign: &Campaign, amount: u64) -> RequestId {
    governance
        .create_request(&owner(), proposal(campaign, amount, "equipment"))
        .await
        .unwrap()
        .request
        .id
}

#[tokio::test]
async fn scenario_a_spent_and_pending_leave_thirty() {
    let governance = governance_with(Arc::new(RecordingSink::default()));
    let campaign = campaign_with(&governance, &[("donor", 100)]).await;

    let first = propose(&governance, &campaign, 40).await;
    governance
        .cast_vote(&Actor::member("donor"), first, CastVote { approve: true })
        .await
        .unwrap();
    governance
        .mark_spent(
            &owner(),
            first,
            MarkSpent {
                actual_minor: 40,
                execution_proof: DocumentRef::new("invoice-40"),
                supporting_doc: None,
            },
        )
        .await
        .unwrap();
    propose(&governance, &campaign, 30).await;

    let summary = governance.ledger_summary(campaign.id).await.unwrap();
    assert_eq!(summary.total_spent_minor, 40);
    assert_eq!(summary.outstanding_approved_minor, 0);
    assert_eq!(summary.total_pending_minor, 30);
    assert_eq!(summary.remaining_minor, 30);
    assert!(summary.is_conserved());
}

#[tokio::test]
async fn scenario_b_donor_count_clause_approves() {
    let sink = Arc::new(RecordingSink::default());
    let governance = governance_with(sink.clone());
    let campaign = campaign_with(&governance, &[("ten", 10), ("twenty", 20), ("seventy", 70)]).await;
    let request = propose(&governance, &campaign, 50).await;

    let first = governance
        .cast_vote(&Actor::member("ten"), request, CastVote { approve: true })
        .await
        .unwrap();
    assert_eq!(first.status, UsageStatus::Pending);

    let second = governance
        .cast_vote(&Actor::member("twenty"), request, CastVote { approve: true })
        .await
        .unwrap();
    assert!(second.approved_now);
    assert_eq!(second.status, UsageStatus::Approved);
    assert!((second.tally.donor_approval_rate() - 2.0 / 3.0).abs() < 1e-9);
    assert!((second.tally.donation_approval_rate() - 0.3).abs() < 1e-9);

    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::UsageApproved);
    assert_eq!(sent[0].recipient_id, owner().user_id);
}

#[tokio::test]
async fn exactly_half_stays_pending_and_reevaluation_is_idempotent() {
    let governance = governance_with(Arc::new(RecordingSink::default()));
    let campaign = campaign_with(&governance, &[("a", 50), ("b", 50)]).await;
    let request = propose(&governance, &campaign, 20).await;

    let receipt = governance
        .cast_vote(&Actor::member("a"), request, CastVote { approve: true })
        .await
        .unwrap();
    assert_eq!(receipt.status, UsageStatus::Pending);

    for _ in 0..3 {
        let evaluated = governance.evaluate_auto_approval(request).await.unwrap();
        assert_eq!(evaluated.status, UsageStatus::Pending);
    }
}

#[tokio::test]
async fn reevaluating_an_approved_request_changes_nothing() {
    let governance = governance_with(Arc::new(RecordingSink::default()));
    let campaign = campaign_with(&governance, &[("a", 80), ("b", 20)]).await;
    let request = propose(&governance, &campaign, 20).await;
    governance
        .cast_vote(&Actor::member("a"), request, CastVote { approve: true })
        .await
        .unwrap();

    let before = governance.get_request(&owner(), request).await.unwrap().request;
    let after = governance.evaluate_auto_approval(request).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn amount_equal_to_remaining_succeeds_one_more_fails() {
    let governance = governance_with(Arc::new(RecordingSink::default()));
    let campaign = campaign_with(&governance, &[("a", 100)]).await;
    propose(&governance, &campaign, 35).await;

    let err = governance
        .create_request(&owner(), proposal(&campaign, 66, "equipment"))
        .await
        .unwrap_err();
    assert_eq!(err.blocking_remaining(), Some(65));

    let view = governance
        .create_request(&owner(), proposal(&campaign, 65, "equipment"))
        .await
        .unwrap();
    assert_eq!(view.remaining_minor, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creations_cannot_overcommit() {
    let governance = Arc::new(governance_with(Arc::new(RecordingSink::default())));
    let campaign = campaign_with(&governance, &[("a", 100)]).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let governance = governance.clone();
        let request = proposal(&campaign, 30, "equipment");
        handles.push(tokio::spawn(async move {
            governance.create_request(&owner(), request).await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(GovernanceError::InsufficientBalance { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(accepted, 3);
    let summary = governance.ledger_summary(campaign.id).await.unwrap();
    assert_eq!(summary.total_pending_minor, 90);
    assert_eq!(summary.remaining_minor, 10);
}

#[tokio::test]
async fn spend_is_checked_against_its_own_reservation() {
    let governance = governance_with(Arc::new(RecordingSink::default()));
    let campaign = campaign_with(&governance, &[("a", 100)]).await;
    let request = propose(&governance, &campaign, 60).await;
    propose(&governance, &campaign, 40).await;
    governance
        .cast_vote(&Actor::member("a"), request, CastVote { approve: true })
        .await
        .unwrap();

    // remaining is zero, yet the approved request may still spend what it reserved
    let spent = governance
        .mark_spent(
            &owner(),
            request,
            MarkSpent {
                actual_minor: 60,
                execution_proof: DocumentRef::new("receipt"),
                supporting_doc: Some(DocumentRef::new("photo")),
            },
        )
        .await
        .unwrap();
    assert_eq!(spent.status, UsageStatus::Spent);
    assert_eq!(spent.supporting_doc, Some(DocumentRef::new("photo")));

    let summary = governance.ledger_summary(campaign.id).await.unwrap();
    assert_eq!(summary.remaining_minor, 0);
    assert_eq!(summary.categories["equipment"].spent_minor, 60);
}

#[tokio::test]
async fn notification_failures_never_roll_back_transitions() {
    let governance = governance_with(Arc::new(OfflineSink));
    let campaign = campaign_with(&governance, &[("a", 100)]).await;
    let request = propose(&governance, &campaign, 10).await;

    let receipt = governance
        .cast_vote(&Actor::member("a"), request, CastVote { approve: true })
        .await
        .unwrap();
    assert_eq!(receipt.status, UsageStatus::Approved);

    let stored = governance.get_request(&owner(), request).await.unwrap();
    assert_eq!(stored.request.status, UsageStatus::Approved);
}

#[tokio::test]
async fn unknown_references_are_not_found() {
    let governance = governance_with(Arc::new(RecordingSink::default()));
    let err = governance
        .cast_vote(&Actor::member("a"), RequestId::new(), CastVote { approve: true })
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::NotFound(_)));

    let err = governance
        .get_request(&owner(), RequestId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::NotFound(_)));
}

#[tokio::test]
async fn categories_are_reported_separately() {
    let governance = governance_with(Arc::new(RecordingSink::default()));
    let campaign = campaign_with(&governance, &[("a", 100)]).await;
    governance
        .create_request(&owner(), proposal(&campaign, 10, "Transport"))
        .await
        .unwrap();
    governance
        .create_request(&owner(), proposal(&campaign, 15, "food"))
        .await
        .unwrap();

    let summary = governance.ledger_summary(campaign.id).await.unwrap();
    assert_eq!(summary.categories["transport"].pending_minor, 10);
    assert_eq!(summary.categories["food"].pending_minor, 15);
    assert_eq!(summary.remaining_minor, 75);
}
