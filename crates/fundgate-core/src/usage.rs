//! Off-chain usage-request governance.
//!
//! Each operation is a straight pipeline: validate the caller and payload,
//! hand the ledger check plus the write to the store as one atomic unit,
//! evaluate auto-approval inside that same unit, then notify best-effort.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::accountant::LedgerSummary;
use crate::clock::Clock;
use crate::config::GovernanceConfig;
use crate::error::GovernanceError;
use crate::notify::{notify_best_effort, Notification, NotificationKind, NotificationSink};
use crate::storage::{electorate, GovernanceStore, SpendRecord, VoteCast};
use crate::types::{
    Actor, Campaign, CampaignId, CampaignStatus, CastVote, Contribution, MarkSpent, NewCampaign,
    NewUsageRequest, RequestId, RequestView, UsageRequest, UsageStatus, VoteReceipt,
};
use crate::voting::{BallotBox, MajorityPolicy, VoteChoice};

const DEFAULT_CATEGORY: &str = "general";

pub struct UsageGovernance {
    store: Arc<dyn GovernanceStore>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    policy: MajorityPolicy,
    config: GovernanceConfig,
}

impl UsageGovernance {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            policy: MajorityPolicy::simple(),
            config: GovernanceConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GovernanceConfig) -> Result<Self, GovernanceError> {
        self.policy = config.majority()?;
        self.config = config;
        Ok(self)
    }

    pub fn store(&self) -> &Arc<dyn GovernanceStore> {
        &self.store
    }

    pub fn policy(&self) -> &MajorityPolicy {
        &self.policy
    }

    /// Register the governance-relevant slice of a campaign in the mirror.
    pub async fn register_campaign(
        &self,
        actor: &Actor,
        new: NewCampaign,
    ) -> Result<Campaign, GovernanceError> {
        let title = new.title.trim();
        if title.is_empty() {
            return Err(GovernanceError::validation("campaign title must not be empty"));
        }
        if new.goal_minor == 0 {
            return Err(GovernanceError::validation("campaign goal must be greater than zero"));
        }

        let campaign = Campaign {
            id: CampaignId::new(),
            owner_id: actor.user_id.clone(),
            title: title.to_string(),
            goal_minor: new.goal_minor,
            raised_minor: 0,
            deadline: new.deadline,
            withdrawn: false,
            status: CampaignStatus::Active,
            ledger_ref: new.ledger_ref,
            last_synced_at: None,
        };
        self.store.insert_campaign(campaign.clone()).await?;
        info!(campaign_id = %campaign.id, owner = %campaign.owner_id, "Campaign registered");
        Ok(campaign)
    }

    /// Append a contribution. The donor's running total becomes their vote weight.
    pub async fn record_contribution(
        &self,
        donor: &Actor,
        campaign_id: CampaignId,
        amount_minor: u64,
    ) -> Result<Campaign, GovernanceError> {
        if amount_minor == 0 {
            return Err(GovernanceError::validation("contribution must be greater than zero"));
        }
        let campaign = self
            .store
            .record_contribution(Contribution {
                campaign_id,
                donor_id: donor.user_id.clone(),
                amount_minor,
                contributed_at: self.clock.now(),
            })
            .await?;
        debug!(
            campaign_id = %campaign_id,
            donor = %donor.user_id,
            amount = amount_minor,
            raised = campaign.raised_minor,
            "Contribution recorded"
        );
        Ok(campaign)
    }

    pub async fn create_request(
        &self,
        actor: &Actor,
        new: NewUsageRequest,
    ) -> Result<RequestView, GovernanceError> {
        let campaign = self.campaign(new.campaign_id).await?;
        if !actor.may_manage(&campaign) {
            warn!(campaign_id = %campaign.id, caller = %actor.user_id, "Usage request refused: not owner");
            return Err(GovernanceError::unauthorized(
                "only the campaign owner may propose usage requests",
            ));
        }
        if new.requested_minor == 0 {
            return Err(GovernanceError::validation("requested amount must be greater than zero"));
        }
        let title = new.title.trim();
        if title.is_empty() || title.len() > self.config.max_title_len {
            return Err(GovernanceError::validation(format!(
                "title must be 1..={} characters",
                self.config.max_title_len
            )));
        }
        let category = self.normalize_category(&new.category)?;

        let now = self.clock.now();
        let request = UsageRequest {
            id: RequestId::new(),
            campaign_id: campaign.id,
            requester_id: actor.user_id.clone(),
            title: title.to_string(),
            description: new.description,
            category,
            requested_minor: new.requested_minor,
            actual_minor: None,
            status: UsageStatus::Pending,
            supporting_doc: new.supporting_doc,
            execution_proof: None,
            created_at: now,
            updated_at: now,
        };

        let summary = match self.store.insert_within_budget(request.clone()).await {
            Ok(summary) => summary,
            Err(err) => {
                let err = GovernanceError::from(err);
                if let Some(remaining) = err.blocking_remaining() {
                    warn!(
                        campaign_id = %campaign.id,
                        requested = request.requested_minor,
                        remaining,
                        "Usage request exceeds remaining balance"
                    );
                }
                return Err(err);
            }
        };

        info!(
            campaign_id = %campaign.id,
            request_id = %request.id,
            amount = request.requested_minor,
            remaining = summary.remaining_minor,
            "Usage request created"
        );
        self.view(actor, request).await
    }

    pub async fn cast_vote(
        &self,
        actor: &Actor,
        request_id: RequestId,
        vote: CastVote,
    ) -> Result<VoteReceipt, GovernanceError> {
        let request = self.request(request_id).await?;
        let weight = self
            .store
            .contribution_total(request.campaign_id, &actor.user_id)
            .await?;
        if weight == 0 && !actor.is_administrator() {
            warn!(request_id = %request_id, caller = %actor.user_id, "Vote refused: not a contributor");
            return Err(GovernanceError::unauthorized(
                "only contributors to this campaign may vote",
            ));
        }

        let applied = self
            .store
            .cast_vote(
                VoteCast {
                    request_id,
                    voter_id: actor.user_id.clone(),
                    choice: VoteChoice::from_approve(vote.approve),
                    cast_at: self.clock.now(),
                },
                &self.policy,
            )
            .await?;

        debug!(
            request_id = %request_id,
            voter = %actor.user_id,
            choice = applied.vote.choice.as_str(),
            weight = applied.vote.weight_minor,
            donor_rate = applied.tally.donor_approval_rate(),
            donation_rate = applied.tally.donation_approval_rate(),
            "Vote recorded"
        );

        if applied.approved_now {
            self.announce_approval(&applied.request).await?;
        }

        Ok(VoteReceipt {
            request_id,
            status: applied.request.status,
            tally: applied.tally,
            weight_minor: applied.vote.weight_minor,
            approved_now: applied.approved_now,
        })
    }

    /// Re-run auto-approval without a new vote. A no-op unless the request is PENDING.
    pub async fn evaluate_auto_approval(
        &self,
        request_id: RequestId,
    ) -> Result<UsageRequest, GovernanceError> {
        let evaluation = self
            .store
            .evaluate(request_id, &self.policy, self.clock.now())
            .await?;
        if evaluation.approved_now {
            self.announce_approval(&evaluation.request).await?;
        }
        Ok(evaluation.request)
    }

    pub async fn mark_spent(
        &self,
        actor: &Actor,
        request_id: RequestId,
        spend: MarkSpent,
    ) -> Result<UsageRequest, GovernanceError> {
        let request = self.request(request_id).await?;
        let campaign = self.campaign(request.campaign_id).await?;
        if !actor.may_manage(&campaign) {
            return Err(GovernanceError::unauthorized(
                "only the campaign owner may record spending",
            ));
        }
        if spend.execution_proof.0.trim().is_empty() {
            return Err(GovernanceError::validation("execution proof reference is required"));
        }

        let spent = self
            .store
            .mark_spent(
                request_id,
                SpendRecord {
                    actual_minor: spend.actual_minor,
                    execution_proof: spend.execution_proof,
                    supporting_doc: spend.supporting_doc,
                    at: self.clock.now(),
                },
            )
            .await?;

        info!(
            campaign_id = %campaign.id,
            request_id = %request_id,
            requested = spent.requested_minor,
            actual = spend.actual_minor,
            "Usage request marked spent"
        );

        let donors = self.store.donor_totals(campaign.id).await?;
        let notifications = donors
            .into_iter()
            .filter(|(_, amount)| *amount > 0)
            .map(|(donor, _)| Notification {
                recipient_id: donor,
                campaign_id: campaign.id.to_string(),
                kind: NotificationKind::UsageSpent,
                title: "Funds spent".to_string(),
                message: format!(
                    "'{}' was executed for {} of {} requested",
                    spent.title, spend.actual_minor, spent.requested_minor
                ),
            })
            .collect();
        notify_best_effort(self.notifier.as_ref(), notifications).await;

        Ok(spent)
    }

    /// Withdraw a PENDING request, releasing its reservation.
    pub async fn cancel_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
    ) -> Result<UsageRequest, GovernanceError> {
        let request = self.request(request_id).await?;
        let campaign = self.campaign(request.campaign_id).await?;
        if !actor.may_manage(&campaign) {
            return Err(GovernanceError::unauthorized(
                "only the campaign owner may cancel usage requests",
            ));
        }

        let rejected = self.store.cancel(request_id, self.clock.now()).await?;
        info!(campaign_id = %campaign.id, request_id = %request_id, "Usage request rejected");

        notify_best_effort(
            self.notifier.as_ref(),
            vec![Notification {
                recipient_id: rejected.requester_id.clone(),
                campaign_id: campaign.id.to_string(),
                kind: NotificationKind::UsageRejected,
                title: "Usage request rejected".to_string(),
                message: format!("'{}' was withdrawn before approval", rejected.title),
            }],
        )
        .await;

        Ok(rejected)
    }

    pub async fn get_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
    ) -> Result<RequestView, GovernanceError> {
        let request = self.request(request_id).await?;
        self.view(actor, request).await
    }

    pub async fn list_requests(
        &self,
        actor: &Actor,
        campaign_id: CampaignId,
    ) -> Result<Vec<RequestView>, GovernanceError> {
        self.campaign(campaign_id).await?;
        let requests = self.store.usage_requests(campaign_id).await?;
        let mut views = Vec::with_capacity(requests.len());
        for request in requests {
            views.push(self.view(actor, request).await?);
        }
        Ok(views)
    }

    pub async fn ledger_summary(&self, campaign_id: CampaignId) -> Result<LedgerSummary, GovernanceError> {
        Ok(self.store.ledger_summary(campaign_id).await?)
    }

    async fn campaign(&self, id: CampaignId) -> Result<Campaign, GovernanceError> {
        self.store
            .campaign(id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(format!("campaign '{id}'")))
    }

    async fn request(&self, id: RequestId) -> Result<UsageRequest, GovernanceError> {
        self.store
            .usage_request(id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(format!("usage request '{id}'")))
    }

    async fn view(&self, actor: &Actor, request: UsageRequest) -> Result<RequestView, GovernanceError> {
        let totals = self.store.donor_totals(request.campaign_id).await?;
        let ballots = self.store.ballots(request.id).await?;
        let summary = self.store.ledger_summary(request.campaign_id).await?;
        Ok(RequestView {
            tally: ballots.tally(electorate(&totals)),
            my_vote: ballots.ballot(&actor.user_id).map(|ballot| ballot.choice),
            remaining_minor: summary.remaining_minor,
            request,
        })
    }

    async fn announce_approval(&self, request: &UsageRequest) -> Result<(), GovernanceError> {
        let campaign = self.campaign(request.campaign_id).await?;
        info!(
            campaign_id = %campaign.id,
            request_id = %request.id,
            amount = request.requested_minor,
            "Usage request approved"
        );
        notify_best_effort(
            self.notifier.as_ref(),
            vec![Notification {
                recipient_id: campaign.owner_id.clone(),
                campaign_id: campaign.id.to_string(),
                kind: NotificationKind::UsageApproved,
                title: "Usage request approved".to_string(),
                message: format!(
                    "'{}' for {} was approved by contributors",
                    request.title, request.requested_minor
                ),
            }],
        )
        .await;
        Ok(())
    }

    fn normalize_category(&self, raw: &str) -> Result<String, GovernanceError> {
        let category = raw.trim().to_lowercase();
        if category.is_empty() {
            return Ok(DEFAULT_CATEGORY.to_string());
        }
        if category.len() > self.config.max_category_len {
            return Err(GovernanceError::validation(format!(
                "category must be at most {} characters",
                self.config.max_category_len
            )));
        }
        Ok(category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::NotifyError;
    use crate::storage::MemoryGovernanceStore;
    use crate::types::DocumentRef;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<Notification>>,
    }

    impl Outbox {
        fn kinds(&self) -> Vec<NotificationKind> {
            self.sent.lock().unwrap().iter().map(|n| n.kind).collect()
        }
    }

    #[async_trait]
    impl NotificationSink for Outbox {
        async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    struct Fixture {
        governance: UsageGovernance,
        outbox: Arc<Outbox>,
        clock: Arc<ManualClock>,
        owner: Actor,
        campaign: Campaign,
    }

    async fn fixture(donations: &[(&str, u64)]) -> Fixture {
        let outbox = Arc::new(Outbox::default());
        let clock = Arc::new(ManualClock::default());
        let governance = UsageGovernance::new(
            Arc::new(MemoryGovernanceStore::new()),
            outbox.clone(),
            clock.clone(),
        );
        let owner = Actor::member("owner");
        let campaign = governance
            .register_campaign(
                &owner,
                NewCampaign {
                    title: "Community garden".to_string(),
                    goal_minor: 100,
                    deadline: Utc::now() + Duration::days(30),
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
        Fixture {
            governance,
            outbox,
            clock,
            owner,
            campaign,
        }
    }

    fn proposal(campaign_id: CampaignId, amount: u64) -> NewUsageRequest {
        NewUsageRequest {
            campaign_id,
            title: "Seeds".to_string(),
            requested_minor: amount,
            category: " Supplies ".to_string(),
            description: "Spring planting".to_string(),
            supporting_doc: Some(DocumentRef::new("doc-1")),
        }
    }

    #[tokio::test]
    async fn only_owner_or_administrator_may_propose() {
        let f = fixture(&[("a", 100)]).await;
        let err = f
            .governance
            .create_request(&Actor::member("a"), proposal(f.campaign.id, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Unauthorized(_)));

        let view = f
            .governance
            .create_request(&Actor::administrator("root"), proposal(f.campaign.id, 10))
            .await
            .unwrap();
        assert_eq!(view.request.status, UsageStatus::Pending);
        assert_eq!(view.request.category, "supplies");
        assert_eq!(view.remaining_minor, 90);
    }

    #[tokio::test]
    async fn over_budget_reports_remaining() {
        let f = fixture(&[("a", 50)]).await;
        let err = f
            .governance
            .create_request(&f.owner, proposal(f.campaign.id, 51))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GovernanceError::InsufficientBalance {
                requested: 51,
                remaining: 50
            }
        );
    }

    #[tokio::test]
    async fn zero_amount_is_a_validation_error() {
        let f = fixture(&[("a", 50)]).await;
        let err = f
            .governance
            .create_request(&f.owner, proposal(f.campaign.id, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Validation(_)));
    }

    #[tokio::test]
    async fn non_contributor_cannot_vote() {
        let f = fixture(&[("a", 50)]).await;
        let view = f
            .governance
            .create_request(&f.owner, proposal(f.campaign.id, 10))
            .await
            .unwrap();
        let err = f
            .governance
            .cast_vote(&Actor::member("stranger"), view.request.id, CastVote { approve: true })
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn revote_replaces_previous_choice() {
        let f = fixture(&[("a", 10), ("b", 20), ("c", 70)]).await;
        let id = f
            .governance
            .create_request(&f.owner, proposal(f.campaign.id, 10))
            .await
            .unwrap()
            .request
            .id;
        let c = Actor::member("c");

        f.governance.cast_vote(&c, id, CastVote { approve: false }).await.unwrap();
        let receipt = f.governance.cast_vote(&c, id, CastVote { approve: true }).await.unwrap();

        assert!(receipt.approved_now);
        assert_eq!(receipt.tally.rejecting_voters, 0);
        assert_eq!(receipt.tally.approving_weight_minor, 70);

        let view = f.governance.get_request(&c, id).await.unwrap();
        assert_eq!(view.my_vote, Some(VoteChoice::Approve));
        assert_eq!(f.outbox.kinds(), vec![NotificationKind::UsageApproved]);
    }

    #[tokio::test]
    async fn voting_after_approval_is_a_conflict() {
        let f = fixture(&[("a", 60), ("b", 40)]).await;
        let id = f
            .governance
            .create_request(&f.owner, proposal(f.campaign.id, 10))
            .await
            .unwrap()
            .request
            .id;
        let receipt = f
            .governance
            .cast_vote(&Actor::member("a"), id, CastVote { approve: true })
            .await
            .unwrap();
        assert_eq!(receipt.status, UsageStatus::Approved);

        let err = f
            .governance
            .cast_vote(&Actor::member("b"), id, CastVote { approve: false })
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::StateConflict(_)));
    }

    #[tokio::test]
    async fn spend_requires_approval_and_notifies_contributors() {
        let f = fixture(&[("a", 60), ("b", 40)]).await;
        let id = f
            .governance
            .create_request(&f.owner, proposal(f.campaign.id, 30))
            .await
            .unwrap()
            .request
            .id;
        let spend = MarkSpent {
            actual_minor: 25,
            execution_proof: DocumentRef::new("receipt-7"),
            supporting_doc: None,
        };

        let err = f
            .governance
            .mark_spent(&f.owner, id, spend.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::StateConflict(_)));

        f.governance
            .cast_vote(&Actor::member("a"), id, CastVote { approve: true })
            .await
            .unwrap();

        let too_much = MarkSpent {
            actual_minor: 31,
            ..spend.clone()
        };
        let err = f
            .governance
            .mark_spent(&f.owner, id, too_much)
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Validation(_)));

        let spent = f.governance.mark_spent(&f.owner, id, spend).await.unwrap();
        assert_eq!(spent.status, UsageStatus::Spent);
        assert_eq!(spent.actual_minor, Some(25));
        assert_eq!(spent.supporting_doc, Some(DocumentRef::new("doc-1")));

        let spent_notices = f
            .outbox
            .kinds()
            .into_iter()
            .filter(|kind| *kind == NotificationKind::UsageSpent)
            .count();
        assert_eq!(spent_notices, 2);
    }

    #[tokio::test]
    async fn cancel_releases_the_reservation() {
        let f = fixture(&[("a", 100)]).await;
        let id = f
            .governance
            .create_request(&f.owner, proposal(f.campaign.id, 80))
            .await
            .unwrap()
            .request
            .id;
        assert_eq!(
            f.governance.ledger_summary(f.campaign.id).await.unwrap().remaining_minor,
            20
        );

        let rejected = f.governance.cancel_request(&f.owner, id).await.unwrap();
        assert_eq!(rejected.status, UsageStatus::Rejected);
        assert_eq!(
            f.governance.ledger_summary(f.campaign.id).await.unwrap().remaining_minor,
            100
        );
        assert_eq!(f.outbox.kinds(), vec![NotificationKind::UsageRejected]);

        let err = f.governance.cancel_request(&f.owner, id).await.unwrap_err();
        assert!(matches!(err, GovernanceError::StateConflict(_)));
    }

    #[tokio::test]
    async fn list_requests_returns_views_oldest_first() {
        let f = fixture(&[("a", 100)]).await;
        for amount in [10, 20] {
            f.governance
                .create_request(&f.owner, proposal(f.campaign.id, amount))
                .await
                .unwrap();
            f.clock.advance(Duration::seconds(1));
        }
        let views = f
            .governance
            .list_requests(&Actor::member("a"), f.campaign.id)
            .await
            .unwrap();
        let amounts: Vec<u64> = views.iter().map(|v| v.request.requested_minor).collect();
        assert_eq!(amounts, vec![10, 20]);
        assert!(views.iter().all(|v| v.remaining_minor == 70 && v.my_vote.is_none()));

        let err = f
            .governance
            .list_requests(&f.owner, CampaignId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::NotFound(_)));
    }
}
