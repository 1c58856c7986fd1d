//! Governance persistence.
//!
//! Every operation that reads the ledger and then writes is a single store call,
//! so the balance check and the insert (or the vote write and the status
//! transition) can never observe different snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::accountant::{LedgerAccountant, LedgerSummary};
use crate::error::StoreError;
use crate::postgres::PostgresGovernanceStore;
use crate::types::{
    Campaign, CampaignId, CampaignStatus, Contribution, DocumentRef, RequestId, UsageRequest,
    UsageStatus, UsageVote, UserId,
};
use crate::voting::{Ballot, BallotBox, Electorate, MutableBallotBox, VoteChoice, VoteTally, VotingPolicy};

/// Storage backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// Keep all governance rows in process memory only.
    #[default]
    Memory,
    /// Persist governance rows in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Build the configured store, ensuring the schema for PostgreSQL.
pub async fn bootstrap_store(config: StorageConfig) -> Result<Arc<dyn GovernanceStore>, StoreError> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryGovernanceStore::new())),
        StorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresGovernanceStore::connect(&database_url, max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Authoritative fields written into the mirror by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorUpdate {
    pub raised_minor: u64,
    pub goal_minor: u64,
    pub deadline: DateTime<Utc>,
    pub withdrawn: bool,
    pub status: CampaignStatus,
    pub synced_at: DateTime<Utc>,
}

impl MirrorUpdate {
    /// Whether applying this update changes any mirrored field.
    pub fn differs_from(&self, campaign: &Campaign) -> bool {
        campaign.raised_minor != self.raised_minor
            || campaign.goal_minor != self.goal_minor
            || campaign.deadline != self.deadline
            || campaign.withdrawn != self.withdrawn
            || campaign.status != self.status
    }

    pub fn apply_to(&self, campaign: &mut Campaign) {
        campaign.raised_minor = self.raised_minor;
        campaign.goal_minor = self.goal_minor;
        campaign.deadline = self.deadline;
        campaign.withdrawn = self.withdrawn;
        campaign.status = self.status;
        campaign.last_synced_at = Some(self.synced_at);
    }
}

/// A vote about to be written. Weight is resolved inside the store.
#[derive(Debug, Clone)]
pub struct VoteCast {
    pub request_id: RequestId,
    pub voter_id: UserId,
    pub choice: VoteChoice,
    pub cast_at: DateTime<Utc>,
}

/// Vote write plus the auto-approval evaluation done in the same unit.
#[derive(Debug, Clone)]
pub struct VoteApplied {
    pub vote: UsageVote,
    pub request: UsageRequest,
    pub tally: VoteTally,
    pub approved_now: bool,
}

/// Result of an auto-approval evaluation without a new vote.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub request: UsageRequest,
    pub tally: VoteTally,
    pub approved_now: bool,
}

#[derive(Debug, Clone)]
pub struct SpendRecord {
    pub actual_minor: u64,
    pub execution_proof: DocumentRef,
    pub supporting_doc: Option<DocumentRef>,
    pub at: DateTime<Utc>,
}

/// Mirrored governance state.
#[async_trait]
pub trait GovernanceStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    async fn insert_campaign(&self, campaign: Campaign) -> Result<(), StoreError>;

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError>;

    /// Campaigns carrying a reference into the authoritative ledger.
    async fn linked_campaigns(&self) -> Result<Vec<Campaign>, StoreError>;

    /// Overwrite mirrored fields. Returns whether anything changed.
    async fn apply_mirror(&self, id: CampaignId, update: &MirrorUpdate) -> Result<bool, StoreError>;

    /// Append a contribution and bump the mirrored raised total.
    async fn record_contribution(&self, contribution: Contribution) -> Result<Campaign, StoreError>;

    async fn contribution_total(&self, campaign_id: CampaignId, donor: &UserId) -> Result<u64, StoreError>;

    async fn donor_totals(&self, campaign_id: CampaignId) -> Result<BTreeMap<UserId, u64>, StoreError>;

    async fn usage_request(&self, id: RequestId) -> Result<Option<UsageRequest>, StoreError>;

    /// Requests of a campaign, oldest first.
    async fn usage_requests(&self, campaign_id: CampaignId) -> Result<Vec<UsageRequest>, StoreError>;

    async fn ballots(&self, request_id: RequestId) -> Result<MutableBallotBox, StoreError>;

    async fn ledger_summary(&self, campaign_id: CampaignId) -> Result<LedgerSummary, StoreError>;

    /// Check the live remaining balance and insert in one atomic unit.
    async fn insert_within_budget(&self, request: UsageRequest) -> Result<LedgerSummary, StoreError>;

    /// Upsert a vote at the voter's current contribution weight and run auto-approval.
    async fn cast_vote(
        &self,
        cast: VoteCast,
        policy: &dyn VotingPolicy,
    ) -> Result<VoteApplied, StoreError>;

    /// Re-run auto-approval. A no-op unless the request is PENDING.
    async fn evaluate(
        &self,
        request_id: RequestId,
        policy: &dyn VotingPolicy,
        at: DateTime<Utc>,
    ) -> Result<Evaluation, StoreError>;

    /// PENDING -> REJECTED.
    async fn cancel(&self, request_id: RequestId, at: DateTime<Utc>) -> Result<UsageRequest, StoreError>;

    /// APPROVED -> SPENT, bounded by the live ledger.
    async fn mark_spent(&self, request_id: RequestId, spend: SpendRecord) -> Result<UsageRequest, StoreError>;
}

pub(crate) fn electorate(totals: &BTreeMap<UserId, u64>) -> Electorate {
    let donors = totals.values().filter(|amount| **amount > 0);
    Electorate {
        voters: donors.clone().count() as u64,
        weight_minor: donors.fold(0u64, |sum, amount| sum.saturating_add(*amount)),
    }
}

/// Move a PENDING request to APPROVED when the policy holds. Idempotent.
pub(crate) fn approve_if_satisfied(
    request: &mut UsageRequest,
    tally: &VoteTally,
    policy: &dyn VotingPolicy,
    at: DateTime<Utc>,
) -> bool {
    if request.status != UsageStatus::Pending || !policy.is_satisfied(tally) {
        return false;
    }
    request.status = UsageStatus::Approved;
    request.updated_at = at;
    true
}

pub(crate) fn apply_spend(request: &mut UsageRequest, spend: SpendRecord) {
    request.status = UsageStatus::Spent;
    request.actual_minor = Some(spend.actual_minor);
    request.execution_proof = Some(spend.execution_proof);
    if spend.supporting_doc.is_some() {
        request.supporting_doc = spend.supporting_doc;
    }
    request.updated_at = spend.at;
}

#[derive(Debug, Default)]
struct MemoryState {
    campaigns: HashMap<CampaignId, Campaign>,
    contributions: Vec<Contribution>,
    requests: HashMap<RequestId, UsageRequest>,
    ballots: HashMap<RequestId, MutableBallotBox>,
}

impl MemoryState {
    fn campaign(&self, id: CampaignId) -> Result<&Campaign, StoreError> {
        self.campaigns.get(&id).ok_or(StoreError::CampaignNotFound(id))
    }

    fn donor_totals(&self, campaign_id: CampaignId) -> BTreeMap<UserId, u64> {
        let mut totals = BTreeMap::new();
        for contribution in self
            .contributions
            .iter()
            .filter(|contribution| contribution.campaign_id == campaign_id)
        {
            let total = totals.entry(contribution.donor_id.clone()).or_insert(0u64);
            *total = total.saturating_add(contribution.amount_minor);
        }
        totals
    }

    fn summary(&self, campaign_id: CampaignId) -> Result<LedgerSummary, StoreError> {
        let campaign = self.campaign(campaign_id)?;
        Ok(LedgerAccountant::summarize(
            campaign.raised_minor,
            self.requests
                .values()
                .filter(|request| request.campaign_id == campaign_id),
        ))
    }

    fn request(&self, id: RequestId) -> Result<&UsageRequest, StoreError> {
        self.requests.get(&id).ok_or(StoreError::RequestNotFound(id))
    }

    fn tally(&self, request: &UsageRequest) -> VoteTally {
        let electorate = electorate(&self.donor_totals(request.campaign_id));
        self.ballots
            .get(&request.id)
            .map(|book| book.tally(electorate))
            .unwrap_or_else(|| MutableBallotBox::new().tally(electorate))
    }
}

/// In-memory store. A single async mutex makes each call one atomic unit.
#[derive(Debug, Default)]
pub struct MemoryGovernanceStore {
    state: Mutex<MemoryState>,
}

impl MemoryGovernanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GovernanceStore for MemoryGovernanceStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn insert_campaign(&self, campaign: Campaign) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        Ok(self.state.lock().await.campaigns.get(&id).cloned())
    }

    async fn linked_campaigns(&self) -> Result<Vec<Campaign>, StoreError> {
        let state = self.state.lock().await;
        let mut linked: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|campaign| campaign.ledger_ref.is_some())
            .cloned()
            .collect();
        linked.sort_by(|a, b| a.ledger_ref.cmp(&b.ledger_ref));
        Ok(linked)
    }

    async fn apply_mirror(&self, id: CampaignId, update: &MirrorUpdate) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let campaign = state
            .campaigns
            .get_mut(&id)
            .ok_or(StoreError::CampaignNotFound(id))?;
        let changed = update.differs_from(campaign);
        update.apply_to(campaign);
        Ok(changed)
    }

    async fn record_contribution(&self, contribution: Contribution) -> Result<Campaign, StoreError> {
        let mut state = self.state.lock().await;
        let campaign = state
            .campaigns
            .get_mut(&contribution.campaign_id)
            .ok_or(StoreError::CampaignNotFound(contribution.campaign_id))?;
        campaign.raised_minor = campaign.raised_minor.saturating_add(contribution.amount_minor);
        let updated = campaign.clone();
        state.contributions.push(contribution);
        Ok(updated)
    }

    async fn contribution_total(&self, campaign_id: CampaignId, donor: &UserId) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.donor_totals(campaign_id).get(donor).copied().unwrap_or(0))
    }

    async fn donor_totals(&self, campaign_id: CampaignId) -> Result<BTreeMap<UserId, u64>, StoreError> {
        Ok(self.state.lock().await.donor_totals(campaign_id))
    }

    async fn usage_request(&self, id: RequestId) -> Result<Option<UsageRequest>, StoreError> {
        Ok(self.state.lock().await.requests.get(&id).cloned())
    }

    async fn usage_requests(&self, campaign_id: CampaignId) -> Result<Vec<UsageRequest>, StoreError> {
        let state = self.state.lock().await;
        let mut requests: Vec<UsageRequest> = state
            .requests
            .values()
            .filter(|request| request.campaign_id == campaign_id)
            .cloned()
            .collect();
        requests.sort_by_key(|request| request.created_at);
        Ok(requests)
    }

    async fn ballots(&self, request_id: RequestId) -> Result<MutableBallotBox, StoreError> {
        let state = self.state.lock().await;
        Ok(state.ballots.get(&request_id).cloned().unwrap_or_default())
    }

    async fn ledger_summary(&self, campaign_id: CampaignId) -> Result<LedgerSummary, StoreError> {
        self.state.lock().await.summary(campaign_id)
    }

    async fn insert_within_budget(&self, request: UsageRequest) -> Result<LedgerSummary, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.summary(request.campaign_id)?;
        before.check_request(request.requested_minor)?;

        let campaign_id = request.campaign_id;
        state.requests.insert(request.id, request);
        state.summary(campaign_id)
    }

    async fn cast_vote(
        &self,
        cast: VoteCast,
        policy: &dyn VotingPolicy,
    ) -> Result<VoteApplied, StoreError> {
        let mut state = self.state.lock().await;
        let campaign_id = state.request(cast.request_id)?.campaign_id;
        let status = state.request(cast.request_id)?.status;
        if status != UsageStatus::Pending {
            return Err(StoreError::StatusConflict {
                id: cast.request_id,
                expected: UsageStatus::Pending,
                actual: status,
            });
        }

        let weight = state
            .donor_totals(campaign_id)
            .get(&cast.voter_id)
            .copied()
            .unwrap_or(0);
        let ballot = Ballot {
            voter: cast.voter_id.clone(),
            choice: cast.choice,
            weight_minor: weight,
            cast_at: cast.cast_at,
        };
        state
            .ballots
            .entry(cast.request_id)
            .or_default()
            .cast(ballot)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut request = state.request(cast.request_id)?.clone();
        let tally = state.tally(&request);
        let approved_now = approve_if_satisfied(&mut request, &tally, policy, cast.cast_at);
        state.requests.insert(request.id, request.clone());

        Ok(VoteApplied {
            vote: UsageVote {
                request_id: cast.request_id,
                voter_id: cast.voter_id,
                choice: cast.choice,
                weight_minor: weight,
                cast_at: cast.cast_at,
            },
            request,
            tally,
            approved_now,
        })
    }

    async fn evaluate(
        &self,
        request_id: RequestId,
        policy: &dyn VotingPolicy,
        at: DateTime<Utc>,
    ) -> Result<Evaluation, StoreError> {
        let mut state = self.state.lock().await;
        let mut request = state.request(request_id)?.clone();
        let tally = state.tally(&request);
        let approved_now = approve_if_satisfied(&mut request, &tally, policy, at);
        if approved_now {
            state.requests.insert(request.id, request.clone());
        }
        Ok(Evaluation {
            request,
            tally,
            approved_now,
        })
    }

    async fn cancel(&self, request_id: RequestId, at: DateTime<Utc>) -> Result<UsageRequest, StoreError> {
        let mut state = self.state.lock().await;
        let request = state
            .requests
            .get_mut(&request_id)
            .ok_or(StoreError::RequestNotFound(request_id))?;
        if request.status != UsageStatus::Pending {
            return Err(StoreError::StatusConflict {
                id: request_id,
                expected: UsageStatus::Pending,
                actual: request.status,
            });
        }
        request.status = UsageStatus::Rejected;
        request.updated_at = at;
        Ok(request.clone())
    }

    async fn mark_spent(&self, request_id: RequestId, spend: SpendRecord) -> Result<UsageRequest, StoreError> {
        let mut state = self.state.lock().await;
        let request = state.request(request_id)?.clone();
        let summary = state.summary(request.campaign_id)?;
        summary.check_spend(&request, spend.actual_minor)?;

        let request = state
            .requests
            .get_mut(&request_id)
            .ok_or(StoreError::RequestNotFound(request_id))?;
        apply_spend(request, spend);
        Ok(request.clone())
    }
}
