use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::voting::{VoteChoice, VoteTally};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Mirrored campaign identifier.
    CampaignId
);
uuid_id!(
    /// Off-chain usage request identifier.
    RequestId
);

/// Identity supplied by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference of a campaign inside the authoritative ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerRef(pub String);

impl LedgerRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LedgerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a document held by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentRef(pub String);

impl DocumentRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }
}

/// Role asserted by the identity collaborator. Ownership is decided per campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Administrator,
    Member,
}

/// Authenticated caller. The core trusts this identity without re-verifying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn member(user_id: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            role: Role::Member,
        }
    }

    pub fn administrator(user_id: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            role: Role::Administrator,
        }
    }

    pub fn is_administrator(&self) -> bool {
        self.role == Role::Administrator
    }

    pub fn may_manage(&self, campaign: &Campaign) -> bool {
        self.is_administrator() || campaign.owner_id == self.user_id
    }
}

/// Status derived from authoritative state at sync time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Locally mirrored campaign record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub owner_id: UserId,
    pub title: String,
    pub goal_minor: u64,
    pub raised_minor: u64,
    pub deadline: DateTime<Utc>,
    pub withdrawn: bool,
    pub status: CampaignStatus,
    pub ledger_ref: Option<LedgerRef>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Registration payload for a mirrored campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub title: String,
    pub goal_minor: u64,
    pub deadline: DateTime<Utc>,
    pub ledger_ref: Option<LedgerRef>,
}

/// Append-only contribution fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub campaign_id: CampaignId,
    pub donor_id: UserId,
    pub amount_minor: u64,
    pub contributed_at: DateTime<Utc>,
}

/// Lifecycle of an off-chain usage request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageStatus {
    Pending,
    Approved,
    Rejected,
    Spent,
}

impl UsageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Spent => "SPENT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            "SPENT" => Some(Self::Spent),
            _ => None,
        }
    }
}

impl fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proposed expenditure against a campaign's raised funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRequest {
    pub id: RequestId,
    pub campaign_id: CampaignId,
    pub requester_id: UserId,
    pub title: String,
    pub description: String,
    pub category: String,
    pub requested_minor: u64,
    pub actual_minor: Option<u64>,
    pub status: UsageStatus,
    pub supporting_doc: Option<DocumentRef>,
    pub execution_proof: Option<DocumentRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageRequest {
    /// Amount counted as spent: the recorded actual, falling back to the request.
    pub fn spent_minor(&self) -> u64 {
        self.actual_minor.unwrap_or(self.requested_minor)
    }
}

/// Stored off-chain vote. One row per (request, voter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageVote {
    pub request_id: RequestId,
    pub voter_id: UserId,
    pub choice: VoteChoice,
    pub weight_minor: u64,
    pub cast_at: DateTime<Utc>,
}

/// Create-usage-request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUsageRequest {
    pub campaign_id: CampaignId,
    pub title: String,
    pub requested_minor: u64,
    pub category: String,
    pub description: String,
    pub supporting_doc: Option<DocumentRef>,
}

/// Cast-vote payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CastVote {
    pub approve: bool,
}

/// Mark-spent payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkSpent {
    pub actual_minor: u64,
    pub execution_proof: DocumentRef,
    pub supporting_doc: Option<DocumentRef>,
}

/// Usage request enriched with live tallies and the caller's own vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestView {
    pub request: UsageRequest,
    pub tally: VoteTally,
    pub my_vote: Option<VoteChoice>,
    pub remaining_minor: u64,
}

/// Result of casting an off-chain vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub request_id: RequestId,
    pub status: UsageStatus,
    pub tally: VoteTally,
    pub weight_minor: u64,
    pub approved_now: bool,
}
