use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GovernanceError;
use crate::types::{LedgerRef, UserId};

/// Campaign state as held by the authoritative ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthoritativeCampaignState {
    pub raised_minor: u64,
    pub goal_minor: u64,
    pub deadline: DateTime<Utc>,
    pub withdrawn: bool,
}

/// Instruction to execute an approved withdrawal on the authoritative ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInstruction {
    pub ledger_ref: LedgerRef,
    pub withdrawal_id: u64,
    pub caller: UserId,
}

/// Confirmation returned once a release is final.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfirmationRef(pub String);

impl std::fmt::Display for ConfirmationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// System of record for campaign funds.
///
/// Consumed as an eventually-consistent dependency: reads are reconciled into the
/// local mirror on a timer rather than performed for every governance decision.
#[async_trait]
pub trait AuthoritativeLedger: Send + Sync {
    async fn campaign_state(
        &self,
        ledger_ref: &LedgerRef,
    ) -> Result<AuthoritativeCampaignState, GovernanceError>;

    async fn submit_release(
        &self,
        release: ReleaseInstruction,
    ) -> Result<ConfirmationRef, GovernanceError>;
}
