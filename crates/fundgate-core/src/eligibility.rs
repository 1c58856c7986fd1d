use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::authority::{AuthoritativeCampaignState, AuthoritativeLedger};
use crate::clock::Clock;
use crate::error::GovernanceError;
use crate::types::LedgerRef;

/// Why release is, or is not, currently permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub goal_reached: bool,
    pub deadline_passed: bool,
    pub already_withdrawn: bool,
    /// Goal reached and not yet withdrawn. The deadline is not required.
    pub can_withdraw: bool,
    /// Deadline passed and goal missed.
    pub can_refund: bool,
}

impl Eligibility {
    pub fn evaluate(state: &AuthoritativeCampaignState, now: DateTime<Utc>) -> Self {
        let goal_reached = state.raised_minor >= state.goal_minor;
        let deadline_passed = now > state.deadline;
        let already_withdrawn = state.withdrawn;

        Self {
            goal_reached,
            deadline_passed,
            already_withdrawn,
            can_withdraw: goal_reached && !already_withdrawn,
            can_refund: deadline_passed && !goal_reached,
        }
    }

    /// Human-readable reason release is blocked, if it is.
    pub fn withdraw_blocker(&self) -> Option<&'static str> {
        if self.already_withdrawn {
            Some("funds already withdrawn")
        } else if !self.goal_reached {
            Some("funding goal not reached")
        } else {
            None
        }
    }
}

/// Reads authoritative state and evaluates eligibility against it.
///
/// A failed or unanswered lookup surfaces as [`GovernanceError::External`];
/// no assumed state is used.
pub async fn check_eligibility(
    ledger: &dyn AuthoritativeLedger,
    ledger_ref: &LedgerRef,
    clock: &dyn Clock,
    timeout: Duration,
) -> Result<Eligibility, GovernanceError> {
    let state = tokio::time::timeout(timeout, ledger.campaign_state(ledger_ref))
        .await
        .map_err(|_| {
            GovernanceError::external(format!(
                "eligibility lookup of '{ledger_ref}' timed out after {}ms",
                timeout.as_millis()
            ))
        })??;
    let eligibility = Eligibility::evaluate(&state, clock.now());
    debug!(
        ledger_ref = %ledger_ref,
        can_withdraw = eligibility.can_withdraw,
        can_refund = eligibility.can_refund,
        "Eligibility evaluated"
    );
    Ok(eligibility)
}
