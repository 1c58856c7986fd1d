//! Ledger-native withdrawal governance.
//!
//! [`WithdrawalLedger`] is the authoritative state machine for campaign funds:
//! contributions, refunds and contributor-approved withdrawals. Every operation
//! runs under a sequencer that totally orders ledger calls, and every value
//! transfer follows checks-effects-interactions with a full rollback when the
//! transfer fails. A call made back into the ledger from inside a transfer is
//! refused with [`GovernanceError::Reentrancy`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::authority::{
    AuthoritativeCampaignState, AuthoritativeLedger, ConfirmationRef, ReleaseInstruction,
};
use crate::clock::Clock;
use crate::eligibility::Eligibility;
use crate::error::GovernanceError;
use crate::notify::{notify_best_effort, Notification, NotificationKind, NotificationSink};
use crate::types::{DocumentRef, LedgerRef, UserId};
use crate::voting::{
    Ballot, BallotBox, Electorate, ImmutableBallotBox, SnapshotThreshold, VoteChoice, VoteTally,
    VotingPolicy,
};

tokio::task_local! {
    static LEDGER_CALL: u64;
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Upper bound on one outbound transfer unless overridden.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
#[error("value transfer failed: {0}")]
pub struct TransferError(pub String);

/// Outbound value transfer performed after ledger effects are applied.
#[async_trait]
pub trait ValueTransfer: Send + Sync {
    async fn transfer(&self, recipient: &UserId, amount_minor: u64) -> Result<(), TransferError>;
}

/// Withdrawal proposal with a threshold snapshotted at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: u64,
    pub amount_minor: u64,
    pub usage: String,
    pub supporting_doc: Option<DocumentRef>,
    pub threshold: SnapshotThreshold,
    pub pledged_at_request_minor: u64,
    pub ballots: ImmutableBallotBox,
    pub executed: bool,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub confirmation: Option<ConfirmationRef>,
}

impl WithdrawalRequest {
    /// Weighted tally. Rejections are counted but never gate execution.
    pub fn tally(&self) -> VoteTally {
        self.ballots.tally(Electorate {
            voters: 0,
            weight_minor: self.pledged_at_request_minor,
        })
    }

    pub fn approvals_minor(&self) -> u64 {
        self.tally().approving_weight_minor
    }

    pub fn rejections_minor(&self) -> u64 {
        self.tally().rejecting_weight_minor
    }

    pub fn is_executable(&self) -> bool {
        !self.executed && self.threshold.is_satisfied(&self.tally())
    }
}

#[derive(Debug, Clone)]
struct LedgerCampaign {
    creator: UserId,
    goal_minor: u64,
    deadline: DateTime<Utc>,
    pledged_minor: u64,
    total_withdrawn_minor: u64,
    withdrawn: bool,
    contributions: BTreeMap<UserId, u64>,
    withdrawals: Vec<WithdrawalRequest>,
}

impl LedgerCampaign {
    fn available_minor(&self) -> u64 {
        self.pledged_minor.saturating_sub(self.total_withdrawn_minor)
    }

    fn snapshot(&self) -> AuthoritativeCampaignState {
        AuthoritativeCampaignState {
            raised_minor: self.pledged_minor,
            goal_minor: self.goal_minor,
            deadline: self.deadline,
            withdrawn: self.withdrawn,
        }
    }

    fn withdrawal_mut(&mut self, id: u64) -> Result<&mut WithdrawalRequest, GovernanceError> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.withdrawals.get_mut(index))
            .ok_or_else(|| GovernanceError::NotFound(format!("withdrawal request {id}")))
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    campaigns: BTreeMap<LedgerRef, LedgerCampaign>,
    balance_minor: u64,
    next_campaign: u64,
}

impl LedgerState {
    fn campaign(&self, ledger_ref: &LedgerRef) -> Result<&LedgerCampaign, GovernanceError> {
        self.campaigns
            .get(ledger_ref)
            .ok_or_else(|| GovernanceError::NotFound(format!("ledger campaign '{ledger_ref}'")))
    }

    fn campaign_mut(&mut self, ledger_ref: &LedgerRef) -> Result<&mut LedgerCampaign, GovernanceError> {
        self.campaigns
            .get_mut(ledger_ref)
            .ok_or_else(|| GovernanceError::NotFound(format!("ledger campaign '{ledger_ref}'")))
    }
}

/// Parameters of a new withdrawal proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWithdrawal {
    pub amount_minor: u64,
    pub usage: String,
    pub supporting_doc: Option<DocumentRef>,
    pub approval_percentage: u8,
}

/// In-process authoritative ledger for campaign funds.
pub struct WithdrawalLedger {
    instance: u64,
    state: Mutex<LedgerState>,
    sequencer: tokio::sync::Mutex<()>,
    transfer: Arc<dyn ValueTransfer>,
    transfer_timeout: Duration,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
}

impl WithdrawalLedger {
    pub fn new(
        transfer: Arc<dyn ValueTransfer>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(LedgerState::default()),
            sequencer: tokio::sync::Mutex::new(()),
            transfer,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            notifier,
            clock,
        }
    }

    /// Bound each outbound transfer. An elapsed bound counts as a failed transfer.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    async fn send(&self, recipient: &UserId, amount_minor: u64) -> Result<(), TransferError> {
        tokio::time::timeout(self.transfer_timeout, self.transfer.transfer(recipient, amount_minor))
            .await
            .unwrap_or_else(|_| {
                Err(TransferError(format!(
                    "no answer within {}ms",
                    self.transfer_timeout.as_millis()
                )))
            })
    }

    fn state(&self) -> Result<MutexGuard<'_, LedgerState>, GovernanceError> {
        self.state
            .lock()
            .map_err(|_| GovernanceError::Storage("ledger state lock poisoned".to_string()))
    }

    /// Run `op` as one totally ordered ledger call.
    ///
    /// The sequencer is held for the whole operation including any transfer.
    /// A nested call from the same task would wait on it forever, so it is
    /// detected through the task-local marker and refused instead.
    async fn serialized<T>(
        &self,
        op: impl Future<Output = Result<T, GovernanceError>>,
    ) -> Result<T, GovernanceError> {
        if LEDGER_CALL
            .try_with(|instance| *instance == self.instance)
            .unwrap_or(false)
        {
            warn!("Reentrant ledger call rejected");
            return Err(GovernanceError::Reentrancy);
        }
        let _turn = self.sequencer.lock().await;
        LEDGER_CALL.scope(self.instance, op).await
    }

    pub async fn create_campaign(
        &self,
        creator: &UserId,
        goal_minor: u64,
        deadline: DateTime<Utc>,
    ) -> Result<LedgerRef, GovernanceError> {
        self.serialized(async {
            if goal_minor == 0 {
                return Err(GovernanceError::validation("goal must be greater than zero"));
            }
            if deadline <= self.clock.now() {
                return Err(GovernanceError::validation("deadline must be in the future"));
            }
            let mut state = self.state()?;
            state.next_campaign += 1;
            let ledger_ref = LedgerRef::new(format!("campaign-{}", state.next_campaign));
            state.campaigns.insert(
                ledger_ref.clone(),
                LedgerCampaign {
                    creator: creator.clone(),
                    goal_minor,
                    deadline,
                    pledged_minor: 0,
                    total_withdrawn_minor: 0,
                    withdrawn: false,
                    contributions: BTreeMap::new(),
                    withdrawals: Vec::new(),
                },
            );
            info!(ledger_ref = %ledger_ref, creator = %creator, goal = goal_minor, "Ledger campaign created");
            Ok(ledger_ref)
        })
        .await
    }

    /// Record a contribution. Returns the donor's running total.
    pub async fn donate(
        &self,
        donor: &UserId,
        ledger_ref: &LedgerRef,
        amount_minor: u64,
    ) -> Result<u64, GovernanceError> {
        self.serialized(async {
            if amount_minor == 0 {
                return Err(GovernanceError::validation("donation must be greater than zero"));
            }
            let now = self.clock.now();
            let mut state = self.state()?;
            let LedgerState {
                campaigns,
                balance_minor,
                ..
            } = &mut *state;
            let campaign = campaigns
                .get_mut(ledger_ref)
                .ok_or_else(|| GovernanceError::NotFound(format!("ledger campaign '{ledger_ref}'")))?;
            if now > campaign.deadline {
                return Err(GovernanceError::conflict("campaign deadline has passed"));
            }

            let total = campaign.contributions.entry(donor.clone()).or_insert(0);
            *total = total.saturating_add(amount_minor);
            let donor_total = *total;
            campaign.pledged_minor = campaign.pledged_minor.saturating_add(amount_minor);
            *balance_minor = balance_minor.saturating_add(amount_minor);

            debug!(ledger_ref = %ledger_ref, donor = %donor, amount = amount_minor, "Donation recorded");
            Ok(donor_total)
        })
        .await
    }

    /// Return a donor's contribution after a failed campaign.
    pub async fn refund(&self, donor: &UserId, ledger_ref: &LedgerRef) -> Result<u64, GovernanceError> {
        self.serialized(self.refund_inner(donor, ledger_ref)).await
    }

    async fn refund_inner(&self, donor: &UserId, ledger_ref: &LedgerRef) -> Result<u64, GovernanceError> {
        let now = self.clock.now();
        let amount = {
            let mut state = self.state()?;
            let LedgerState {
                campaigns,
                balance_minor,
                ..
            } = &mut *state;
            let campaign = campaigns
                .get_mut(ledger_ref)
                .ok_or_else(|| GovernanceError::NotFound(format!("ledger campaign '{ledger_ref}'")))?;

            let eligibility = Eligibility::evaluate(&campaign.snapshot(), now);
            if !eligibility.can_refund {
                return Err(GovernanceError::conflict(
                    "refunds require the deadline passed and the goal missed",
                ));
            }
            let amount = campaign.contributions.get(donor).copied().unwrap_or(0);
            if amount == 0 {
                return Err(GovernanceError::conflict("no contribution to refund"));
            }
            if *balance_minor < amount {
                return Err(GovernanceError::InsufficientBalance {
                    requested: amount,
                    remaining: *balance_minor,
                });
            }

            campaign.contributions.insert(donor.clone(), 0);
            campaign.pledged_minor -= amount;
            *balance_minor -= amount;
            amount
        };

        if let Err(err) = self.send(donor, amount).await {
            let mut state = self.state()?;
            state.balance_minor += amount;
            let campaign = state.campaign_mut(ledger_ref)?;
            campaign.contributions.insert(donor.clone(), amount);
            campaign.pledged_minor += amount;
            warn!(ledger_ref = %ledger_ref, donor = %donor, error = %err, "Refund transfer failed; rolled back");
            return Err(GovernanceError::external(format!(
                "refund transfer failed, no state changed: {err}"
            )));
        }

        info!(ledger_ref = %ledger_ref, donor = %donor, amount = amount, "Refund completed");
        Ok(amount)
    }

    /// Propose a withdrawal. Only the creator, after a successful campaign ends.
    pub async fn request_withdrawal(
        &self,
        caller: &UserId,
        ledger_ref: &LedgerRef,
        proposal: NewWithdrawal,
    ) -> Result<WithdrawalRequest, GovernanceError> {
        self.serialized(async {
            let now = self.clock.now();
            let mut state = self.state()?;
            let campaign = state.campaign_mut(ledger_ref)?;

            if campaign.creator != *caller {
                return Err(GovernanceError::unauthorized(
                    "only the campaign creator may request a withdrawal",
                ));
            }
            if campaign.pledged_minor < campaign.goal_minor {
                return Err(GovernanceError::conflict("funding goal not reached"));
            }
            if now <= campaign.deadline {
                return Err(GovernanceError::conflict("campaign deadline has not passed"));
            }
            if proposal.amount_minor == 0 {
                return Err(GovernanceError::validation("withdrawal amount must be greater than zero"));
            }
            let available = campaign.available_minor();
            if proposal.amount_minor > available {
                return Err(GovernanceError::InsufficientBalance {
                    requested: proposal.amount_minor,
                    remaining: available,
                });
            }
            let threshold =
                SnapshotThreshold::snapshot(campaign.pledged_minor, proposal.approval_percentage)?;

            let request = WithdrawalRequest {
                id: campaign.withdrawals.len() as u64,
                amount_minor: proposal.amount_minor,
                usage: proposal.usage,
                supporting_doc: proposal.supporting_doc,
                threshold,
                pledged_at_request_minor: campaign.pledged_minor,
                ballots: ImmutableBallotBox::new(),
                executed: false,
                created_at: now,
                executed_at: None,
                confirmation: None,
            };
            campaign.withdrawals.push(request.clone());

            info!(
                ledger_ref = %ledger_ref,
                withdrawal_id = request.id,
                amount = request.amount_minor,
                threshold = threshold.required_weight_minor,
                "Withdrawal requested"
            );
            Ok(request)
        })
        .await
    }

    pub async fn approve_withdrawal(
        &self,
        voter: &UserId,
        ledger_ref: &LedgerRef,
        withdrawal_id: u64,
    ) -> Result<VoteTally, GovernanceError> {
        self.serialized(self.cast(voter, ledger_ref, withdrawal_id, VoteChoice::Approve))
            .await
    }

    pub async fn reject_withdrawal(
        &self,
        voter: &UserId,
        ledger_ref: &LedgerRef,
        withdrawal_id: u64,
    ) -> Result<VoteTally, GovernanceError> {
        self.serialized(self.cast(voter, ledger_ref, withdrawal_id, VoteChoice::Reject))
            .await
    }

    async fn cast(
        &self,
        voter: &UserId,
        ledger_ref: &LedgerRef,
        withdrawal_id: u64,
        choice: VoteChoice,
    ) -> Result<VoteTally, GovernanceError> {
        let now = self.clock.now();
        let mut state = self.state()?;
        let campaign = state.campaign_mut(ledger_ref)?;
        let weight = campaign.contributions.get(voter).copied().unwrap_or(0);
        if weight == 0 {
            return Err(GovernanceError::unauthorized("only contributors may vote"));
        }

        let request = campaign.withdrawal_mut(withdrawal_id)?;
        if request.executed {
            return Err(GovernanceError::conflict("withdrawal already executed"));
        }
        request.ballots.cast(Ballot {
            voter: voter.clone(),
            choice,
            weight_minor: weight,
            cast_at: now,
        })?;

        let tally = request.tally();
        debug!(
            ledger_ref = %ledger_ref,
            withdrawal_id = withdrawal_id,
            voter = %voter,
            choice = choice.as_str(),
            approvals = tally.approving_weight_minor,
            rejections = tally.rejecting_weight_minor,
            "Withdrawal vote recorded"
        );
        Ok(tally)
    }

    /// Execute an approved withdrawal and transfer the funds to the creator.
    ///
    /// The executed flag and withdrawn total are applied before the transfer and
    /// restored if it fails, so a failed transfer leaves no trace.
    pub async fn execute_withdrawal(
        &self,
        caller: &UserId,
        ledger_ref: &LedgerRef,
        withdrawal_id: u64,
    ) -> Result<ConfirmationRef, GovernanceError> {
        self.serialized(self.execute_inner(caller, ledger_ref, withdrawal_id))
            .await
    }

    async fn execute_inner(
        &self,
        caller: &UserId,
        ledger_ref: &LedgerRef,
        withdrawal_id: u64,
    ) -> Result<ConfirmationRef, GovernanceError> {
        let (amount, previously_withdrawn, contributors) = {
            let mut state = self.state()?;
            let LedgerState {
                campaigns,
                balance_minor,
                ..
            } = &mut *state;
            let campaign = campaigns
                .get_mut(ledger_ref)
                .ok_or_else(|| GovernanceError::NotFound(format!("ledger campaign '{ledger_ref}'")))?;

            if campaign.creator != *caller {
                return Err(GovernanceError::unauthorized(
                    "only the campaign creator may execute a withdrawal",
                ));
            }
            let available = campaign.available_minor();
            let previously_withdrawn = campaign.withdrawn;
            let contributors: Vec<UserId> = campaign
                .contributions
                .iter()
                .filter(|(_, amount)| **amount > 0)
                .map(|(donor, _)| donor.clone())
                .collect();

            let request = campaign.withdrawal_mut(withdrawal_id)?;
            if request.executed {
                return Err(GovernanceError::conflict("withdrawal already executed"));
            }
            let tally = request.tally();
            if !request.threshold.is_satisfied(&tally) {
                warn!(
                    ledger_ref = %ledger_ref,
                    withdrawal_id = withdrawal_id,
                    approvals = tally.approving_weight_minor,
                    required = request.threshold.required_weight_minor,
                    "Withdrawal execution refused below threshold"
                );
                return Err(GovernanceError::conflict(format!(
                    "approval threshold not met: {} of {} required",
                    tally.approving_weight_minor, request.threshold.required_weight_minor
                )));
            }
            let amount = request.amount_minor;
            if *balance_minor < amount {
                return Err(GovernanceError::InsufficientBalance {
                    requested: amount,
                    remaining: *balance_minor,
                });
            }
            if available < amount {
                return Err(GovernanceError::InsufficientBalance {
                    requested: amount,
                    remaining: available,
                });
            }

            request.executed = true;
            campaign.total_withdrawn_minor += amount;
            campaign.withdrawn = campaign.total_withdrawn_minor >= campaign.pledged_minor;
            *balance_minor -= amount;
            (amount, previously_withdrawn, contributors)
        };

        let creator = caller.clone();
        if let Err(err) = self.send(&creator, amount).await {
            let mut state = self.state()?;
            state.balance_minor += amount;
            let campaign = state.campaign_mut(ledger_ref)?;
            campaign.total_withdrawn_minor -= amount;
            campaign.withdrawn = previously_withdrawn;
            campaign.withdrawal_mut(withdrawal_id)?.executed = false;
            warn!(
                ledger_ref = %ledger_ref,
                withdrawal_id = withdrawal_id,
                error = %err,
                "Withdrawal transfer failed; rolled back"
            );
            return Err(GovernanceError::external(format!(
                "withdrawal transfer failed, no state changed: {err}"
            )));
        }

        let executed_at = self.clock.now();
        let confirmation = confirmation_ref(ledger_ref, withdrawal_id, amount, executed_at);
        {
            let mut state = self.state()?;
            let request = state.campaign_mut(ledger_ref)?.withdrawal_mut(withdrawal_id)?;
            request.executed_at = Some(executed_at);
            request.confirmation = Some(confirmation.clone());
        }

        info!(
            ledger_ref = %ledger_ref,
            withdrawal_id = withdrawal_id,
            amount = amount,
            confirmation = %confirmation,
            "Withdrawal executed"
        );

        let notifications = std::iter::once(creator)
            .chain(contributors)
            .map(|recipient| Notification {
                recipient_id: recipient,
                campaign_id: ledger_ref.to_string(),
                kind: NotificationKind::WithdrawalExecuted,
                title: "Withdrawal executed".to_string(),
                message: format!("{amount} released under withdrawal request {withdrawal_id}"),
            })
            .collect();
        notify_best_effort(self.notifier.as_ref(), notifications).await;

        Ok(confirmation)
    }

    pub async fn campaign_state(
        &self,
        ledger_ref: &LedgerRef,
    ) -> Result<AuthoritativeCampaignState, GovernanceError> {
        self.serialized(async { Ok(self.state()?.campaign(ledger_ref)?.snapshot()) })
            .await
    }

    pub async fn withdrawal(
        &self,
        ledger_ref: &LedgerRef,
        withdrawal_id: u64,
    ) -> Result<WithdrawalRequest, GovernanceError> {
        self.serialized(async {
            let state = self.state()?;
            let campaign = state.campaign(ledger_ref)?;
            usize::try_from(withdrawal_id)
                .ok()
                .and_then(|index| campaign.withdrawals.get(index))
                .cloned()
                .ok_or_else(|| GovernanceError::NotFound(format!("withdrawal request {withdrawal_id}")))
        })
        .await
    }

    pub async fn has_voted(
        &self,
        ledger_ref: &LedgerRef,
        withdrawal_id: u64,
        voter: &UserId,
    ) -> Result<bool, GovernanceError> {
        let request = self.withdrawal(ledger_ref, withdrawal_id).await?;
        Ok(request.ballots.ballot(voter).is_some())
    }

    pub async fn contribution_of(
        &self,
        ledger_ref: &LedgerRef,
        donor: &UserId,
    ) -> Result<u64, GovernanceError> {
        self.serialized(async {
            let state = self.state()?;
            Ok(state
                .campaign(ledger_ref)?
                .contributions
                .get(donor)
                .copied()
                .unwrap_or(0))
        })
        .await
    }

    /// Funds held across all campaigns.
    pub async fn balance_minor(&self) -> Result<u64, GovernanceError> {
        self.serialized(async { Ok(self.state()?.balance_minor) })
            .await
    }
}

#[async_trait]
impl AuthoritativeLedger for WithdrawalLedger {
    async fn campaign_state(
        &self,
        ledger_ref: &LedgerRef,
    ) -> Result<AuthoritativeCampaignState, GovernanceError> {
        WithdrawalLedger::campaign_state(self, ledger_ref).await
    }

    async fn submit_release(
        &self,
        release: ReleaseInstruction,
    ) -> Result<ConfirmationRef, GovernanceError> {
        self.execute_withdrawal(&release.caller, &release.ledger_ref, release.withdrawal_id)
            .await
    }
}

fn confirmation_ref(
    ledger_ref: &LedgerRef,
    withdrawal_id: u64,
    amount_minor: u64,
    executed_at: DateTime<Utc>,
) -> ConfirmationRef {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ledger_ref.as_str().as_bytes());
    hasher.update(&withdrawal_id.to_le_bytes());
    hasher.update(&amount_minor.to_le_bytes());
    hasher.update(&executed_at.timestamp_micros().to_le_bytes());
    ConfirmationRef(hasher.finalize().to_hex().to_string())
}
