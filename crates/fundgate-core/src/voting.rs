//! Contributor-weighted voting shared by the off-chain and ledger-native paths.
//!
//! Both paths count ballots the same way and hand the resulting [`VoteTally`] to a
//! [`VotingPolicy`]. They differ only in the ballot box: the off-chain store lets a
//! contributor overwrite an earlier vote, the ledger accepts exactly one cast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::GovernanceError;
use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Approve,
    Reject,
}

impl VoteChoice {
    pub fn from_approve(approve: bool) -> Self {
        if approve {
            Self::Approve
        } else {
            Self::Reject
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub voter: UserId,
    pub choice: VoteChoice,
    pub weight_minor: u64,
    pub cast_at: DateTime<Utc>,
}

/// Who may be counted: distinct contributors and their combined contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Electorate {
    pub voters: u64,
    pub weight_minor: u64,
}

/// Counted ballots relative to an electorate.
///
/// Voter counts include only ballots carrying contribution weight, so an
/// administrator voting without a contribution never inflates the donor rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoteTally {
    pub approving_voters: u64,
    pub rejecting_voters: u64,
    pub eligible_voters: u64,
    pub approving_weight_minor: u64,
    pub rejecting_weight_minor: u64,
    pub eligible_weight_minor: u64,
}

impl VoteTally {
    pub fn count<'a>(ballots: impl IntoIterator<Item = &'a Ballot>, electorate: Electorate) -> Self {
        let mut tally = Self {
            eligible_voters: electorate.voters,
            eligible_weight_minor: electorate.weight_minor,
            ..Self::default()
        };
        for ballot in ballots {
            let counted = u64::from(ballot.weight_minor > 0);
            match ballot.choice {
                VoteChoice::Approve => {
                    tally.approving_voters += counted;
                    tally.approving_weight_minor =
                        tally.approving_weight_minor.saturating_add(ballot.weight_minor);
                }
                VoteChoice::Reject => {
                    tally.rejecting_voters += counted;
                    tally.rejecting_weight_minor =
                        tally.rejecting_weight_minor.saturating_add(ballot.weight_minor);
                }
            }
        }
        tally
    }

    /// Approving donors over distinct donors, for reporting only.
    pub fn donor_approval_rate(&self) -> f64 {
        ratio(self.approving_voters, self.eligible_voters)
    }

    /// Approving weight over total donated, for reporting only.
    pub fn donation_approval_rate(&self) -> f64 {
        ratio(self.approving_weight_minor, self.eligible_weight_minor)
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Decides whether a tally makes a proposal binding.
pub trait VotingPolicy: Send + Sync {
    fn is_satisfied(&self, tally: &VoteTally) -> bool;

    fn describe(&self) -> String;
}

/// Off-chain rule: approving donors OR approving weight strictly above a fraction.
///
/// Rates are compared in integer arithmetic, so exactly one half never passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MajorityPolicy {
    pub numerator: u64,
    pub denominator: u64,
}

impl MajorityPolicy {
    pub fn simple() -> Self {
        Self {
            numerator: 1,
            denominator: 2,
        }
    }

    pub fn new(numerator: u64, denominator: u64) -> Result<Self, GovernanceError> {
        if denominator == 0 || numerator >= denominator {
            return Err(GovernanceError::validation(format!(
                "majority fraction {numerator}/{denominator} must lie in [0, 1)"
            )));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    fn exceeds(&self, part: u64, whole: u64) -> bool {
        whole > 0 && u128::from(part) * u128::from(self.denominator)
            > u128::from(whole) * u128::from(self.numerator)
    }
}

impl Default for MajorityPolicy {
    fn default() -> Self {
        Self::simple()
    }
}

impl VotingPolicy for MajorityPolicy {
    fn is_satisfied(&self, tally: &VoteTally) -> bool {
        self.exceeds(tally.approving_voters, tally.eligible_voters)
            || self.exceeds(tally.approving_weight_minor, tally.eligible_weight_minor)
    }

    fn describe(&self) -> String {
        format!(
            "donor or donation approval rate > {}/{}",
            self.numerator, self.denominator
        )
    }
}

/// Ledger-native rule: weighted approvals must reach a threshold fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotThreshold {
    pub required_weight_minor: u64,
    pub percentage: u8,
}

impl SnapshotThreshold {
    /// Snapshot `pledged × percentage ⁄ 100` (rounded down). Never recomputed afterwards.
    pub fn snapshot(pledged_minor: u64, percentage: u8) -> Result<Self, GovernanceError> {
        if percentage == 0 || percentage > 100 {
            return Err(GovernanceError::validation(format!(
                "approval percentage {percentage} must be in (0, 100]"
            )));
        }
        let required = u128::from(pledged_minor) * u128::from(percentage) / 100;
        Ok(Self {
            // bounded by pledged_minor
            required_weight_minor: required as u64,
            percentage,
        })
    }
}

impl VotingPolicy for SnapshotThreshold {
    fn is_satisfied(&self, tally: &VoteTally) -> bool {
        tally.approving_weight_minor >= self.required_weight_minor
    }

    fn describe(&self) -> String {
        format!(
            "weighted approvals >= {} ({}% of pledged at request time)",
            self.required_weight_minor, self.percentage
        )
    }
}

/// Outcome of placing a ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOutcome {
    Recorded,
    Replaced { previous: VoteChoice },
}

/// Storage discipline for ballots on a single proposal.
pub trait BallotBox {
    fn cast(&mut self, ballot: Ballot) -> Result<CastOutcome, GovernanceError>;

    fn ballots(&self) -> &BTreeMap<UserId, Ballot>;

    fn ballot(&self, voter: &UserId) -> Option<&Ballot> {
        self.ballots().get(voter)
    }

    fn tally(&self, electorate: Electorate) -> VoteTally {
        VoteTally::count(self.ballots().values(), electorate)
    }
}

/// Re-votable box: a later ballot replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableBallotBox {
    ballots: BTreeMap<UserId, Ballot>,
}

impl MutableBallotBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ballots(ballots: impl IntoIterator<Item = Ballot>) -> Self {
        let mut book = Self::new();
        for ballot in ballots {
            book.ballots.insert(ballot.voter.clone(), ballot);
        }
        book
    }
}

impl BallotBox for MutableBallotBox {
    fn cast(&mut self, ballot: Ballot) -> Result<CastOutcome, GovernanceError> {
        let previous = self.ballots.insert(ballot.voter.clone(), ballot);
        Ok(match previous {
            Some(previous) => CastOutcome::Replaced {
                previous: previous.choice,
            },
            None => CastOutcome::Recorded,
        })
    }

    fn ballots(&self) -> &BTreeMap<UserId, Ballot> {
        &self.ballots
    }
}

/// Single-cast box: each voter gets exactly one irrevocable ballot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImmutableBallotBox {
    ballots: BTreeMap<UserId, Ballot>,
}

impl ImmutableBallotBox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BallotBox for ImmutableBallotBox {
    fn cast(&mut self, ballot: Ballot) -> Result<CastOutcome, GovernanceError> {
        if self.ballots.contains_key(&ballot.voter) {
            return Err(GovernanceError::conflict(format!(
                "'{}' has already voted on this request",
                ballot.voter
            )));
        }
        self.ballots.insert(ballot.voter.clone(), ballot);
        Ok(CastOutcome::Recorded)
    }

    fn ballots(&self) -> &BTreeMap<UserId, Ballot> {
        &self.ballots
    }
}
