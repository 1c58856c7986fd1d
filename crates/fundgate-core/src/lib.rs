//! Fund-release governance core.
//!
//! This crate decides, records and enforces how money raised by a campaign may be
//! spent: contributor-weighted voting on usage requests, a ledger recomputed from
//! source rows on every decision, a ledger-native withdrawal state machine with
//! rollback on failed transfers, and reconciliation of the local mirror against
//! the authoritative ledger.

#![deny(unsafe_code)]

pub mod accountant;
pub mod authority;
pub mod clock;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod notify;
pub mod postgres;
pub mod storage;
pub mod sync;
pub mod types;
pub mod usage;
pub mod voting;
pub mod withdrawal;

pub use accountant::{CategoryTotals, LedgerAccountant, LedgerSummary};
pub use authority::{
    AuthoritativeCampaignState, AuthoritativeLedger, ConfirmationRef, ReleaseInstruction,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GovernanceConfig, SyncConfig, MIN_SYNC_INTERVAL};
pub use eligibility::{check_eligibility, Eligibility};
pub use error::{GovernanceError, StoreError};
pub use notify::{
    notify_best_effort, DiscardSink, Notification, NotificationKind, NotificationSink, NotifyError,
};
pub use postgres::PostgresGovernanceStore;
pub use storage::{
    bootstrap_store, GovernanceStore, MemoryGovernanceStore, MirrorUpdate, StorageConfig,
};
pub use sync::{derive_status, SyncCoordinator, SyncOutcome, SyncReport};
pub use types::{
    Actor, Campaign, CampaignId, CampaignStatus, CastVote, Contribution, DocumentRef, LedgerRef,
    MarkSpent, NewCampaign, NewUsageRequest, RequestId, RequestView, Role, UsageRequest,
    UsageStatus, UsageVote, UserId, VoteReceipt,
};
pub use usage::UsageGovernance;
pub use voting::{
    Ballot, BallotBox, CastOutcome, Electorate, ImmutableBallotBox, MajorityPolicy,
    MutableBallotBox, SnapshotThreshold, VoteChoice, VoteTally, VotingPolicy,
};
pub use withdrawal::{
    NewWithdrawal, TransferError, ValueTransfer, WithdrawalLedger, WithdrawalRequest,
    DEFAULT_TRANSFER_TIMEOUT,
};
