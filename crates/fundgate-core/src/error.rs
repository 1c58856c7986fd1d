use crate::types::{CampaignId, RequestId, UsageStatus};
use thiserror::Error;

/// Governance engine errors.
///
/// Financial rejections carry the concrete blocking figure so callers can
/// react without a second round trip.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GovernanceError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("requested amount {requested} exceeds remaining balance {remaining}")]
    InsufficientBalance { requested: u64, remaining: u64 },

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("reentrant call rejected while a ledger operation is in progress")]
    Reentrancy,

    #[error("external dependency failed: {0}")]
    External(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl GovernanceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::StateConflict(message.into())
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::External(message.into())
    }

    /// The remaining-balance figure that blocked the operation, if any.
    pub fn blocking_remaining(&self) -> Option<u64> {
        match self {
            Self::InsufficientBalance { remaining, .. } => Some(*remaining),
            _ => None,
        }
    }
}

/// Errors raised by a [`crate::storage::GovernanceStore`] backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("campaign '{0}' not found")]
    CampaignNotFound(CampaignId),

    #[error("usage request '{0}' not found")]
    RequestNotFound(RequestId),

    #[error("requested amount {requested} exceeds remaining balance {remaining}")]
    OverBudget { requested: u64, remaining: u64 },

    #[error("usage request '{id}' is {actual}, expected {expected}")]
    StatusConflict {
        id: RequestId,
        expected: UsageStatus,
        actual: UsageStatus,
    },

    #[error("{0}")]
    Rejected(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

impl From<StoreError> for GovernanceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CampaignNotFound(id) => Self::NotFound(format!("campaign '{id}'")),
            StoreError::RequestNotFound(id) => Self::NotFound(format!("usage request '{id}'")),
            StoreError::OverBudget {
                requested,
                remaining,
            } => Self::InsufficientBalance {
                requested,
                remaining,
            },
            StoreError::StatusConflict { .. } => Self::StateConflict(err.to_string()),
            StoreError::Rejected(message) => Self::Validation(message),
            StoreError::Backend(message) => Self::Storage(message),
        }
    }
}
