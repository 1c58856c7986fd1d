use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::StoreError;
use crate::types::{UsageRequest, UsageStatus};

/// Per-category subtotals kept for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotals {
    pub spent_minor: u64,
    pub approved_minor: u64,
    pub pending_minor: u64,
}

/// Balance view of one campaign, derived from its request rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub raised_minor: u64,
    pub total_spent_minor: u64,
    /// Requested amount of APPROVED and SPENT requests.
    pub total_approved_minor: u64,
    pub total_pending_minor: u64,
    pub outstanding_approved_minor: u64,
    pub committed_minor: u64,
    pub remaining_minor: u64,
    pub categories: BTreeMap<String, CategoryTotals>,
}

impl LedgerSummary {
    /// Reject a new request that would exceed the remaining balance.
    pub fn check_request(&self, requested_minor: u64) -> Result<(), StoreError> {
        if requested_minor == 0 {
            return Err(StoreError::Rejected(
                "requested amount must be greater than zero".to_string(),
            ));
        }
        if requested_minor > self.remaining_minor {
            return Err(StoreError::OverBudget {
                requested: requested_minor,
                remaining: self.remaining_minor,
            });
        }
        Ok(())
    }

    /// Check a spend against the funds the request already reserved.
    ///
    /// An APPROVED request is already counted in `outstanding_approved`, so the
    /// bound is `remaining + requested` rather than `remaining` alone.
    pub fn check_spend(&self, request: &UsageRequest, actual_minor: u64) -> Result<(), StoreError> {
        if request.status != UsageStatus::Approved {
            return Err(StoreError::StatusConflict {
                id: request.id,
                expected: UsageStatus::Approved,
                actual: request.status,
            });
        }
        if actual_minor > request.requested_minor {
            return Err(StoreError::Rejected(format!(
                "actual amount {actual_minor} exceeds requested amount {}",
                request.requested_minor
            )));
        }
        let ceiling = self
            .remaining_minor
            .saturating_add(request.requested_minor);
        if actual_minor > ceiling {
            return Err(StoreError::OverBudget {
                requested: actual_minor,
                remaining: ceiling,
            });
        }
        Ok(())
    }

    /// Funds committed beyond what was raised, e.g. after refunds on the ledger.
    pub fn overcommitted_minor(&self) -> u64 {
        self.committed_minor.saturating_sub(self.raised_minor)
    }

    /// `spent + outstanding + pending + remaining == raised` while not overcommitted.
    pub fn is_conserved(&self) -> bool {
        let accounted = u128::from(self.total_spent_minor)
            + u128::from(self.outstanding_approved_minor)
            + u128::from(self.total_pending_minor)
            + u128::from(self.remaining_minor);
        accounted == u128::from(self.raised_minor) + u128::from(self.overcommitted_minor())
    }
}

/// Recomputes a campaign's balance from source rows on every call.
///
/// There is no running counter to drift: a missed update heals on the next read.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerAccountant;

impl LedgerAccountant {
    pub fn summarize<'a>(
        raised_minor: u64,
        requests: impl IntoIterator<Item = &'a UsageRequest>,
    ) -> LedgerSummary {
        let mut summary = LedgerSummary {
            raised_minor,
            ..LedgerSummary::default()
        };

        for request in requests {
            let category = summary
                .categories
                .entry(request.category.clone())
                .or_default();
            match request.status {
                UsageStatus::Pending => {
                    summary.total_pending_minor = summary
                        .total_pending_minor
                        .saturating_add(request.requested_minor);
                    category.pending_minor =
                        category.pending_minor.saturating_add(request.requested_minor);
                }
                UsageStatus::Approved => {
                    summary.total_approved_minor = summary
                        .total_approved_minor
                        .saturating_add(request.requested_minor);
                    category.approved_minor =
                        category.approved_minor.saturating_add(request.requested_minor);
                }
                UsageStatus::Spent => {
                    summary.total_approved_minor = summary
                        .total_approved_minor
                        .saturating_add(request.requested_minor);
                    summary.total_spent_minor =
                        summary.total_spent_minor.saturating_add(request.spent_minor());
                    category.approved_minor =
                        category.approved_minor.saturating_add(request.requested_minor);
                    category.spent_minor = category.spent_minor.saturating_add(request.spent_minor());
                }
                UsageStatus::Rejected => {}
            }
        }

        summary.outstanding_approved_minor = summary
            .total_approved_minor
            .saturating_sub(summary.total_spent_minor);
        summary.committed_minor = summary
            .total_spent_minor
            .saturating_add(summary.outstanding_approved_minor)
            .saturating_add(summary.total_pending_minor);
        summary.remaining_minor = raised_minor.saturating_sub(summary.committed_minor);

        debug!(
            raised = summary.raised_minor,
            committed = summary.committed_minor,
            remaining = summary.remaining_minor,
            "Ledger summary recomputed"
        );
        summary
    }
}
