//! Reconciliation of the local mirror against the authoritative ledger.
//!
//! A pass reads every linked campaign from the authoritative source and
//! overwrites the mirrored fields. Lookups are bounded by a timeout and fail
//! per campaign; a failed lookup leaves that campaign's mirror untouched.
//! Overlapping passes are skipped, not queued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::authority::{AuthoritativeCampaignState, AuthoritativeLedger};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::GovernanceError;
use crate::storage::{GovernanceStore, MirrorUpdate};
use crate::types::{Campaign, CampaignStatus, LedgerRef};

/// Status implied by authoritative state at `now`.
pub fn derive_status(state: &AuthoritativeCampaignState, now: DateTime<Utc>) -> CampaignStatus {
    if state.withdrawn {
        CampaignStatus::Completed
    } else if now > state.deadline {
        if state.raised_minor >= state.goal_minor {
            CampaignStatus::Completed
        } else {
            CampaignStatus::Failed
        }
    } else {
        CampaignStatus::Active
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub updated: usize,
    pub unchanged: usize,
    /// Campaigns whose lookup failed; their mirror was left as it was.
    pub failed: Vec<LedgerRef>,
    /// Lookups answered from the snapshot cache.
    pub cache_hits: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass was still in flight.
    Skipped,
}

#[derive(Debug, Clone, Copy)]
struct CachedSnapshot {
    state: AuthoritativeCampaignState,
    fetched_at: DateTime<Utc>,
}

/// Resets the in-flight flag however the pass ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncCoordinator {
    store: Arc<dyn GovernanceStore>,
    ledger: Arc<dyn AuthoritativeLedger>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    in_flight: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    snapshots: Mutex<HashMap<LedgerRef, CachedSnapshot>>,
    trigger_tx: mpsc::Sender<()>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        ledger: Arc<dyn AuthoritativeLedger>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let coordinator = Arc::new(Self {
            store,
            ledger,
            clock,
            config,
            in_flight: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            snapshots: Mutex::new(HashMap::new()),
            trigger_tx,
        });
        (coordinator, trigger_rx)
    }

    /// Request an immediate pass. Coalesces with one already queued.
    pub fn trigger(&self) {
        if self.trigger_tx.try_send(()).is_err() {
            debug!("Sync trigger already pending");
        }
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Drive passes on the configured interval and on triggers until shutdown.
    pub async fn start(
        self: Arc<Self>,
        mut trigger_rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = self.config.effective_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = period.as_secs(), "Reconciliation sync started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.pass("interval").await,
                Some(()) = trigger_rx.recv() => self.pass("trigger").await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reconciliation sync stopped");
    }

    async fn pass(&self, reason: &'static str) {
        // a triggered pass follows a release and must see the new state
        let use_cache = reason != "trigger";
        match self.run_pass(use_cache).await {
            Ok(SyncOutcome::Completed(report)) => debug!(
                reason,
                updated = report.updated,
                failed = report.failed.len(),
                "Sync pass finished"
            ),
            Ok(SyncOutcome::Skipped) => debug!(reason, "Sync pass skipped: previous pass in flight"),
            Err(e) => error!(reason, error = %e, "Sync pass failed"),
        }
    }

    /// One reconciliation pass over every linked campaign.
    pub async fn run_once(&self) -> Result<SyncOutcome, GovernanceError> {
        self.run_pass(true).await
    }

    /// Like [`run_once`](Self::run_once) but every lookup goes to the ledger.
    pub async fn refresh(&self) -> Result<SyncOutcome, GovernanceError> {
        self.run_pass(false).await
    }

    async fn run_pass(&self, use_cache: bool) -> Result<SyncOutcome, GovernanceError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(SyncOutcome::Skipped);
        }
        let _guard = InFlight(&self.in_flight);

        let campaigns = self.store.linked_campaigns().await?;
        let mut report = SyncReport::default();

        for campaign in campaigns {
            let Some(ledger_ref) = campaign.ledger_ref.clone() else {
                continue;
            };
            match self.reconcile_campaign(&campaign, &ledger_ref, use_cache).await {
                Ok((changed, cached)) => {
                    if changed {
                        report.updated += 1;
                    } else {
                        report.unchanged += 1;
                    }
                    if cached {
                        report.cache_hits += 1;
                    }
                }
                Err(e) => {
                    error!(
                        campaign_id = %campaign.id,
                        ledger_ref = %ledger_ref,
                        error = %e,
                        "Failed to reconcile campaign"
                    );
                    report.failed.push(ledger_ref);
                }
            }
        }

        let finished = self.clock.now();
        *self.last_sync.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(finished);
        info!(
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed.len(),
            cache_hits = report.cache_hits,
            "Mirror reconciled"
        );
        Ok(SyncOutcome::Completed(report))
    }

    async fn reconcile_campaign(
        &self,
        campaign: &Campaign,
        ledger_ref: &LedgerRef,
        use_cache: bool,
    ) -> Result<(bool, bool), GovernanceError> {
        let (snapshot, cached) = self.authoritative_state(ledger_ref, use_cache).await?;
        let state = snapshot.state;
        let update = MirrorUpdate {
            raised_minor: state.raised_minor,
            goal_minor: state.goal_minor,
            deadline: state.deadline,
            withdrawn: state.withdrawn,
            status: derive_status(&state, self.clock.now()),
            // the mirror is only as fresh as the snapshot it came from
            synced_at: snapshot.fetched_at,
        };
        let changed = self.store.apply_mirror(campaign.id, &update).await?;
        if changed {
            info!(
                campaign_id = %campaign.id,
                status = update.status.as_str(),
                raised = update.raised_minor,
                "Mirror updated from authoritative ledger"
            );
        }
        Ok((changed, cached))
    }

    async fn authoritative_state(
        &self,
        ledger_ref: &LedgerRef,
        use_cache: bool,
    ) -> Result<(CachedSnapshot, bool), GovernanceError> {
        let now = self.clock.now();
        if use_cache {
            if let Some(snapshot) = self.cached(ledger_ref, now) {
                return Ok((snapshot, true));
            }
        }

        let timeout = self.config.lookup_timeout();
        let state = tokio::time::timeout(timeout, self.ledger.campaign_state(ledger_ref))
            .await
            .map_err(|_| {
                GovernanceError::external(format!(
                    "lookup of '{ledger_ref}' timed out after {}s",
                    timeout.as_secs()
                ))
            })??;

        let snapshot = CachedSnapshot {
            state,
            fetched_at: now,
        };
        self.snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(ledger_ref.clone(), snapshot);
        Ok((snapshot, false))
    }

    fn cached(&self, ledger_ref: &LedgerRef, now: DateTime<Utc>) -> Option<CachedSnapshot> {
        let ttl = chrono::Duration::from_std(self.config.snapshot_ttl()).ok()?;
        let snapshots = self
            .snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        snapshots
            .get(ledger_ref)
            .filter(|snapshot| now < snapshot.fetched_at + ttl)
            .copied()
    }
}
