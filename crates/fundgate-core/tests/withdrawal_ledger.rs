use async_trait::async_trait;
use chrono::Duration;
use fundgate_core::{
    AuthoritativeLedger, Clock, DiscardSink, GovernanceError, LedgerRef, ManualClock,
    NewWithdrawal, ReleaseInstruction, TransferError, UserId, ValueTransfer, WithdrawalLedger,
};
use std::sync::{Arc, Mutex, OnceLock};

/// Transfer that never answers.
struct StalledTransfer;

#[async_trait]
impl ValueTransfer for StalledTransfer {
    async fn transfer(&self, _recipient: &UserId, _amount_minor: u64) -> Result<(), TransferError> {
        std::future::pending().await
    }
}

/// Transfer that calls back into the ledger before completing.
#[derive(Default)]
struct ReentrantTransfer {
    ledger: OnceLock<Arc<WithdrawalLedger>>,
    target: OnceLock<LedgerRef>,
    observed: Mutex<Vec<GovernanceError>>,
}

#[async_trait]
impl ValueTransfer for ReentrantTransfer {
    async fn transfer(&self, recipient: &UserId, _amount_minor: u64) -> Result<(), TransferError> {
        let (Some(ledger), Some(target)) = (self.ledger.get(), self.target.get()) else {
            return Ok(());
        };
        let nested = [
            ledger.execute_withdrawal(recipient, target, 0).await.err(),
            ledger.refund(recipient, target).await.err(),
            ledger.donate(recipient, target, 1).await.err(),
            ledger.campaign_state(target).await.err(),
        ];
        self.observed
            .lock()
            .unwrap()
            .extend(nested.into_iter().flatten());
        Ok(())
    }
}

struct Setup {
    ledger: Arc<WithdrawalLedger>,
    transfer: Arc<ReentrantTransfer>,
    clock: Arc<ManualClock>,
    creator: UserId,
    campaign: LedgerRef,
}

async fn setup(pledges: &[(&str, u64)], goal: u64) -> Setup {
    let clock = Arc::new(ManualClock::default());
    let transfer = Arc::new(ReentrantTransfer::default());
    let ledger = Arc::new(WithdrawalLedger::new(
        transfer.clone(),
        Arc::new(DiscardSink),
        clock.clone(),
    ));
    let creator = UserId::new("creator");
    let campaign = ledger
        .create_campaign(&creator, goal, clock.now() + Duration::days(5))
        .await
        .unwrap();
    for (donor, amount) in pledges {
        ledger
            .donate(&UserId::new(*donor), &campaign, *amount)
            .await
            .unwrap();
    }
    Setup {
        ledger,
        transfer,
        clock,
        creator,
        campaign,
    }
}

fn withdrawal(amount: u64, percentage: u8) -> NewWithdrawal {
    NewWithdrawal {
        amount_minor: amount,
        usage: "Equipment purchase".to_string(),
        supporting_doc: None,
        approval_percentage: percentage,
    }
}

#[tokio::test]
async fn nested_calls_during_transfer_are_refused() {
    let s = setup(&[("a", 100)], 100).await;
    s.clock.advance(Duration::days(6));
    let _ = s.transfer.ledger.set(s.ledger.clone());
    let _ = s.transfer.target.set(s.campaign.clone());

    s.ledger
        .request_withdrawal(&s.creator, &s.campaign, withdrawal(60, 50))
        .await
        .unwrap();
    s.ledger
        .approve_withdrawal(&UserId::new("a"), &s.campaign, 0)
        .await
        .unwrap();
    s.ledger
        .execute_withdrawal(&s.creator, &s.campaign, 0)
        .await
        .unwrap();

    let observed = s.transfer.observed.lock().unwrap().clone();
    assert_eq!(observed, vec![GovernanceError::Reentrancy; 4]);

    // the ledger is usable again once the outer call has finished
    let state = s.ledger.campaign_state(&s.campaign).await.unwrap();
    assert_eq!(state.raised_minor, 100);
    assert_eq!(s.ledger.balance_minor().await.unwrap(), 40);
}

#[tokio::test]
async fn scenario_c_threshold_is_fifty_one_of_one_hundred() {
    let s = setup(&[("x", 50), ("y", 1), ("z", 49)], 100).await;
    s.clock.advance(Duration::days(6));
    let request = s
        .ledger
        .request_withdrawal(&s.creator, &s.campaign, withdrawal(100, 51))
        .await
        .unwrap();
    assert_eq!(request.threshold.required_weight_minor, 51);

    s.ledger
        .approve_withdrawal(&UserId::new("x"), &s.campaign, 0)
        .await
        .unwrap();
    let err = s
        .ledger
        .execute_withdrawal(&s.creator, &s.campaign, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::StateConflict(_)));

    let tally = s
        .ledger
        .approve_withdrawal(&UserId::new("y"), &s.campaign, 0)
        .await
        .unwrap();
    assert_eq!(tally.approving_weight_minor, 51);
    s.ledger
        .execute_withdrawal(&s.creator, &s.campaign, 0)
        .await
        .unwrap();

    let state = s.ledger.campaign_state(&s.campaign).await.unwrap();
    assert!(state.withdrawn);
}

#[tokio::test]
async fn rejections_do_not_block_an_approved_release() {
    let s = setup(&[("yes", 60), ("no", 40)], 100).await;
    s.clock.advance(Duration::days(6));
    s.ledger
        .request_withdrawal(&s.creator, &s.campaign, withdrawal(30, 50))
        .await
        .unwrap();
    s.ledger
        .reject_withdrawal(&UserId::new("no"), &s.campaign, 0)
        .await
        .unwrap();
    s.ledger
        .approve_withdrawal(&UserId::new("yes"), &s.campaign, 0)
        .await
        .unwrap();

    s.ledger
        .execute_withdrawal(&s.creator, &s.campaign, 0)
        .await
        .unwrap();
    let executed = s.ledger.withdrawal(&s.campaign, 0).await.unwrap();
    assert!(executed.executed);
    assert_eq!(executed.rejections_minor(), 40);
    assert!(executed.confirmation.is_some());
}

#[tokio::test]
async fn execution_below_threshold_changes_nothing() {
    let s = setup(&[("a", 40), ("b", 60)], 100).await;
    s.clock.advance(Duration::days(6));
    let first = s
        .ledger
        .request_withdrawal(&s.creator, &s.campaign, withdrawal(20, 60))
        .await
        .unwrap();
    assert_eq!(first.threshold.required_weight_minor, 60);
    s.ledger
        .approve_withdrawal(&UserId::new("a"), &s.campaign, 0)
        .await
        .unwrap();

    let err = s
        .ledger
        .execute_withdrawal(&s.creator, &s.campaign, 0)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GovernanceError::StateConflict("approval threshold not met: 40 of 60 required".to_string())
    );

    let stored = s.ledger.withdrawal(&s.campaign, 0).await.unwrap();
    assert!(!stored.executed);
    assert_eq!(stored.threshold, first.threshold);
    assert_eq!(s.ledger.balance_minor().await.unwrap(), 100);
    assert!(s
        .ledger
        .has_voted(&s.campaign, 0, &UserId::new("a"))
        .await
        .unwrap());
    assert!(!s
        .ledger
        .has_voted(&s.campaign, 0, &UserId::new("b"))
        .await
        .unwrap());
}

#[tokio::test]
async fn submit_release_goes_through_execution_guards() {
    let s = setup(&[("a", 100)], 100).await;
    s.clock.advance(Duration::days(6));
    s.ledger
        .request_withdrawal(&s.creator, &s.campaign, withdrawal(50, 50))
        .await
        .unwrap();

    let authority: Arc<dyn AuthoritativeLedger> = s.ledger.clone();
    let outsider = ReleaseInstruction {
        ledger_ref: s.campaign.clone(),
        withdrawal_id: 0,
        caller: UserId::new("mallory"),
    };
    let err = authority.submit_release(outsider).await.unwrap_err();
    assert!(matches!(err, GovernanceError::Unauthorized(_)));

    s.ledger
        .approve_withdrawal(&UserId::new("a"), &s.campaign, 0)
        .await
        .unwrap();
    let confirmation = authority
        .submit_release(ReleaseInstruction {
            ledger_ref: s.campaign.clone(),
            withdrawal_id: 0,
            caller: s.creator.clone(),
        })
        .await
        .unwrap();
    assert!(!confirmation.0.is_empty());

    let state = authority.campaign_state(&s.campaign).await.unwrap();
    assert!(!state.withdrawn);
}

#[tokio::test]
async fn second_release_beyond_the_balance_is_refused() {
    let s = setup(&[("a", 100)], 100).await;
    s.clock.advance(Duration::days(6));
    for _ in 0..2 {
        s.ledger
            .request_withdrawal(&s.creator, &s.campaign, withdrawal(60, 50))
            .await
            .unwrap();
    }
    for id in 0..2 {
        s.ledger
            .approve_withdrawal(&UserId::new("a"), &s.campaign, id)
            .await
            .unwrap();
    }
    s.ledger
        .execute_withdrawal(&s.creator, &s.campaign, 0)
        .await
        .unwrap();
    let before = s.ledger.campaign_state(&s.campaign).await.unwrap();

    let err = s
        .ledger
        .execute_withdrawal(&s.creator, &s.campaign, 1)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GovernanceError::InsufficientBalance {
            requested: 60,
            remaining: 40,
        }
    );

    let second = s.ledger.withdrawal(&s.campaign, 1).await.unwrap();
    assert!(!second.executed);
    assert!(second.confirmation.is_none());
    assert_eq!(s.ledger.balance_minor().await.unwrap(), 40);
    assert_eq!(s.ledger.campaign_state(&s.campaign).await.unwrap(), before);
}

#[tokio::test]
async fn stalled_transfer_times_out_and_rolls_back() {
    let clock = Arc::new(ManualClock::default());
    let ledger = Arc::new(
        WithdrawalLedger::new(Arc::new(StalledTransfer), Arc::new(DiscardSink), clock.clone())
            .with_transfer_timeout(std::time::Duration::from_millis(200)),
    );
    let creator = UserId::new("creator");
    let campaign = ledger
        .create_campaign(&creator, 100, clock.now() + Duration::days(5))
        .await
        .unwrap();
    ledger
        .donate(&UserId::new("a"), &campaign, 100)
        .await
        .unwrap();
    clock.advance(Duration::days(6));
    ledger
        .request_withdrawal(&creator, &campaign, withdrawal(100, 50))
        .await
        .unwrap();
    ledger
        .approve_withdrawal(&UserId::new("a"), &campaign, 0)
        .await
        .unwrap();

    let executing = tokio::spawn({
        let ledger = ledger.clone();
        let creator = creator.clone();
        let campaign = campaign.clone();
        async move { ledger.execute_withdrawal(&creator, &campaign, 0).await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // readers queue behind the stalled call but are released by the bound
    let state = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        ledger.campaign_state(&campaign),
    )
    .await
    .expect("ledger stayed blocked")
    .unwrap();
    assert!(!state.withdrawn);
    assert_eq!(state.raised_minor, 100);

    let err = executing.await.unwrap().unwrap_err();
    assert!(matches!(err, GovernanceError::External(_)));
    assert!(!ledger.withdrawal(&campaign, 0).await.unwrap().executed);
    assert_eq!(ledger.balance_minor().await.unwrap(), 100);
}
