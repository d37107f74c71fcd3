//! End-to-end trade scenarios against a sled database on disk.
use std::sync::Arc;

use anyhow::Context;
use chrono::Duration;
use escrow_ledger::{
    AccountId, Actor, AdvanceCommand, Asset, Balance, EscrowConfig, EscrowError, EscrowService,
    ManualClock, MutationKind, TimeStamp, TradeEvent, TradeId, TradeStatus, TradeTerms,
};
use tempfile::{TempDir, tempdir};

struct Fixture {
    // keeps the database directory alive for the duration of the test
    _dir: TempDir,
    service: EscrowService,
    clock: Arc<ManualClock>,
    seller: AccountId,
    buyer: AccountId,
    asset: Asset,
}

impl Fixture {
    fn new(config: EscrowConfig) -> anyhow::Result<Self> {
        // Sled holds a file lock, so every test gets its own database.
        let dir = tempdir()?;
        let db = Arc::new(sled::open(dir.path().join("escrow.db"))?);
        let clock = Arc::new(ManualClock::new(TimeStamp::new_with(2024, 6, 1, 12, 0, 0)));
        let service = EscrowService::with_clock(db, config, clock.clone())?;

        Ok(Self {
            _dir: dir,
            service,
            clock,
            seller: AccountId::new(),
            buyer: AccountId::new(),
            asset: Asset::new("USDT")?,
        })
    }

    fn funded(available: u64) -> anyhow::Result<Self> {
        let fixture = Self::new(EscrowConfig::default())?;
        fixture.fund_seller(available)?;
        Ok(fixture)
    }

    fn fund_seller(&self, amount: u64) -> anyhow::Result<()> {
        self.service
            .credit(&self.seller, &self.asset, amount, "deposit-seller")?;
        Ok(())
    }

    fn terms(&self, amount: u64) -> anyhow::Result<TradeTerms> {
        Ok(TradeTerms::builder()
            .set_seller(self.seller.clone())
            .set_buyer(self.buyer.clone())
            .set_asset(self.asset.clone())
            .set_amount(amount)
            .set_price(7)
            .build()?)
    }

    fn open(&self, amount: u64) -> anyhow::Result<TradeId> {
        Ok(self.service.create_escrow_trade(self.terms(amount)?, None)?)
    }

    fn seller_says(&self, trade_id: &TradeId, event: TradeEvent) -> Result<TradeStatus, EscrowError> {
        self.service.advance_trade(AdvanceCommand::new(
            trade_id.clone(),
            event,
            Actor::Party(self.seller.clone()),
        ))
    }

    fn buyer_says(&self, trade_id: &TradeId, event: TradeEvent) -> Result<TradeStatus, EscrowError> {
        self.service.advance_trade(AdvanceCommand::new(
            trade_id.clone(),
            event,
            Actor::Party(self.buyer.clone()),
        ))
    }

    fn arbitrator_says(&self, trade_id: &TradeId, event: TradeEvent) -> Result<TradeStatus, EscrowError> {
        self.service.advance_trade(AdvanceCommand::new(
            trade_id.clone(),
            event,
            Actor::Arbitrator("ops-desk".into()),
        ))
    }

    fn balance_of(&self, account: &AccountId) -> anyhow::Result<Balance> {
        Ok(self.service.balance(account, &self.asset)?)
    }
}

#[test]
fn scenario_a_confirmed_payment_completes_the_trade() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;

    let trade_id = f.open(40).context("trade failed to open")?;
    assert_eq!(f.balance_of(&f.seller)?, Balance::new(60, 40));

    assert_eq!(f.buyer_says(&trade_id, TradeEvent::MarkPaid)?, TradeStatus::Paid);
    assert_eq!(f.balance_of(&f.seller)?, Balance::new(60, 40));
    assert_eq!(f.balance_of(&f.buyer)?, Balance::new(0, 0));

    assert_eq!(
        f.seller_says(&trade_id, TradeEvent::ConfirmReceipt)?,
        TradeStatus::Completed
    );
    assert_eq!(f.balance_of(&f.seller)?, Balance::new(60, 0));
    assert_eq!(f.balance_of(&f.buyer)?, Balance::new(40, 0));

    // confirmation passes through `confirmed` in the same commit
    let record = f.service.trade_status(&trade_id)?;
    let path: Vec<_> = record.history().iter().map(|w| w.to).collect();
    assert_eq!(
        path,
        vec![
            TradeStatus::Pending,
            TradeStatus::Paid,
            TradeStatus::Confirmed,
            TradeStatus::Completed
        ]
    );
    assert!(record.closed_at().is_some());

    let kinds: Vec<_> = f.service.audit_trail(&trade_id)?.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![MutationKind::Lock, MutationKind::Release, MutationKind::Credit]
    );
    Ok(())
}

#[test]
fn scenario_b_pending_trade_times_out() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let trade_id = f.open(40)?;

    f.clock.advance(Duration::minutes(29));
    assert_eq!(f.service.trade_status(&trade_id)?.status(), TradeStatus::Pending);

    f.clock.advance(Duration::minutes(1));
    let record = f.service.trade_status(&trade_id)?;

    assert_eq!(record.status(), TradeStatus::Cancelled);
    assert_eq!(record.history().last().map(|w| w.actor.clone()), Some(Actor::System));
    assert_eq!(f.balance_of(&f.seller)?, Balance::new(100, 0));
    Ok(())
}

#[test]
fn scenario_c_dispute_resolved_for_seller() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let trade_id = f.open(40)?;

    f.buyer_says(&trade_id, TradeEvent::MarkPaid)?;
    assert_eq!(
        f.seller_says(&trade_id, TradeEvent::OpenDispute)?,
        TradeStatus::Disputed
    );
    assert_eq!(
        f.arbitrator_says(&trade_id, TradeEvent::ResolveForSeller)?,
        TradeStatus::Cancelled
    );

    assert_eq!(f.balance_of(&f.seller)?, Balance::new(100, 0));
    assert_eq!(f.balance_of(&f.buyer)?, Balance::new(0, 0));
    Ok(())
}

#[test]
fn scenario_d_short_seller_cannot_open() -> anyhow::Result<()> {
    let f = Fixture::funded(30)?;

    let err = f.open(40).unwrap_err();
    let err = err.downcast::<EscrowError>()?;

    assert!(matches!(
        err,
        EscrowError::InsufficientFunds {
            requested: 40,
            available: 30,
            ..
        }
    ));
    assert_eq!(f.balance_of(&f.seller)?, Balance::new(30, 0));
    // only the deposit was journaled
    assert_eq!(f.service.ledger().store().records()?.len(), 1);
    assert!(f.service.trades().list()?.is_empty());
    Ok(())
}

#[test]
fn dispute_resolved_for_buyer_settles() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let trade_id = f.open(40)?;

    f.buyer_says(&trade_id, TradeEvent::OpenDispute)?;
    assert_eq!(
        f.arbitrator_says(&trade_id, TradeEvent::ResolveForBuyer)?,
        TradeStatus::Completed
    );

    assert_eq!(f.balance_of(&f.seller)?, Balance::new(60, 0));
    assert_eq!(f.balance_of(&f.buyer)?, Balance::new(40, 0));
    Ok(())
}

#[test]
fn fee_is_escrowed_and_paid_to_the_collector() -> anyhow::Result<()> {
    let collector = AccountId::new();
    let f = Fixture::new(EscrowConfig::default().with_fee(200, collector.clone()))?;
    f.fund_seller(100)?;

    let trade_id = f.open(50)?;
    assert_eq!(f.balance_of(&f.seller)?, Balance::new(49, 51));
    assert_eq!(f.service.get_trade(&trade_id)?.escrow().fee, 1);

    f.buyer_says(&trade_id, TradeEvent::MarkPaid)?;
    f.seller_says(&trade_id, TradeEvent::ConfirmReceipt)?;

    let seller = f.balance_of(&f.seller)?;
    let buyer = f.balance_of(&f.buyer)?;
    let fee = f.balance_of(&collector)?;
    assert_eq!(seller, Balance::new(49, 0));
    assert_eq!(buyer, Balance::new(50, 0));
    assert_eq!(fee, Balance::new(1, 0));
    assert_eq!(seller.available() + buyer.available() + fee.available(), 100);
    Ok(())
}

#[test]
fn cancelled_trade_returns_the_fee_too() -> anyhow::Result<()> {
    let collector = AccountId::new();
    let f = Fixture::new(EscrowConfig::default().with_fee(200, collector.clone()))?;
    f.fund_seller(100)?;
    let trade_id = f.open(50)?;

    f.seller_says(&trade_id, TradeEvent::OpenDispute)?;
    f.arbitrator_says(&trade_id, TradeEvent::ResolveForSeller)?;

    assert_eq!(f.balance_of(&f.seller)?, Balance::new(100, 0));
    assert_eq!(f.balance_of(&collector)?, Balance::new(0, 0));
    Ok(())
}

#[test]
fn mutual_cancel_needs_both_parties() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let trade_id = f.open(40)?;

    assert_eq!(f.seller_says(&trade_id, TradeEvent::Cancel)?, TradeStatus::Pending);
    let record = f.service.get_trade(&trade_id)?;
    assert_eq!(record.version(), 2);
    assert_eq!(record.cancel_consent(), &[f.seller.clone()]);
    assert_eq!(f.balance_of(&f.seller)?, Balance::new(60, 40));

    // asking twice does not count as the other party, and changes nothing
    assert_eq!(f.seller_says(&trade_id, TradeEvent::Cancel)?, TradeStatus::Pending);
    assert_eq!(f.service.get_trade(&trade_id)?, record);

    assert_eq!(f.buyer_says(&trade_id, TradeEvent::Cancel)?, TradeStatus::Cancelled);
    assert_eq!(f.balance_of(&f.seller)?, Balance::new(100, 0));
    assert!(f.service.get_trade(&trade_id)?.cancel_consent().is_empty());
    Ok(())
}

#[test]
fn repeated_consent_does_not_grow_the_record() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let trade_id = f.open(40)?;

    f.seller_says(&trade_id, TradeEvent::Cancel)?;
    let observed = f.service.get_trade(&trade_id)?;
    for _ in 0..50 {
        f.seller_says(&trade_id, TradeEvent::Cancel)?;
    }

    let record = f.service.get_trade(&trade_id)?;
    assert_eq!(record.version(), observed.version());
    assert_eq!(record.history().len(), observed.history().len());

    // the buyer's view is still current
    let status = f.service.advance_trade(
        AdvanceCommand::new(
            trade_id.clone(),
            TradeEvent::Cancel,
            Actor::Party(f.buyer.clone()),
        )
        .expecting_version(observed.version()),
    )?;
    assert_eq!(status, TradeStatus::Cancelled);
    Ok(())
}

#[test]
fn cancel_consent_resets_on_status_change() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let trade_id = f.open(40)?;

    f.seller_says(&trade_id, TradeEvent::Cancel)?;
    f.buyer_says(&trade_id, TradeEvent::MarkPaid)?;

    assert_eq!(f.buyer_says(&trade_id, TradeEvent::Cancel)?, TradeStatus::Paid);
    assert_eq!(f.seller_says(&trade_id, TradeEvent::Cancel)?, TradeStatus::Cancelled);
    Ok(())
}

#[test]
fn wrong_actor_is_rejected_without_state_change() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let trade_id = f.open(40)?;

    let err = f.seller_says(&trade_id, TradeEvent::MarkPaid).unwrap_err();
    assert!(matches!(err, EscrowError::Unauthorized { .. }));

    let err = f
        .service
        .advance_trade(AdvanceCommand::new(
            trade_id.clone(),
            TradeEvent::Cancel,
            Actor::Party(AccountId::new()),
        ))
        .unwrap_err();
    assert!(matches!(err, EscrowError::Unauthorized { .. }));

    f.buyer_says(&trade_id, TradeEvent::OpenDispute)?;
    let err = f.buyer_says(&trade_id, TradeEvent::ResolveForBuyer).unwrap_err();
    assert!(matches!(err, EscrowError::Unauthorized { .. }));

    let record = f.service.get_trade(&trade_id)?;
    assert_eq!(record.status(), TradeStatus::Disputed);
    assert_eq!(record.version(), 2);
    assert_eq!(f.balance_of(&f.seller)?, Balance::new(60, 40));
    Ok(())
}

#[test]
fn terminal_trade_cannot_settle_twice() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let trade_id = f.open(40)?;
    f.buyer_says(&trade_id, TradeEvent::MarkPaid)?;
    f.seller_says(&trade_id, TradeEvent::ConfirmReceipt)?;

    let err = f.seller_says(&trade_id, TradeEvent::ConfirmReceipt).unwrap_err();
    assert!(matches!(
        err,
        EscrowError::InvalidTransition {
            from: TradeStatus::Completed,
            event: TradeEvent::ConfirmReceipt
        }
    ));
    let err = f.arbitrator_says(&trade_id, TradeEvent::ResolveForBuyer).unwrap_err();
    assert!(matches!(err, EscrowError::InvalidTransition { .. }));

    assert_eq!(f.balance_of(&f.seller)?, Balance::new(60, 0));
    assert_eq!(f.balance_of(&f.buyer)?, Balance::new(40, 0));
    let releases = f
        .service
        .audit_trail(&trade_id)?
        .iter()
        .filter(|r| r.kind == MutationKind::Release)
        .count();
    assert_eq!(releases, 1);
    Ok(())
}

#[test]
fn replayed_request_is_not_applied_twice() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let trade_id = f.open(40)?;
    let seller = Actor::Party(f.seller.clone());
    let buyer = Actor::Party(f.buyer.clone());

    let paid = AdvanceCommand::new(trade_id.clone(), TradeEvent::MarkPaid, buyer.clone())
        .with_request_id("req-paid");
    assert_eq!(f.service.advance_trade(paid.clone())?, TradeStatus::Paid);
    assert_eq!(f.service.advance_trade(paid.clone())?, TradeStatus::Paid);
    assert_eq!(f.service.get_trade(&trade_id)?.version(), 2);

    let confirm = AdvanceCommand::new(trade_id.clone(), TradeEvent::ConfirmReceipt, seller.clone())
        .with_request_id("req-confirm");
    assert_eq!(f.service.advance_trade(confirm.clone())?, TradeStatus::Completed);
    assert_eq!(f.service.advance_trade(confirm)?, TradeStatus::Completed);

    // the first answer is returned even after the trade moved on
    assert_eq!(f.service.advance_trade(paid)?, TradeStatus::Paid);

    assert_eq!(f.balance_of(&f.seller)?, Balance::new(60, 0));
    assert_eq!(f.balance_of(&f.buyer)?, Balance::new(40, 0));
    assert_eq!(f.service.audit_trail(&trade_id)?.len(), 3);

    let reused = AdvanceCommand::new(trade_id, TradeEvent::OpenDispute, seller)
        .with_request_id("req-paid");
    assert!(matches!(
        f.service.advance_trade(reused),
        Err(EscrowError::IdempotencyMismatch(_))
    ));
    Ok(())
}

#[test]
fn replayed_create_returns_the_same_trade() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;

    let first = f.service.create_escrow_trade(f.terms(40)?, Some("open-1"))?;
    let second = f.service.create_escrow_trade(f.terms(40)?, Some("open-1"))?;

    assert_eq!(first, second);
    assert_eq!(f.balance_of(&f.seller)?, Balance::new(60, 40));
    assert_eq!(f.service.trades().list()?.len(), 1);

    let err = f
        .service
        .create_escrow_trade(f.terms(10)?, Some("open-1"))
        .unwrap_err();
    assert!(matches!(err, EscrowError::IdempotencyMismatch(_)));
    Ok(())
}

#[test]
fn stale_version_is_a_conflict() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let trade_id = f.open(40)?;
    let observed = f.service.get_trade(&trade_id)?.version();
    let buyer = Actor::Party(f.buyer.clone());

    f.service.advance_trade(
        AdvanceCommand::new(trade_id.clone(), TradeEvent::MarkPaid, buyer.clone())
            .expecting_version(observed),
    )?;
    let err = f
        .service
        .advance_trade(
            AdvanceCommand::new(trade_id.clone(), TradeEvent::OpenDispute, buyer)
                .expecting_version(observed),
        )
        .unwrap_err();

    assert!(matches!(
        err,
        EscrowError::ConcurrencyConflict {
            expected: 1,
            actual: 2,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(f.service.get_trade(&trade_id)?.status(), TradeStatus::Paid);
    Ok(())
}

#[test]
fn late_payment_hits_the_expired_trade() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let trade_id = f.open(40)?;

    f.clock.advance(Duration::minutes(45));
    let err = f.buyer_says(&trade_id, TradeEvent::MarkPaid).unwrap_err();

    assert!(matches!(
        err,
        EscrowError::InvalidTransition {
            from: TradeStatus::Cancelled,
            event: TradeEvent::MarkPaid
        }
    ));
    assert_eq!(f.balance_of(&f.seller)?, Balance::new(100, 0));
    Ok(())
}

#[test]
fn explicit_expiry_respects_the_deadline() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let trade_id = f.open(40)?;
    let expire = AdvanceCommand::new(trade_id.clone(), TradeEvent::Expire, Actor::System);

    let err = f.service.advance_trade(expire.clone()).unwrap_err();
    assert!(matches!(err, EscrowError::NotYetExpired { .. }));

    f.clock.advance(Duration::minutes(30));
    assert_eq!(f.service.advance_trade(expire)?, TradeStatus::Cancelled);
    Ok(())
}

#[test]
fn sweeper_expires_only_due_pending_trades() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let waiting = f.open(40)?;
    let paid = f.open(30)?;
    f.buyer_says(&paid, TradeEvent::MarkPaid)?;

    f.clock.advance(Duration::hours(1));
    assert_eq!(f.service.expire_due_trades()?, vec![waiting.clone()]);
    assert!(f.service.expire_due_trades()?.is_empty());

    assert_eq!(f.service.get_trade(&waiting)?.status(), TradeStatus::Cancelled);
    assert_eq!(f.service.get_trade(&paid)?.status(), TradeStatus::Paid);
    assert_eq!(f.balance_of(&f.seller)?, Balance::new(70, 30));
    Ok(())
}

#[test]
fn payment_window_comes_from_config() -> anyhow::Result<()> {
    let f = Fixture::new(EscrowConfig::default().with_payment_window_secs(60))?;
    f.fund_seller(100)?;
    let trade_id = f.open(40)?;

    f.clock.advance(Duration::seconds(61));
    assert_eq!(f.service.trade_status(&trade_id)?.status(), TradeStatus::Cancelled);
    Ok(())
}

#[test]
fn every_terminal_trade_has_its_ledger_effect() -> anyhow::Result<()> {
    let f = Fixture::funded(300)?;

    let completed = f.open(40)?;
    f.buyer_says(&completed, TradeEvent::MarkPaid)?;
    f.seller_says(&completed, TradeEvent::ConfirmReceipt)?;

    let expired = f.open(50)?;
    let mutual = f.open(60)?;
    f.seller_says(&mutual, TradeEvent::Cancel)?;
    f.buyer_says(&mutual, TradeEvent::Cancel)?;
    f.clock.advance(Duration::hours(2));
    f.service.expire_due_trades()?;

    for trade_id in [&completed, &expired, &mutual] {
        let record = f.service.get_trade(trade_id)?;
        let trail = f.service.audit_trail(trade_id)?;

        // each journal entry is claimed by exactly one witness
        let witnessed: Vec<_> = record.mutation_tokens().map(str::to_string).collect();
        let journaled: Vec<_> = trail.iter().map(|r| r.token.clone()).collect();
        assert_eq!(witnessed, journaled);

        let kinds: Vec<_> = trail.iter().map(|r| r.kind).collect();
        match record.status() {
            TradeStatus::Completed => {
                assert!(kinds.contains(&MutationKind::Release));
                assert!(kinds.contains(&MutationKind::Credit));
            }
            TradeStatus::Cancelled => assert!(kinds.contains(&MutationKind::Unlock)),
            other => panic!("trade left in {other}"),
        }
    }

    assert_eq!(f.balance_of(&f.seller)?, Balance::new(260, 0));
    assert_eq!(f.balance_of(&f.buyer)?, Balance::new(40, 0));
    Ok(())
}

#[test]
fn unknown_trade_is_not_found() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    let missing = TradeId::from("trade_1missing");

    assert!(matches!(
        f.service.trade_status(&missing),
        Err(EscrowError::NotFound(_))
    ));
    assert!(matches!(
        f.buyer_says(&missing, TradeEvent::MarkPaid),
        Err(EscrowError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn withdrawal_cannot_touch_escrowed_funds() -> anyhow::Result<()> {
    let f = Fixture::funded(100)?;
    f.open(40)?;

    let err = f
        .service
        .debit(&f.seller, &f.asset, 61, "withdraw-1")
        .unwrap_err();
    assert!(matches!(err, EscrowError::InsufficientFunds { available: 60, .. }));

    let record = f.service.debit(&f.seller, &f.asset, 60, "withdraw-2")?;
    assert_eq!((record.available_after, record.locked_after), (0, 40));
    Ok(())
}
