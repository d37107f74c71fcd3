//! Trade state machine
//!
//! The transition table is a closed `match` over every status and event. Each
//! accepted event yields a static route of steps; a step names the status it
//! enters and the ledger effect that must commit with it. All ledger calls
//! go through a [`LedgerTx`], so the status change and the balance effects
//! share one transaction.
use chrono::Duration;

use crate::config::FeeSchedule;
use crate::context::{Actor, TradeEvent, Witness};
use crate::error::{EscrowError, TxResult, abort};
use crate::journal::{MutationKind, MutationToken};
use crate::ledger::LedgerTx;
use crate::trade::{EscrowLink, EscrowResolution, TradeRecord, TradeStatus, TradeTerms};
use crate::types::{TimeStamp, TradeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Release the seller's lock, credit the buyer the traded amount and the
    /// collector the fee.
    Settle,
    /// Unlock the seller's escrow back to available.
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub to: TradeStatus,
    pub effect: Effect,
}

const fn step(to: TradeStatus, effect: Effect) -> Step {
    Step { to, effect }
}

const MARK_PAID: &[Step] = &[step(TradeStatus::Paid, Effect::None)];
const CONFIRM: &[Step] = &[
    step(TradeStatus::Confirmed, Effect::None),
    step(TradeStatus::Completed, Effect::Settle),
];
const DISPUTE: &[Step] = &[step(TradeStatus::Disputed, Effect::None)];
const SETTLE: &[Step] = &[step(TradeStatus::Completed, Effect::Settle)];
const REFUND: &[Step] = &[step(TradeStatus::Cancelled, Effect::Refund)];

/// Steps for `event` from `from`, or `InvalidTransition`.
pub fn route(from: TradeStatus, event: TradeEvent) -> Result<&'static [Step], EscrowError> {
    use TradeEvent::*;

    let steps = match from {
        TradeStatus::Pending => match event {
            MarkPaid => Some(MARK_PAID),
            OpenDispute => Some(DISPUTE),
            Expire | Cancel => Some(REFUND),
            ConfirmReceipt | ResolveForBuyer | ResolveForSeller => None,
        },
        TradeStatus::Paid => match event {
            ConfirmReceipt => Some(CONFIRM),
            OpenDispute => Some(DISPUTE),
            Cancel => Some(REFUND),
            MarkPaid | ResolveForBuyer | ResolveForSeller | Expire => None,
        },
        TradeStatus::Disputed => match event {
            ResolveForBuyer => Some(SETTLE),
            ResolveForSeller => Some(REFUND),
            MarkPaid | ConfirmReceipt | OpenDispute | Expire | Cancel => None,
        },
        // never a resting status, settles in the same commit
        TradeStatus::Confirmed => None,
        TradeStatus::Completed | TradeStatus::Cancelled => None,
    };

    steps.ok_or(EscrowError::InvalidTransition { from, event })
}

/// Whether `actor` may raise `event` on this trade.
pub fn authorize(record: &TradeRecord, event: TradeEvent, actor: &Actor) -> Result<(), EscrowError> {
    let terms = record.terms();
    let allowed = match (event, actor) {
        (TradeEvent::MarkPaid, Actor::Party(account)) => *account == terms.buyer,
        (TradeEvent::ConfirmReceipt, Actor::Party(account)) => *account == terms.seller,
        (TradeEvent::OpenDispute | TradeEvent::Cancel, Actor::Party(account)) => {
            terms.is_party(account)
        }
        (TradeEvent::ResolveForBuyer | TradeEvent::ResolveForSeller, Actor::Arbitrator(_)) => true,
        (TradeEvent::Expire, _) => true,
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(EscrowError::Unauthorized {
            trade_id: record.id().clone(),
            actor: actor.clone(),
            event,
        })
    }
}

/// Locks the seller's funds and builds the `pending` record.
pub(crate) fn open(
    id: TradeId,
    terms: TradeTerms,
    fee: Option<&FeeSchedule>,
    ledger: &LedgerTx<'_>,
    now: TimeStamp,
) -> TxResult<TradeRecord> {
    let fee_amount = match fee {
        Some(schedule) => schedule.fee_for(terms.amount).map_err(abort)?,
        None => 0,
    };
    let locked = terms
        .amount
        .checked_add(fee_amount)
        .ok_or_else(|| abort(EscrowError::Overflow("escrowed amount")))?;

    let token = MutationToken::trade(&id, 0, MutationKind::Lock);
    ledger.lock(&terms.seller, &terms.asset, locked, &token)?;

    let escrow = EscrowLink {
        account: terms.seller.clone(),
        asset: terms.asset.clone(),
        locked,
        fee: fee_amount,
        fee_collector: fee.filter(|_| fee_amount > 0).map(|s| s.collector.clone()),
        resolution: None,
    };
    let opened_by = Actor::Party(terms.buyer.clone());

    TradeRecord::open(id, terms, escrow, opened_by, now, token.key()).map_err(abort)
}

/// Runs `event` against `record`, applying ledger effects through `ledger`.
/// On error nothing in `record` may be persisted.
pub(crate) fn apply(
    record: &mut TradeRecord,
    event: TradeEvent,
    actor: &Actor,
    ledger: &LedgerTx<'_>,
    now: TimeStamp,
    payment_window: Duration,
) -> TxResult<TradeStatus> {
    let from = record.status();
    let steps = route(from, event).map_err(abort)?;
    authorize(record, event, actor).map_err(abort)?;

    if event == TradeEvent::Expire && !record.is_expired(now, payment_window) {
        let deadline = record.payment_deadline(payment_window).unwrap_or(now);
        return Err(abort(EscrowError::NotYetExpired {
            trade_id: record.id().clone(),
            deadline,
        }));
    }

    if let (TradeEvent::Cancel, Actor::Party(party)) = (event, actor) {
        // a repeated consent changes nothing
        if record.cancel_consent().contains(party) {
            return Ok(from);
        }
        if !record.consent_to_cancel(party) {
            record.push_witness(Witness::new(from, from, event, actor.clone(), now, vec![]));
            record.bump_version();
            return Ok(from);
        }
    }

    let mut current = from;
    for step in steps {
        let mutations = perform(record, step.effect, ledger)?;
        record.push_witness(Witness::new(
            current,
            step.to,
            event,
            actor.clone(),
            now,
            mutations,
        ));
        record.set_status(step.to, now);
        current = step.to;
    }
    record.bump_version();

    Ok(current)
}

fn perform(record: &mut TradeRecord, effect: Effect, ledger: &LedgerTx<'_>) -> TxResult<Vec<String>> {
    let trade_id = record.id().clone();
    let escrow = record.escrow().clone();
    let buyer = record.terms().buyer.clone();
    let amount = record.terms().amount;

    match effect {
        Effect::None => Ok(vec![]),
        Effect::Settle => {
            let mut tokens = vec![];

            let release = MutationToken::trade(&trade_id, record.next_seq(), MutationKind::Release);
            ledger.release(&escrow.account, &escrow.asset, escrow.locked, &release)?;
            tokens.push(release.key());

            let credit = MutationToken::trade(&trade_id, record.next_seq(), MutationKind::Credit);
            ledger.credit(&buyer, &escrow.asset, amount, &credit)?;
            tokens.push(credit.key());

            if let Some(collector) = escrow.fee_collector.as_ref().filter(|_| escrow.fee > 0) {
                let fee = MutationToken::trade(&trade_id, record.next_seq(), MutationKind::Credit);
                ledger.credit(collector, &escrow.asset, escrow.fee, &fee)?;
                tokens.push(fee.key());
            }

            record.resolve_escrow(EscrowResolution::Released);
            Ok(tokens)
        }
        Effect::Refund => {
            let unlock = MutationToken::trade(&trade_id, record.next_seq(), MutationKind::Unlock);
            ledger.unlock(&escrow.account, &escrow.asset, escrow.locked, &unlock)?;

            record.resolve_escrow(EscrowResolution::Returned);
            Ok(vec![unlock.key()])
        }
    }
}
