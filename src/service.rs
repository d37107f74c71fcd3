//! Escrow orchestrator: the single entry point for writes.
//!
//! Events for one trade run one at a time behind a per-trade gate; events for
//! different trades run in parallel. Every write is one sled transaction over
//! the trades, requests, balances and journal trees, so a status change is
//! never visible without its ledger effect.
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use sled::Transactional;
use tracing::{debug, info, warn};
use uuid7::uuid7;

use crate::balance::Balance;
use crate::clock::{Clock, SystemClock};
use crate::config::EscrowConfig;
use crate::context::{Actor, TradeEvent};
use crate::error::{EscrowError, abort, flatten};
use crate::journal::{MutationRecord, MutationToken};
use crate::ledger::{self, LedgerService, LedgerStore, LedgerTx};
use crate::machine;
use crate::store::{RequestOutcome, TradeStore, TradeTx};
use crate::trade::{TradeRecord, TradeStatus, TradeTerms};
use crate::types::{AccountId, Amount, Asset, TradeId};
use crate::utils;

/// An external event addressed to one trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvanceCommand {
    pub trade_id: TradeId,
    pub event: TradeEvent,
    pub actor: Actor,
    /// Replaying a request id returns the first outcome without reapplying it.
    pub request_id: Option<String>,
    /// Version the caller last observed; a mismatch is a `ConcurrencyConflict`.
    pub expected_version: Option<u64>,
}

pub struct EscrowService {
    instance: Arc<sled::Db>,
    ledger: LedgerService,
    trades: TradeStore,
    config: EscrowConfig,
    clock: Arc<dyn Clock>,
    gates: DashMap<TradeId, Arc<Mutex<()>>>,
}

struct Committed {
    outcome: RequestOutcome,
    replayed: bool,
}

impl AdvanceCommand {
    pub fn new(trade_id: TradeId, event: TradeEvent, actor: Actor) -> Self {
        Self {
            trade_id,
            event,
            actor,
            request_id: None,
            expected_version: None,
        }
    }
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
    pub fn expecting_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

impl EscrowService {
    pub fn new(instance: Arc<sled::Db>, config: EscrowConfig) -> Result<Self, EscrowError> {
        Self::with_clock(instance, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        instance: Arc<sled::Db>,
        config: EscrowConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EscrowError> {
        config.validate()?;
        let ledger = LedgerService::new(LedgerStore::open(&instance)?, clock.clone());
        let trades = TradeStore::open(&instance)?;

        Ok(Self {
            instance,
            ledger,
            trades,
            config,
            clock,
            gates: DashMap::new(),
        })
    }

    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }
    pub fn trades(&self) -> &TradeStore {
        &self.trades
    }
    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    /// Opens a trade and locks the seller's funds (plus any fee).
    pub fn create_escrow_trade(
        &self,
        terms: TradeTerms,
        request_id: Option<&str>,
    ) -> Result<TradeId, EscrowError> {
        let request_id = request_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid7().to_string());
        let digest = terms.digest()?;
        let trade_id = TradeId::generate()?;

        let committed = self.gated(&trade_id, || {
            self.with_retries(&trade_id, || {
                self.commit_open(&trade_id, &terms, &request_id, &digest)
            })
        })?;
        let outcome = committed.outcome;

        if committed.replayed {
            debug!(trade_id = %outcome.trade_id, request_id = %request_id, "create request replayed");
        } else {
            info!(
                trade_id = %outcome.trade_id,
                seller = %terms.seller,
                buyer = %terms.buyer,
                asset = %terms.asset,
                amount = terms.amount,
                "escrow trade opened"
            );
        }
        Ok(outcome.trade_id)
    }

    /// Applies one event to a trade and returns the resulting status.
    ///
    /// A due expiry runs before the request id is looked up, so replaying a
    /// recorded request may expire the trade and still return the status
    /// recorded the first time.
    pub fn advance_trade(&self, command: AdvanceCommand) -> Result<TradeStatus, EscrowError> {
        let request_id = command
            .request_id
            .clone()
            .unwrap_or_else(|| uuid7().to_string());
        let digest = utils::digest(&(&command.trade_id, command.event, &command.actor))?;

        // unknown ids never reach the gate table
        self.trades.require(&command.trade_id)?;

        let committed = self.gated(&command.trade_id, || {
            if command.event != TradeEvent::Expire {
                self.expire_if_due(&command.trade_id)?;
            }
            self.with_retries(&command.trade_id, || {
                self.commit_event(
                    &command.trade_id,
                    command.event,
                    &command.actor,
                    command.expected_version,
                    &request_id,
                    &digest,
                )
            })
        })?;
        Ok(committed.outcome.status)
    }

    /// Current record of a trade. A `pending` trade past its payment window
    /// is expired first.
    pub fn trade_status(&self, trade_id: &TradeId) -> Result<TradeRecord, EscrowError> {
        let record = self.trades.require(trade_id)?;
        if !record.is_expired(self.clock.now(), self.config.payment_window()) {
            return Ok(record);
        }

        self.gated(trade_id, || {
            self.expire_if_due(trade_id)?;
            self.trades.require(trade_id)
        })
    }

    /// Raw read of a trade record, without lazy expiry.
    pub fn get_trade(&self, trade_id: &TradeId) -> Result<TradeRecord, EscrowError> {
        self.trades.require(trade_id)
    }

    pub fn balance(&self, account: &AccountId, asset: &Asset) -> Result<Balance, EscrowError> {
        self.ledger.balance(account, asset)
    }

    /// Ledger records written on behalf of a trade, in sequence order.
    pub fn audit_trail(&self, trade_id: &TradeId) -> Result<Vec<MutationRecord>, EscrowError> {
        self.ledger.store().records_for_trade(trade_id)
    }

    /// Deposit. `reference` is the funding collaborator's idempotency key.
    pub fn credit(
        &self,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        reference: &str,
    ) -> Result<MutationRecord, EscrowError> {
        let token = MutationToken::external(reference);
        let record = self.with_retries_external(reference, || {
            self.ledger.credit(account, asset, amount, &token)
        })?;
        info!(%account, %asset, amount, reference, "account credited");
        Ok(record)
    }

    /// Withdrawal. Fails with `InsufficientFunds` when `available < amount`.
    pub fn debit(
        &self,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        reference: &str,
    ) -> Result<MutationRecord, EscrowError> {
        let token = MutationToken::external(reference);
        let record = self.with_retries_external(reference, || {
            self.ledger.debit(account, asset, amount, &token)
        })?;
        info!(%account, %asset, amount, reference, "account debited");
        Ok(record)
    }

    /// Expires every `pending` trade past its payment window. Intended for an
    /// external sweeper; the same transition runs lazily on access.
    pub fn expire_due_trades(&self) -> Result<Vec<TradeId>, EscrowError> {
        let now = self.clock.now();
        let window = self.config.payment_window();
        let mut expired = vec![];

        for record in self.trades.list()? {
            if !record.is_expired(now, window) {
                continue;
            }
            if self.gated(record.id(), || self.expire_if_due(record.id()))?.is_some() {
                expired.push(record.id().clone());
            }
        }
        Ok(expired)
    }

    /// Runs `op` holding the trade's gate. The entry is dropped again once no
    /// other caller holds or waits on it; clones are only taken under the
    /// shard lock, so a removed gate is never shared.
    fn gated<T>(
        &self,
        trade_id: &TradeId,
        op: impl FnOnce() -> Result<T, EscrowError>,
    ) -> Result<T, EscrowError> {
        let gate = self.gates.entry(trade_id.clone()).or_default().clone();
        let result = {
            let _guard = gate.lock();
            op()
        };
        drop(gate);
        self.gates
            .remove_if(trade_id, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    // caller must hold the trade's gate
    fn expire_if_due(&self, trade_id: &TradeId) -> Result<Option<TradeStatus>, EscrowError> {
        let record = match self.trades.get(trade_id)? {
            Some(record) => record,
            None => return Ok(None),
        };
        if !record.is_expired(self.clock.now(), self.config.payment_window()) {
            return Ok(None);
        }

        // derived from the version so a retried expiry replays
        let request_id = format!("expire/{trade_id}/{}", record.version());
        let digest = utils::digest(&(trade_id, TradeEvent::Expire, &Actor::System))?;
        let committed = self.with_retries(trade_id, || {
            self.commit_event(
                trade_id,
                TradeEvent::Expire,
                &Actor::System,
                None,
                &request_id,
                &digest,
            )
        })?;
        Ok(Some(committed.outcome.status))
    }

    fn commit_open(
        &self,
        trade_id: &TradeId,
        terms: &TradeTerms,
        request_id: &str,
        digest: &str,
    ) -> Result<Committed, EscrowError> {
        let now = self.clock.now();
        let fee = self.config.fee.as_ref();

        let result = flatten(
            (
                self.trades.trades_tree(),
                self.trades.requests_tree(),
                self.ledger.store().balances_tree(),
                self.ledger.store().journal_tree(),
            )
                .transaction(|(trades, requests, balances, journal)| {
                    let store = TradeTx::new(trades, requests);
                    if let Some(outcome) = store.replay(request_id, digest)? {
                        return Ok(Committed {
                            outcome,
                            replayed: true,
                        });
                    }

                    let ledger = LedgerTx::new(balances, journal, now);
                    let record = machine::open(trade_id.clone(), terms.clone(), fee, &ledger, now)?;
                    let outcome = RequestOutcome {
                        digest: digest.to_string(),
                        trade_id: trade_id.clone(),
                        status: record.status(),
                        version: record.version(),
                    };
                    store.save(&record)?;
                    store.remember(request_id, &outcome)?;

                    Ok(Committed {
                        outcome,
                        replayed: false,
                    })
                }),
        );

        self.settle_commit(result)
    }

    fn commit_event(
        &self,
        trade_id: &TradeId,
        event: TradeEvent,
        actor: &Actor,
        expected_version: Option<u64>,
        request_id: &str,
        digest: &str,
    ) -> Result<Committed, EscrowError> {
        let now = self.clock.now();
        let window = self.config.payment_window();

        let result = flatten(
            (
                self.trades.trades_tree(),
                self.trades.requests_tree(),
                self.ledger.store().balances_tree(),
                self.ledger.store().journal_tree(),
            )
                .transaction(|(trades, requests, balances, journal)| {
                    let store = TradeTx::new(trades, requests);
                    if let Some(outcome) = store.replay(request_id, digest)? {
                        return Ok(Committed {
                            outcome,
                            replayed: true,
                        });
                    }

                    let mut record = store.load(trade_id)?;
                    if let Some(expected) = expected_version {
                        if record.version() != expected {
                            return Err(abort(EscrowError::ConcurrencyConflict {
                                trade_id: trade_id.clone(),
                                expected,
                                actual: record.version(),
                            }));
                        }
                    }

                    let ledger = LedgerTx::new(balances, journal, now);
                    let status = machine::apply(&mut record, event, actor, &ledger, now, window)?;
                    let outcome = RequestOutcome {
                        digest: digest.to_string(),
                        trade_id: trade_id.clone(),
                        status,
                        version: record.version(),
                    };
                    store.save(&record)?;
                    store.remember(request_id, &outcome)?;

                    Ok(Committed {
                        outcome,
                        replayed: false,
                    })
                }),
        );

        match &result {
            Ok(committed) if committed.replayed => {
                debug!(%trade_id, %event, request_id, "event replayed");
            }
            Ok(committed) => info!(
                %trade_id,
                %event,
                %actor,
                status = %committed.outcome.status,
                version = committed.outcome.version,
                "trade advanced"
            ),
            Err(err) if err.is_business_rejection() => {
                debug!(%trade_id, %event, %actor, error = %err, "event rejected");
            }
            Err(_) => {}
        }
        self.settle_commit(result)
    }

    fn settle_commit(&self, result: Result<Committed, EscrowError>) -> Result<Committed, EscrowError> {
        match result {
            Ok(committed) => {
                if self.config.flush_on_commit {
                    self.instance.flush()?;
                }
                Ok(committed)
            }
            Err(err) => {
                ledger::report(&err);
                Err(err)
            }
        }
    }

    /// Retries storage failures; every attempt reuses the same request id so
    /// an attempt that did commit is replayed rather than applied again.
    fn with_retries<T>(
        &self,
        trade_id: &TradeId,
        op: impl FnMut() -> Result<T, EscrowError>,
    ) -> Result<T, EscrowError> {
        self.retry_loop(&trade_id.to_string(), op)
    }

    fn with_retries_external<T>(
        &self,
        reference: &str,
        op: impl FnMut() -> Result<T, EscrowError>,
    ) -> Result<T, EscrowError> {
        let result = self.retry_loop(reference, op);
        if let Err(err) = &result {
            if !matches!(err, EscrowError::Transient { .. }) {
                debug!(reference, error = %err, "ledger request rejected");
            }
        }
        result
    }

    fn retry_loop<T>(
        &self,
        key: &str,
        mut op: impl FnMut() -> Result<T, EscrowError>,
    ) -> Result<T, EscrowError> {
        let mut attempt: u32 = 1;
        loop {
            match op() {
                Err(EscrowError::Storage(source)) => {
                    if attempt >= self.config.max_attempts {
                        warn!(key, attempts = attempt, error = %source, "storage retries exhausted");
                        return Err(EscrowError::Transient {
                            attempts: attempt,
                            source,
                        });
                    }
                    warn!(key, attempt, error = %source, "storage failure, retrying");
                    std::thread::sleep(std::time::Duration::from_millis(
                        self.config.retry_backoff_ms.saturating_mul(u64::from(attempt)),
                    ));
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
