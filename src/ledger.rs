//! Balance ledger: durable balances, the mutation journal and the five escrow
//! primitives (lock, unlock, release, credit, debit).
//!
//! [`LedgerTx`] runs the primitives inside a caller's sled transaction so a
//! trade transition and its balance effects commit together. [`LedgerService`]
//! wraps each primitive in a transaction of its own for deposit and
//! withdrawal flows.
use std::sync::Arc;

use sled::transaction::TransactionalTree;
use sled::{Db, Transactional, Tree};
use tracing::{debug, error};

use crate::balance::{Balance, BalanceFault};
use crate::clock::Clock;
use crate::error::{EscrowError, TxResult, abort, flatten};
use crate::journal::{MutationKind, MutationRecord, MutationToken};
use crate::types::{AccountId, Amount, Asset, TimeStamp, TradeId};

pub const BALANCES_TREE: &str = "balances";
pub const JOURNAL_TREE: &str = "journal";

#[derive(Clone)]
pub struct LedgerStore {
    balances: Tree,
    journal: Tree,
}

pub struct LedgerTx<'a> {
    balances: &'a TransactionalTree,
    journal: &'a TransactionalTree,
    now: TimeStamp,
}

#[derive(Clone)]
pub struct LedgerService {
    store: LedgerStore,
    clock: Arc<dyn Clock>,
}

// account bytes followed by the asset symbol
fn balance_key(account: &AccountId, asset: &Asset) -> Vec<u8> {
    let mut key = account.as_bytes().to_vec();
    key.extend_from_slice(asset.as_str().as_bytes());
    key
}

fn split_balance_key(key: &[u8]) -> Result<(AccountId, Asset), EscrowError> {
    if key.len() <= 16 {
        return Err(minicbor::decode::Error::message("balance key is too short").into());
    }
    let (account, asset) = key.split_at(16);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(account);
    let symbol = std::str::from_utf8(asset)
        .map_err(|_| minicbor::decode::Error::message("balance key asset is not utf-8"))?;

    Ok((AccountId::from_bytes(bytes), Asset::new(symbol)?))
}

fn fault_to_error(
    fault: BalanceFault,
    account: &AccountId,
    asset: &Asset,
    requested: Amount,
) -> EscrowError {
    match fault {
        BalanceFault::Available { available } => EscrowError::InsufficientFunds {
            account: account.clone(),
            asset: asset.clone(),
            requested,
            available,
        },
        BalanceFault::Locked { locked } => EscrowError::InsufficientLockedFunds {
            account: account.clone(),
            asset: asset.clone(),
            requested,
            locked,
        },
        BalanceFault::Overflow => EscrowError::Overflow("balance"),
    }
}

/// Logs an invariant breach loudly; other failures are the caller's to report.
pub(crate) fn report(err: &EscrowError) {
    if err.is_invariant_breach() {
        error!(target: "escrow::invariant", error = %err, "locked funds short, escrow bookkeeping is inconsistent");
    }
}

impl LedgerStore {
    pub fn open(db: &Db) -> Result<Self, EscrowError> {
        Ok(Self {
            balances: db.open_tree(BALANCES_TREE)?,
            journal: db.open_tree(JOURNAL_TREE)?,
        })
    }

    /// Unknown account/asset pairs read as zero.
    pub fn balance(&self, account: &AccountId, asset: &Asset) -> Result<Balance, EscrowError> {
        match self.balances.get(balance_key(account, asset))? {
            Some(bytes) => Ok(minicbor::decode(&bytes)?),
            None => Ok(Balance::default()),
        }
    }

    pub fn balances(&self) -> Result<Vec<(AccountId, Asset, Balance)>, EscrowError> {
        let mut out = vec![];
        for entry in self.balances.iter() {
            let (key, value) = entry?;
            let (account, asset) = split_balance_key(&key)?;
            out.push((account, asset, minicbor::decode(&value)?));
        }
        Ok(out)
    }

    pub fn record(&self, token: &MutationToken) -> Result<Option<MutationRecord>, EscrowError> {
        match self.journal.get(token.key().as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn records_for_trade(&self, trade_id: &TradeId) -> Result<Vec<MutationRecord>, EscrowError> {
        let prefix = MutationToken::trade_prefix(trade_id);
        let mut out = vec![];
        for entry in self.journal.scan_prefix(prefix.as_bytes()) {
            let (_, value) = entry?;
            out.push(minicbor::decode(&value)?);
        }
        Ok(out)
    }

    pub fn records(&self) -> Result<Vec<MutationRecord>, EscrowError> {
        let mut out = vec![];
        for entry in self.journal.iter() {
            let (_, value) = entry?;
            out.push(minicbor::decode(&value)?);
        }
        Ok(out)
    }

    pub(crate) fn balances_tree(&self) -> &Tree {
        &self.balances
    }
    pub(crate) fn journal_tree(&self) -> &Tree {
        &self.journal
    }
}

impl<'a> LedgerTx<'a> {
    pub fn new(
        balances: &'a TransactionalTree,
        journal: &'a TransactionalTree,
        now: TimeStamp,
    ) -> Self {
        Self {
            balances,
            journal,
            now,
        }
    }

    pub fn balance(&self, account: &AccountId, asset: &Asset) -> TxResult<Balance> {
        match self.balances.get(balance_key(account, asset))? {
            Some(bytes) => minicbor::decode(&bytes).map_err(abort),
            None => Ok(Balance::default()),
        }
    }

    pub fn lock(
        &self,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        token: &MutationToken,
    ) -> TxResult<MutationRecord> {
        self.apply(MutationKind::Lock, account, asset, amount, token)
    }

    pub fn unlock(
        &self,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        token: &MutationToken,
    ) -> TxResult<MutationRecord> {
        self.apply(MutationKind::Unlock, account, asset, amount, token)
    }

    /// Removes locked funds; the counterparty credit is a separate call in
    /// the same transaction.
    pub fn release(
        &self,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        token: &MutationToken,
    ) -> TxResult<MutationRecord> {
        self.apply(MutationKind::Release, account, asset, amount, token)
    }

    pub fn credit(
        &self,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        token: &MutationToken,
    ) -> TxResult<MutationRecord> {
        self.apply(MutationKind::Credit, account, asset, amount, token)
    }

    pub fn debit(
        &self,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        token: &MutationToken,
    ) -> TxResult<MutationRecord> {
        self.apply(MutationKind::Debit, account, asset, amount, token)
    }

    fn apply(
        &self,
        kind: MutationKind,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        token: &MutationToken,
    ) -> TxResult<MutationRecord> {
        if amount == 0 {
            return Err(abort(EscrowError::ZeroAmount));
        }

        let key = token.key();
        if let Some(bytes) = self.journal.get(key.as_bytes())? {
            let existing: MutationRecord = minicbor::decode(&bytes).map_err(abort)?;
            if existing.matches(account, asset, kind, amount) {
                return Ok(existing);
            }
            return Err(abort(EscrowError::IdempotencyMismatch(key)));
        }

        let mut balance = self.balance(account, asset)?;
        let applied = match kind {
            MutationKind::Lock => balance.lock(amount),
            MutationKind::Unlock => balance.unlock(amount),
            MutationKind::Release => balance.release(amount),
            MutationKind::Credit => balance.credit(amount),
            MutationKind::Debit => balance.debit(amount),
        };
        applied.map_err(|fault| abort(fault_to_error(fault, account, asset, amount)))?;

        let record = MutationRecord::new(token, account, asset, kind, amount, balance, self.now);
        self.balances.insert(
            balance_key(account, asset),
            minicbor::to_vec(balance).map_err(abort)?,
        )?;
        self.journal
            .insert(key.as_bytes(), minicbor::to_vec(&record).map_err(abort)?)?;

        Ok(record)
    }
}

impl LedgerService {
    pub fn new(store: LedgerStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn balance(&self, account: &AccountId, asset: &Asset) -> Result<Balance, EscrowError> {
        self.store.balance(account, asset)
    }

    pub fn lock(
        &self,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        token: &MutationToken,
    ) -> Result<MutationRecord, EscrowError> {
        self.run(|tx| tx.lock(account, asset, amount, token))
    }

    pub fn unlock(
        &self,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        token: &MutationToken,
    ) -> Result<MutationRecord, EscrowError> {
        self.run(|tx| tx.unlock(account, asset, amount, token))
    }

    pub fn release(
        &self,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        token: &MutationToken,
    ) -> Result<MutationRecord, EscrowError> {
        self.run(|tx| tx.release(account, asset, amount, token))
    }

    pub fn credit(
        &self,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        token: &MutationToken,
    ) -> Result<MutationRecord, EscrowError> {
        self.run(|tx| tx.credit(account, asset, amount, token))
    }

    pub fn debit(
        &self,
        account: &AccountId,
        asset: &Asset,
        amount: Amount,
        token: &MutationToken,
    ) -> Result<MutationRecord, EscrowError> {
        self.run(|tx| tx.debit(account, asset, amount, token))
    }

    fn run<F>(&self, op: F) -> Result<MutationRecord, EscrowError>
    where
        F: Fn(&LedgerTx<'_>) -> TxResult<MutationRecord>,
    {
        let now = self.clock.now();
        let result = flatten(
            (self.store.balances_tree(), self.store.journal_tree())
                .transaction(|(balances, journal)| op(&LedgerTx::new(balances, journal, now))),
        );

        match &result {
            Ok(record) => debug!(
                token = %record.token,
                kind = %record.kind,
                amount = record.amount,
                available = record.available_after,
                locked = record.locked_after,
                "ledger mutation applied"
            ),
            Err(err) => report(err),
        }
        result
    }
}
