//! Trade record store and the processed-request table
use sled::transaction::TransactionalTree;
use sled::{Db, Tree};

use crate::error::{EscrowError, TxResult, abort};
use crate::trade::{TradeRecord, TradeStatus};
use crate::types::TradeId;

pub const TRADES_TREE: &str = "trades";
pub const REQUESTS_TREE: &str = "requests";

/// What a processed request produced, kept so a replay returns the same answer.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    #[n(0)]
    pub digest: String, // sha256 of the request payload
    #[n(1)]
    pub trade_id: TradeId,
    #[n(2)]
    pub status: TradeStatus,
    #[n(3)]
    pub version: u64,
}

#[derive(Clone)]
pub struct TradeStore {
    trades: Tree,
    requests: Tree,
}

pub struct TradeTx<'a> {
    trades: &'a TransactionalTree,
    requests: &'a TransactionalTree,
}

impl TradeStore {
    pub fn open(db: &Db) -> Result<Self, EscrowError> {
        Ok(Self {
            trades: db.open_tree(TRADES_TREE)?,
            requests: db.open_tree(REQUESTS_TREE)?,
        })
    }

    pub fn get(&self, trade_id: &TradeId) -> Result<Option<TradeRecord>, EscrowError> {
        match self.trades.get(trade_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn require(&self, trade_id: &TradeId) -> Result<TradeRecord, EscrowError> {
        self.get(trade_id)?
            .ok_or_else(|| EscrowError::NotFound(trade_id.clone()))
    }

    pub fn list(&self) -> Result<Vec<TradeRecord>, EscrowError> {
        let mut out = vec![];
        for entry in self.trades.iter() {
            let (_, value) = entry?;
            out.push(minicbor::decode(&value)?);
        }
        Ok(out)
    }

    pub fn request(&self, request_id: &str) -> Result<Option<RequestOutcome>, EscrowError> {
        match self.requests.get(request_id.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn trades_tree(&self) -> &Tree {
        &self.trades
    }
    pub(crate) fn requests_tree(&self) -> &Tree {
        &self.requests
    }
}

impl<'a> TradeTx<'a> {
    pub fn new(trades: &'a TransactionalTree, requests: &'a TransactionalTree) -> Self {
        Self { trades, requests }
    }

    pub fn load(&self, trade_id: &TradeId) -> TxResult<TradeRecord> {
        match self.trades.get(trade_id.as_str().as_bytes())? {
            Some(bytes) => minicbor::decode(&bytes).map_err(abort),
            None => Err(abort(EscrowError::NotFound(trade_id.clone()))),
        }
    }

    pub fn save(&self, record: &TradeRecord) -> TxResult<()> {
        let bytes = minicbor::to_vec(record).map_err(abort)?;
        self.trades.insert(record.id().as_str().as_bytes(), bytes)?;
        Ok(())
    }

    /// A stored outcome for `request_id`, if it was processed before. A reused
    /// id with a different payload aborts with `IdempotencyMismatch`.
    pub fn replay(&self, request_id: &str, digest: &str) -> TxResult<Option<RequestOutcome>> {
        let Some(bytes) = self.requests.get(request_id.as_bytes())? else {
            return Ok(None);
        };
        let outcome: RequestOutcome = minicbor::decode(&bytes).map_err(abort)?;
        if outcome.digest != digest {
            return Err(abort(EscrowError::IdempotencyMismatch(request_id.to_string())));
        }
        Ok(Some(outcome))
    }

    pub fn remember(&self, request_id: &str, outcome: &RequestOutcome) -> TxResult<()> {
        let bytes = minicbor::to_vec(outcome).map_err(abort)?;
        self.requests.insert(request_id.as_bytes(), bytes)?;
        Ok(())
    }
}
