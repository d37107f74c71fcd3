use std::convert::Infallible;

use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};

use crate::context::{Actor, TradeEvent};
use crate::trade::TradeStatus;
use crate::types::{AccountId, Amount, Asset, TimeStamp, TradeId};

#[derive(thiserror::Error, Debug)]
pub enum EscrowError {
    #[error("insufficient funds: {account} holds {available} {asset} available, {requested} requested")]
    InsufficientFunds {
        account: AccountId,
        asset: Asset,
        requested: Amount,
        available: Amount,
    },
    #[error("insufficient locked funds: {account} holds {locked} {asset} locked, {requested} requested")]
    InsufficientLockedFunds {
        account: AccountId,
        asset: Asset,
        requested: Amount,
        locked: Amount,
    },
    #[error("{event} is not a valid transition from {from}")]
    InvalidTransition { from: TradeStatus, event: TradeEvent },
    #[error("trade {0} not found")]
    NotFound(TradeId),
    #[error("trade {trade_id} moved to version {actual} while version {expected} was expected")]
    ConcurrencyConflict {
        trade_id: TradeId,
        expected: u64,
        actual: u64,
    },
    #[error("{actor} may not {event} trade {trade_id}")]
    Unauthorized {
        trade_id: TradeId,
        actor: Actor,
        event: TradeEvent,
    },
    #[error("trade {trade_id} cannot expire before {deadline}")]
    NotYetExpired {
        trade_id: TradeId,
        deadline: TimeStamp,
    },
    #[error("amount must be greater than zero")]
    ZeroAmount,
    #[error("invalid trade terms: {0}")]
    InvalidTerms(String),
    #[error("arithmetic overflow while computing {0}")]
    Overflow(&'static str),
    #[error("idempotency token {0} was already used for a different request")]
    IdempotencyMismatch(String),
    #[error("storage still failing after {attempts} attempts")]
    Transient {
        attempts: u32,
        #[source]
        source: sled::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to build identifier: {0}")]
    Identifier(String),
    #[error(transparent)]
    Storage(#[from] sled::Error),
    #[error(transparent)]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error(transparent)]
    Decode(#[from] minicbor::decode::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl EscrowError {
    /// Locked funds can only run short when escrow bookkeeping is broken.
    pub fn is_invariant_breach(&self) -> bool {
        matches!(self, EscrowError::InsufficientLockedFunds { .. })
    }

    /// Legitimate rejections that callers must not retry.
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            EscrowError::InsufficientFunds { .. }
                | EscrowError::InvalidTransition { .. }
                | EscrowError::NotFound(_)
                | EscrowError::Unauthorized { .. }
                | EscrowError::NotYetExpired { .. }
                | EscrowError::ZeroAmount
                | EscrowError::InvalidTerms(_)
        )
    }

    /// Failures a caller can retry with the same request id.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EscrowError::ConcurrencyConflict { .. } | EscrowError::Transient { .. }
        )
    }
}

pub(crate) type TxResult<T> = Result<T, ConflictableTransactionError<EscrowError>>;

/// Aborts the surrounding sled transaction with `err`.
pub(crate) fn abort<E: Into<EscrowError>>(err: E) -> ConflictableTransactionError<EscrowError> {
    ConflictableTransactionError::Abort(err.into())
}

pub(crate) fn flatten<T>(result: TransactionResult<T, EscrowError>) -> Result<T, EscrowError> {
    result.map_err(|err| match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => EscrowError::Storage(err),
    })
}
