//! Append-only ledger mutation records and their idempotency tokens
use std::fmt;

use crate::balance::Balance;
use crate::types::{AccountId, Amount, Asset, TimeStamp, TradeId};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    #[n(0)]
    Lock,
    #[n(1)]
    Unlock,
    #[n(2)]
    Release,
    #[n(3)]
    Credit,
    #[n(4)]
    Debit,
}

/// Key under which a mutation is journaled. Replaying a token never applies
/// the mutation twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationToken {
    Trade {
        trade_id: TradeId,
        seq: u32,
        kind: MutationKind,
    },
    External(String),
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    #[n(0)]
    pub token: String,
    #[n(1)]
    pub trade_id: Option<TradeId>,
    #[n(2)]
    pub account: AccountId,
    #[n(3)]
    pub asset: Asset,
    #[n(4)]
    pub kind: MutationKind,
    #[n(5)]
    pub amount: Amount,
    #[n(6)]
    pub available_after: Amount,
    #[n(7)]
    pub locked_after: Amount,
    #[n(8)]
    pub recorded_at: TimeStamp,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationKind::Lock => "lock",
            MutationKind::Unlock => "unlock",
            MutationKind::Release => "release",
            MutationKind::Credit => "credit",
            MutationKind::Debit => "debit",
        };
        f.write_str(name)
    }
}

impl MutationToken {
    pub fn trade(trade_id: &TradeId, seq: u32, kind: MutationKind) -> Self {
        MutationToken::Trade {
            trade_id: trade_id.clone(),
            seq,
            kind,
        }
    }
    pub fn external(reference: &str) -> Self {
        MutationToken::External(reference.to_string())
    }

    /// Trade keys sort by sequence under a common trade prefix.
    pub fn key(&self) -> String {
        match self {
            MutationToken::Trade {
                trade_id,
                seq,
                kind,
            } => format!("{}{seq:06}/{kind}", Self::trade_prefix(trade_id)),
            MutationToken::External(reference) => format!("ext/{reference}"),
        }
    }
    pub fn trade_id(&self) -> Option<&TradeId> {
        match self {
            MutationToken::Trade { trade_id, .. } => Some(trade_id),
            MutationToken::External(_) => None,
        }
    }
    pub(crate) fn trade_prefix(trade_id: &TradeId) -> String {
        format!("{trade_id}/")
    }
}

impl MutationRecord {
    pub fn new(
        token: &MutationToken,
        account: &AccountId,
        asset: &Asset,
        kind: MutationKind,
        amount: Amount,
        after: Balance,
        recorded_at: TimeStamp,
    ) -> Self {
        Self {
            token: token.key(),
            trade_id: token.trade_id().cloned(),
            account: account.clone(),
            asset: asset.clone(),
            kind,
            amount,
            available_after: after.available(),
            locked_after: after.locked(),
            recorded_at,
        }
    }

    /// Whether a stored record describes the same mutation as a replayed call.
    pub fn matches(&self, account: &AccountId, asset: &Asset, kind: MutationKind, amount: Amount) -> bool {
        self.account == *account && self.asset == *asset && self.kind == kind && self.amount == amount
    }
}
