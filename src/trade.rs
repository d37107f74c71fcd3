//! Trade terms, escrow linkage and the persisted trade record
use std::fmt;

use chrono::Duration;

use crate::context::{Actor, Witness};
use crate::error::EscrowError;
use crate::types::{AccountId, Amount, Asset, TimeStamp, TradeId};
use crate::utils;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Paid,
    /// Seller has confirmed receipt; settles in the same commit.
    #[n(2)]
    Confirmed,
    #[n(3)]
    Disputed,
    #[n(4)]
    Completed,
    #[n(5)]
    Cancelled,
}

// used for constructing terms before a trade is opened
#[derive(Debug, Default)]
pub struct TradeTermsBuilder {
    seller: Option<AccountId>,
    buyer: Option<AccountId>,
    asset: Option<Asset>,
    amount: Amount,
    price: u64,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TradeTerms {
    #[n(0)]
    pub seller: AccountId,
    #[n(1)]
    pub buyer: AccountId,
    #[n(2)]
    pub asset: Asset,
    #[n(3)]
    pub amount: Amount,
    #[n(4)]
    pub price: u64, // per unit, in the quote currency's minor units
    #[n(5)]
    pub total: u64,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowResolution {
    /// Lock released to the buyer (and fee collector).
    #[n(0)]
    Released,
    /// Lock returned to the seller's available funds.
    #[n(1)]
    Returned,
}

/// Which funds the trade holds and what became of them.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct EscrowLink {
    #[n(0)]
    pub account: AccountId,
    #[n(1)]
    pub asset: Asset,
    #[n(2)]
    pub locked: Amount, // amount + fee
    #[n(3)]
    pub fee: Amount,
    #[n(4)]
    pub fee_collector: Option<AccountId>,
    #[n(5)]
    pub resolution: Option<EscrowResolution>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TradeRecord {
    #[n(0)]
    id: TradeId,
    #[n(1)]
    terms: TradeTerms,
    #[n(2)]
    terms_digest: String,
    #[n(3)]
    status: TradeStatus,
    #[n(4)]
    escrow: EscrowLink,
    #[n(5)]
    created_at: TimeStamp,
    #[n(6)]
    status_entered_at: TimeStamp,
    #[n(7)]
    closed_at: Option<TimeStamp>,
    #[n(8)]
    version: u64,
    #[n(9)]
    ledger_seq: u32,
    #[n(10)]
    cancel_consent: Vec<AccountId>,
    #[n(11)]
    history: Vec<Witness>,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Completed | TradeStatus::Cancelled)
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Paid => "paid",
            TradeStatus::Confirmed => "confirmed",
            TradeStatus::Disputed => "disputed",
            TradeStatus::Completed => "completed",
            TradeStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl TradeTermsBuilder {
    pub fn set_seller(mut self, seller: AccountId) -> Self {
        self.seller = Some(seller);
        self
    }
    pub fn set_buyer(mut self, buyer: AccountId) -> Self {
        self.buyer = Some(buyer);
        self
    }
    pub fn set_asset(mut self, asset: Asset) -> Self {
        self.asset = Some(asset);
        self
    }
    pub fn set_amount(mut self, amount: Amount) -> Self {
        self.amount = amount;
        self
    }
    pub fn set_price(mut self, price: u64) -> Self {
        self.price = price;
        self
    }

    /// Checks every field and computes the total.
    pub fn build(self) -> Result<TradeTerms, EscrowError> {
        let seller = self
            .seller
            .ok_or_else(|| EscrowError::InvalidTerms("seller is not set".into()))?;
        let buyer = self
            .buyer
            .ok_or_else(|| EscrowError::InvalidTerms("buyer is not set".into()))?;
        if seller == buyer {
            return Err(EscrowError::InvalidTerms(
                "buyer and seller must be different accounts".into(),
            ));
        }
        let asset = self
            .asset
            .ok_or_else(|| EscrowError::InvalidTerms("asset is not set".into()))?;
        if self.amount == 0 {
            return Err(EscrowError::ZeroAmount);
        }
        if self.price == 0 {
            return Err(EscrowError::InvalidTerms("price is set to zero".into()));
        }
        let total = self
            .amount
            .checked_mul(self.price)
            .ok_or(EscrowError::Overflow("trade total"))?;

        Ok(TradeTerms {
            seller,
            buyer,
            asset,
            amount: self.amount,
            price: self.price,
            total,
        })
    }
}

impl TradeTerms {
    pub fn builder() -> TradeTermsBuilder {
        TradeTermsBuilder::default()
    }

    pub fn digest(&self) -> Result<String, EscrowError> {
        utils::digest(self)
    }

    pub fn is_party(&self, account: &AccountId) -> bool {
        self.seller == *account || self.buyer == *account
    }
}

impl TradeRecord {
    pub(crate) fn open(
        id: TradeId,
        terms: TradeTerms,
        escrow: EscrowLink,
        opened_by: Actor,
        now: TimeStamp,
        lock_token: String,
    ) -> Result<Self, EscrowError> {
        let terms_digest = terms.digest()?;
        Ok(Self {
            id,
            terms,
            terms_digest,
            status: TradeStatus::Pending,
            escrow,
            created_at: now,
            status_entered_at: now,
            closed_at: None,
            version: 1,
            ledger_seq: 1,
            cancel_consent: vec![],
            history: vec![Witness::opened(opened_by, now, lock_token)],
        })
    }

    pub fn id(&self) -> &TradeId {
        &self.id
    }
    pub fn terms(&self) -> &TradeTerms {
        &self.terms
    }
    pub fn terms_digest(&self) -> &str {
        &self.terms_digest
    }
    pub fn status(&self) -> TradeStatus {
        self.status
    }
    pub fn escrow(&self) -> &EscrowLink {
        &self.escrow
    }
    pub fn created_at(&self) -> TimeStamp {
        self.created_at
    }
    pub fn status_entered_at(&self) -> TimeStamp {
        self.status_entered_at
    }
    pub fn closed_at(&self) -> Option<TimeStamp> {
        self.closed_at
    }
    pub fn version(&self) -> u64 {
        self.version
    }
    pub fn cancel_consent(&self) -> &[AccountId] {
        &self.cancel_consent
    }
    pub fn history(&self) -> &[Witness] {
        &self.history
    }

    /// None while the trade is not waiting for payment.
    pub fn payment_deadline(&self, window: Duration) -> Option<TimeStamp> {
        if self.status != TradeStatus::Pending {
            return None;
        }
        self.status_entered_at.checked_add(window)
    }

    pub fn is_expired(&self, now: TimeStamp, window: Duration) -> bool {
        self.payment_deadline(window)
            .is_some_and(|deadline| now >= deadline)
    }

    /// Journal keys written on behalf of this trade, in order.
    pub fn mutation_tokens(&self) -> impl Iterator<Item = &str> {
        self.history
            .iter()
            .flat_map(|witness| witness.mutations.iter().map(String::as_str))
    }

    pub(crate) fn next_seq(&mut self) -> u32 {
        let seq = self.ledger_seq;
        self.ledger_seq += 1;
        seq
    }

    pub(crate) fn set_status(&mut self, to: TradeStatus, now: TimeStamp) {
        self.status = to;
        self.status_entered_at = now;
        self.cancel_consent.clear();
        if to.is_terminal() {
            self.closed_at = Some(now);
        }
    }

    pub(crate) fn resolve_escrow(&mut self, resolution: EscrowResolution) {
        self.escrow.resolution = Some(resolution);
    }

    /// Records a party's cancel consent; true once both parties agreed.
    pub(crate) fn consent_to_cancel(&mut self, party: &AccountId) -> bool {
        if !self.cancel_consent.contains(party) {
            self.cancel_consent.push(party.clone());
        }
        self.cancel_consent.contains(&self.terms.seller)
            && self.cancel_consent.contains(&self.terms.buyer)
    }

    pub(crate) fn push_witness(&mut self, witness: Witness) {
        self.history.push(witness);
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }
}
