//! Events, actors and the witness history kept on every trade
use std::fmt;

use crate::trade::TradeStatus;
use crate::types::{AccountId, TimeStamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum TradeEvent {
    /// Buyer reports the off-platform payment as sent.
    #[n(0)]
    MarkPaid,
    /// Seller confirms the payment arrived.
    #[n(1)]
    ConfirmReceipt,
    #[n(2)]
    OpenDispute,
    #[n(3)]
    ResolveForBuyer,
    #[n(4)]
    ResolveForSeller,
    /// Payment window elapsed while `pending`.
    #[n(5)]
    Expire,
    /// One party's consent to a mutual cancellation.
    #[n(6)]
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Actor {
    #[n(0)]
    Party(#[n(0)] AccountId),
    #[n(1)]
    Arbitrator(#[n(0)] String),
    #[n(2)]
    System,
}

// one entry per status change, or per recorded cancel consent
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Witness {
    #[n(0)]
    pub from: Option<TradeStatus>, // None for the opening witness
    #[n(1)]
    pub to: TradeStatus,
    #[n(2)]
    pub event: Option<TradeEvent>,
    #[n(3)]
    pub actor: Actor,
    #[n(4)]
    pub recorded_at: TimeStamp,
    #[n(5)]
    pub mutations: Vec<String>, // journal keys written by this step
}

impl Witness {
    pub fn opened(actor: Actor, recorded_at: TimeStamp, lock_token: String) -> Self {
        Self {
            from: None,
            to: TradeStatus::Pending,
            event: None,
            actor,
            recorded_at,
            mutations: vec![lock_token],
        }
    }
    pub fn new(
        from: TradeStatus,
        to: TradeStatus,
        event: TradeEvent,
        actor: Actor,
        recorded_at: TimeStamp,
        mutations: Vec<String>,
    ) -> Self {
        Self {
            from: Some(from),
            to,
            event: Some(event),
            actor,
            recorded_at,
            mutations,
        }
    }
    pub fn is_status_change(&self) -> bool {
        self.from != Some(self.to)
    }
}

impl fmt::Display for TradeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TradeEvent::MarkPaid => "mark paid",
            TradeEvent::ConfirmReceipt => "confirm receipt",
            TradeEvent::OpenDispute => "open dispute",
            TradeEvent::ResolveForBuyer => "resolve for buyer",
            TradeEvent::ResolveForSeller => "resolve for seller",
            TradeEvent::Expire => "expire",
            TradeEvent::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Party(account) => write!(f, "party {account}"),
            Actor::Arbitrator(name) => write!(f, "arbitrator {name}"),
            Actor::System => f.write_str("system"),
        }
    }
}
