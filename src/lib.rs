pub mod balance;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod machine;
pub mod service;
pub mod store;
pub mod trade;
pub mod types;
pub mod utils;

pub use balance::Balance;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EscrowConfig, FeeSchedule};
pub use context::{Actor, TradeEvent, Witness};
pub use error::EscrowError;
pub use journal::{MutationKind, MutationRecord, MutationToken};
pub use service::{AdvanceCommand, EscrowService};
pub use trade::{TradeRecord, TradeStatus, TradeTerms};
pub use types::{AccountId, Amount, Asset, TimeStamp, TradeId};
