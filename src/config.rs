//! Runtime configuration for the escrow service
//!
//! Values come from an optional file and from `ESCROW__*` environment
//! variables, e.g. `ESCROW__PAYMENT_WINDOW_SECS=900`. Every field has a default.
use std::path::Path;

use chrono::Duration;
use config::{Config, Environment, File};

use crate::error::EscrowError;
use crate::types::{AccountId, Amount};

const BPS_DENOMINATOR: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct EscrowConfig {
    /// How long a `pending` trade waits for the buyer to mark payment.
    pub payment_window_secs: u64,
    /// Attempts per transition when storage fails.
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Flush the database before acknowledging a commit.
    pub flush_on_commit: bool,
    pub fee: Option<FeeSchedule>,
}

/// Platform fee charged to the seller on top of the traded amount.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct FeeSchedule {
    pub bps: u32,
    pub collector: AccountId,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            payment_window_secs: 30 * 60,
            max_attempts: 3,
            retry_backoff_ms: 25,
            flush_on_commit: true,
            fee: None,
        }
    }
}

impl EscrowConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, EscrowError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: EscrowConfig = builder
            .add_source(
                Environment::with_prefix("ESCROW")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EscrowError> {
        if self.max_attempts == 0 {
            return Err(EscrowError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if i64::try_from(self.payment_window_secs).is_err() {
            return Err(EscrowError::InvalidConfig(
                "payment_window_secs is out of range".into(),
            ));
        }
        if let Some(fee) = &self.fee {
            if u64::from(fee.bps) > BPS_DENOMINATOR {
                return Err(EscrowError::InvalidConfig(format!(
                    "fee of {} bps exceeds 100%",
                    fee.bps
                )));
            }
        }
        Ok(())
    }

    pub fn payment_window(&self) -> Duration {
        Duration::try_seconds(self.payment_window_secs as i64).unwrap_or(Duration::MAX)
    }

    pub fn with_payment_window_secs(mut self, secs: u64) -> Self {
        self.payment_window_secs = secs;
        self
    }
    pub fn with_fee(mut self, bps: u32, collector: AccountId) -> Self {
        self.fee = Some(FeeSchedule { bps, collector });
        self
    }
}

impl FeeSchedule {
    /// Fee for `amount`, rounded down.
    pub fn fee_for(&self, amount: Amount) -> Result<Amount, EscrowError> {
        let fee = u128::from(amount) * u128::from(self.bps) / u128::from(BPS_DENOMINATOR);
        Amount::try_from(fee).map_err(|_| EscrowError::Overflow("fee"))
    }
}
