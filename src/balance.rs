//! Per account, per asset balance with available and locked buckets
use crate::types::Amount;

/// Fields are private; every mutation goes through a checked method so that
/// neither bucket can go negative or wrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Balance {
    #[n(0)]
    available: Amount,
    #[n(1)]
    locked: Amount,
}

/// Why a balance refused a mutation. The ledger attaches account and asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceFault {
    Available { available: Amount },
    Locked { locked: Amount },
    Overflow,
}

impl Balance {
    pub fn new(available: Amount, locked: Amount) -> Self {
        Self { available, locked }
    }
    pub fn available(&self) -> Amount {
        self.available
    }
    pub fn locked(&self) -> Amount {
        self.locked
    }
    /// None only if the stored buckets were corrupted past u64.
    pub fn total(&self) -> Option<Amount> {
        self.available.checked_add(self.locked)
    }

    pub fn credit(&mut self, amount: Amount) -> Result<(), BalanceFault> {
        self.available = self
            .available
            .checked_add(amount)
            .ok_or(BalanceFault::Overflow)?;
        Ok(())
    }

    pub fn debit(&mut self, amount: Amount) -> Result<(), BalanceFault> {
        self.available = self
            .available
            .checked_sub(amount)
            .ok_or(BalanceFault::Available {
                available: self.available,
            })?;
        Ok(())
    }

    pub fn lock(&mut self, amount: Amount) -> Result<(), BalanceFault> {
        let available = self
            .available
            .checked_sub(amount)
            .ok_or(BalanceFault::Available {
                available: self.available,
            })?;
        let locked = self
            .locked
            .checked_add(amount)
            .ok_or(BalanceFault::Overflow)?;
        self.available = available;
        self.locked = locked;
        Ok(())
    }

    pub fn unlock(&mut self, amount: Amount) -> Result<(), BalanceFault> {
        let locked = self.locked.checked_sub(amount).ok_or(BalanceFault::Locked {
            locked: self.locked,
        })?;
        let available = self
            .available
            .checked_add(amount)
            .ok_or(BalanceFault::Overflow)?;
        self.available = available;
        self.locked = locked;
        Ok(())
    }

    /// Removes value from the locked bucket without returning it to available.
    pub fn release(&mut self, amount: Amount) -> Result<(), BalanceFault> {
        self.locked = self.locked.checked_sub(amount).ok_or(BalanceFault::Locked {
            locked: self.locked,
        })?;
        Ok(())
    }
}
