//! Time source for transition timestamps and payment deadlines
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use crate::types::TimeStamp;

pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp {
        Utc::now().into()
    }
}

/// A clock that only moves when told to. Used to drive payment timeouts in
/// tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<TimeStamp>,
}

impl ManualClock {
    pub fn new(start: TimeStamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        if let Some(next) = now.checked_add(by) {
            *now = next;
        }
    }
    pub fn set(&self, to: TimeStamp) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp {
        *self.now.lock()
    }
}
