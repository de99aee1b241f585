//! Clock Module
//!
//! Pluggable time source for the cache engine. Production code uses
//! [`SystemClock`]; tests and simulations can drive expiration
//! deterministically with [`ManualClock`].

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

// == Clock Trait ==
/// A source of the current instant.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

// == System Clock ==
/// Wall-clock time source. The engine default.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// == Manual Clock ==
/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a manual clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock();
        *now += delta;
    }

    /// Sets the clock to an exact instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
