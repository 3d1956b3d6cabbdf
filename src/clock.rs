//! Virtual simulation clock.
//!
//! The simulation never reads wall time. `SimTime` is a millisecond counter
//! owned by the connection registry and advanced explicitly, so every timer
//! expiry is driven by the test or host application and nothing fires
//! between two calls.

use std::fmt;
use std::ops::Add;
use std::time::Duration;

/// A point in virtual time, in milliseconds since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Elapsed virtual time since `earlier`, zero if `earlier` is later.
    pub fn duration_since(&self, earlier: SimTime) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> SimTime {
        SimTime(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t+{}ms", self.0)
    }
}
