//! Sync tick model

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value of the global sync clock.
///
/// Ticks are assigned by the sequencer, one per committed mutation, and only
/// ever move forward.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SyncTick(i64);

impl SyncTick {
    /// The tick before any mutation has been recorded
    pub const ZERO: Self = Self(0);

    /// Wrap a raw tick value
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Raw tick value as stored in the database
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SyncTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SyncTick {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A pair of ticks reserved together.
///
/// `tick` is never stamped on a row, so it is a safe exclusive upper bound for
/// anything read at the moment of reservation. `tock` is unique to the caller
/// and may be stamped on the rows it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickTock {
    pub tick: SyncTick,
    pub tock: SyncTick,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_ordering() {
        assert!(SyncTick::new(2) > SyncTick::new(1));
        assert_eq!(SyncTick::default(), SyncTick::ZERO);
    }

    #[test]
    fn test_tick_serializes_as_integer() {
        let json = serde_json::to_string(&SyncTick::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
