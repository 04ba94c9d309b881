//! Hybrid logical clock.
//!
//! A [`Hlc`] is a `(physical_ms, logical)` pair ordered lexicographically.
//! Local ticks always strictly advance, receiving a remote stamp merges both
//! clocks without ever running behind either, and [`Hlc::ceiling`] yields the
//! supremum of every stamp that can exist within one wall-clock millisecond.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Hybrid logical clock stamp.
///
/// Field order matters: the derived `Ord` is the lexicographic order on
/// `(physical, logical)` the whole crate relies on.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct Hlc {
    /// Wall-clock component in milliseconds since the Unix epoch.
    pub physical: u64,
    /// Logical component disambiguating events within one millisecond.
    pub logical: u32,
}

/// Largest logical value; used by [`Hlc::ceiling`].
pub const MAX_LOGICAL: u32 = u32::MAX;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Hlc {
    /// Builds a stamp from raw components.
    pub fn new(physical: u64, logical: u32) -> Self {
        Self { physical, logical }
    }

    /// Stamp for the current wall-clock millisecond with logical zero.
    pub fn now() -> Self {
        Self::new(wall_clock_ms(), 0)
    }

    /// Returns a stamp strictly greater than `self`.
    ///
    /// Exhausting `u32::MAX` logical ticks within one millisecond is
    /// operationally unreachable; if it happens the physical component is
    /// forced forward instead of wrapping.
    pub fn tick(self) -> Self {
        let physical = wall_clock_ms();
        if physical > self.physical {
            Self::new(physical, 0)
        } else if self.logical == u32::MAX {
            Self::new(self.physical + 1, 0)
        } else {
            Self::new(self.physical, self.logical + 1)
        }
    }

    /// Merges a remote stamp into the local clock.
    ///
    /// The result is strictly greater than both inputs and never runs behind
    /// the local wall clock.
    pub fn receive(self, remote: Hlc) -> Self {
        let physical = wall_clock_ms().max(self.physical).max(remote.physical);
        let logical = if physical == self.physical && physical == remote.physical {
            self.logical.max(remote.logical).saturating_add(1)
        } else if physical == self.physical {
            self.logical.saturating_add(1)
        } else if physical == remote.physical {
            remote.logical.saturating_add(1)
        } else {
            0
        };
        Self::new(physical, logical)
    }

    /// Supremum of every stamp whose physical component is `ms`.
    ///
    /// `compare(h, ceiling(ms)) <= 0` holds for all `h` with `h.physical == ms`.
    pub fn ceiling(ms: u64) -> Self {
        Self::new(ms, MAX_LOGICAL)
    }
}

impl std::fmt::Display for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.physical, self.logical)
    }
}

/// Process-shared clock cell.
///
/// Every mutation applies a pure function to the current value under the lock
/// and returns the new stamp, so concurrent tickers each observe a distinct,
/// strictly increasing sequence.
#[derive(Debug)]
pub struct SharedHlc {
    cell: Mutex<Hlc>,
}

impl SharedHlc {
    /// Creates a shared clock seeded with [`Hlc::now`].
    pub fn new() -> Self {
        Self {
            cell: Mutex::new(Hlc::now()),
        }
    }

    /// Creates a shared clock seeded with an explicit stamp.
    pub fn starting_at(hlc: Hlc) -> Self {
        Self {
            cell: Mutex::new(hlc),
        }
    }

    /// Advances the clock and returns the new stamp.
    pub fn tick(&self) -> Hlc {
        let mut cell = self.cell.lock();
        *cell = cell.tick();
        *cell
    }

    /// Merges a remote stamp and returns the new local stamp.
    pub fn receive(&self, remote: Hlc) -> Hlc {
        let mut cell = self.cell.lock();
        *cell = cell.receive(remote);
        *cell
    }

    /// Current stamp without advancing.
    pub fn current(&self) -> Hlc {
        *self.cell.lock()
    }
}

impl Default for SharedHlc {
    fn default() -> Self {
        Self::new()
    }
}
