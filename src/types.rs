//! Newtype wrappers for domain identifiers.
//!
//! Newtypes for core ids, thread ids, and signal numbers prevent silent
//! type confusion between the many small integers this crate shuffles
//! around. Plain quantities (generations, spin budgets) stay `u32` because
//! they are only ever compared for equality or counted down.

use std::fmt;

/// Logical CPU core identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CoreId(pub u32);

impl CoreId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core{}", self.0)
    }
}

/// Thread identifier as the host kernel knows it.
///
/// `Tid::NONE` (zero) is the "no thread" sentinel throughout the shared
/// control block; a published assignment of `NONE` parks the core idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tid(pub i32);

impl Tid {
    pub const NONE: Tid = Tid(0);

    pub fn is_none(self) -> bool {
        self == Tid::NONE
    }

    pub fn is_some(self) -> bool {
        self != Tid::NONE
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Process signal number to deliver on a preemption request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalNum(pub i32);

/// Power-state hint for the idle wait.
///
/// Interpreted by the installed [`WaitStrategy`](crate::wait::WaitStrategy):
/// a mwait-style backend passes it through to the hardware, the portable
/// spin backend derives a spin budget from it. `WaitHint::SHALLOW` (zero)
/// requests the lightest state the backend offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitHint(pub u32);

impl WaitHint {
    pub const SHALLOW: WaitHint = WaitHint(0);
}
