//! Host thread-lifecycle capability.
//!
//! The protocol does not create, destroy, or schedule threads itself — it
//! asks the host to. [`ThreadHost`] is the seam: a live deployment backs
//! it with the kernel's task machinery, tests and the demo back it with
//! [`SimHost`](crate::sim::SimHost). All methods are expected races, not
//! bugs: a thread may vanish or change state between any two calls, and
//! callers must degrade accordingly.

use std::fmt;

use crate::types::{CoreId, SignalNum, Tid};

/// Scheduler-visible state of a host thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Blocked, eligible to be woken onto a core.
    Sleeping,
    /// In the transient window between wake-up and first run.
    Waking,
    /// Currently executing on some core.
    Running,
}

/// Errors from host primitives. Absorbed by the agent (never surfaced to
/// the orchestrator), but distinct enough to log usefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// The thread no longer exists.
    Vanished,
    /// The host refused the operation (affinity change, wake, signal).
    Refused,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Vanished => write!(f, "thread vanished"),
            HostError::Refused => write!(f, "host refused the operation"),
        }
    }
}

impl std::error::Error for HostError {}

pub trait ThreadHost: Send + Sync {
    /// Resolve a thread id. `None` if the thread no longer exists.
    fn lookup(&self, tid: Tid) -> Option<ThreadState>;

    /// Restrict the thread's eligible-core set to exactly `core`.
    fn restrict_to_core(&self, tid: Tid, core: CoreId) -> Result<(), HostError>;

    /// Make a sleeping thread runnable.
    fn wake(&self, tid: Tid) -> Result<(), HostError>;

    /// Deliver a process signal to the thread.
    fn deliver_signal(&self, tid: Tid, signum: SignalNum) -> Result<(), HostError>;

    /// Thread id of the calling context.
    fn current(&self) -> Tid;

    /// Core the calling context is executing on.
    fn current_core(&self) -> CoreId;

    /// Put the calling thread into an interruptible sleep and yield the
    /// core back to the host scheduler. Returns the core the thread is
    /// executing on once resumed.
    fn block_current(&self) -> CoreId;
}
