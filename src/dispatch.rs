//! Cross-core call primitive.
//!
//! A signal request must be serviced *on* each targeted core, because only
//! code in a core's execution context may consult that core's private
//! agent state. [`CrossCall`] is the delivery abstraction: "invoke the
//! registered per-core service on every core in this mask". No shared
//! memory beyond the control blocks is assumed.
//!
//! Two implementations:
//! - [`DoorbellCall`]: sets a per-core pending flag and breaks that core's
//!   idle wait, so its own service loop runs the callback. This is the
//!   threaded-node path and mirrors how an IPI interrupts a waiting CPU.
//! - [`InlineCall`]: runs the callback directly on the calling thread.
//!   Only for single-driver tests where the caller stands in for every
//!   core's context.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::agent::Agents;
use crate::mask::CoreMask;
use crate::shm::ControlRegion;
use crate::types::CoreId;
use crate::wait::WaitStrategy;

pub trait CrossCall: Send + Sync {
    /// Deliver the interrupt service to every core in `mask`. Fire and
    /// forget: delivery is asynchronous and a core that never looks (gone
    /// at teardown) simply drops it.
    fn call_cores(&self, mask: &CoreMask);
}

/// One pending-work flag per core.
#[repr(align(64))]
struct Doorbell {
    pending: AtomicU32,
}

/// Per-core doorbells plus the means to break each core's idle wait.
pub struct DoorbellCall {
    bells: Box<[Doorbell]>,
    region: Arc<ControlRegion>,
    wait: Arc<dyn WaitStrategy>,
}

impl DoorbellCall {
    pub fn new(region: Arc<ControlRegion>, wait: Arc<dyn WaitStrategy>) -> DoorbellCall {
        let bells: Box<[Doorbell]> = (0..region.nr_cores())
            .map(|_| Doorbell {
                pending: AtomicU32::new(0),
            })
            .collect();
        DoorbellCall {
            bells,
            region,
            wait,
        }
    }

    /// Ring `core`'s doorbell and wake it out of its idle wait.
    pub fn ring(&self, core: CoreId) {
        self.bells[core.index()].pending.fetch_add(1, Ordering::Release);
        self.wait.notify(self.region.block(core).gen_word());
    }

    /// Consume a pending ring for `core`. Called from the core's own
    /// service loop.
    pub fn take(&self, core: CoreId) -> bool {
        let bell = &self.bells[core.index()];
        if bell.pending.load(Ordering::Acquire) == 0 {
            return false;
        }
        bell.pending.swap(0, Ordering::AcqRel) != 0
    }
}

impl CrossCall for DoorbellCall {
    fn call_cores(&self, mask: &CoreMask) {
        for core in mask.iter() {
            if core.index() < self.bells.len() {
                self.ring(core);
            }
        }
    }
}

/// Run the interrupt service synchronously on the calling thread.
pub struct InlineCall {
    agents: Arc<Agents>,
}

impl InlineCall {
    pub fn new(agents: Arc<Agents>) -> InlineCall {
        InlineCall { agents }
    }
}

impl CrossCall for InlineCall {
    fn call_cores(&self, mask: &CoreMask) {
        for core in mask.iter() {
            self.agents.service_interrupt(core);
        }
    }
}
