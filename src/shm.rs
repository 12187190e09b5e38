//! Shared control blocks — the wire-format contract between the
//! orchestrator and the per-core agents.
//!
//! One [`CoreBlock`] per core, in a single fixed-size region both sides
//! map. The generation counter is the only synchronization point: the
//! orchestrator fully writes the assignment fields, then release-stores a
//! bumped `gen`; an agent acquire-loads `gen` and only then trusts the
//! other fields. Generations are compared by equality only, so counter
//! wraparound is harmless.
//!
//! Field order and width are stable across versions. Layout is pinned by
//! `static_assertions` and offset tests below; changing it breaks every
//! orchestrator built against the old layout.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use static_assertions::const_assert_eq;

use crate::types::{CoreId, SignalNum, Tid, WaitHint};
use crate::wait::WaitStrategy;

/// Per-core shared record. 64 bytes, cache-line aligned so two cores never
/// false-share their blocks.
#[repr(C, align(64))]
pub struct CoreBlock {
    /// Assignment generation. Release-stored by the orchestrator after the
    /// other assignment fields; acquire-loaded by the agent.
    gen: AtomicU32,
    /// Assigned thread id, `0` = no thread.
    tid: AtomicI32,
    /// Advisory busy flag. Best-effort, last-writer-wins, used by the
    /// orchestrator for placement heuristics only.
    busy: AtomicU32,
    /// Idle wait depth hint, consumed by the wait strategy.
    wait_hint: AtomicU32,
    /// Last generation the agent acted on. Advisory telemetry for the
    /// orchestrator, never a synchronization signal.
    last_gen: AtomicU32,
    /// Signal request generation. A request is honored only while this
    /// equals the agent's last-acted generation.
    sig: AtomicU32,
    /// Signal number to deliver when a request is honored.
    signum: AtomicI32,
}

const_assert_eq!(std::mem::size_of::<CoreBlock>(), 64);
const_assert_eq!(std::mem::align_of::<CoreBlock>(), 64);

impl CoreBlock {
    fn zeroed() -> Self {
        CoreBlock {
            gen: AtomicU32::new(0),
            tid: AtomicI32::new(0),
            busy: AtomicU32::new(0),
            wait_hint: AtomicU32::new(0),
            last_gen: AtomicU32::new(0),
            sig: AtomicU32::new(0),
            signum: AtomicI32::new(0),
        }
    }

    // Agent-side accessors.

    pub fn gen_acquire(&self) -> u32 {
        self.gen.load(Ordering::Acquire)
    }

    /// The generation word itself, for wait-on-address blocking.
    pub fn gen_word(&self) -> &AtomicU32 {
        &self.gen
    }

    pub fn tid(&self) -> Tid {
        Tid(self.tid.load(Ordering::Relaxed))
    }

    pub fn busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed) != 0
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy as u32, Ordering::Relaxed);
    }

    pub fn wait_hint(&self) -> WaitHint {
        WaitHint(self.wait_hint.load(Ordering::Relaxed))
    }

    /// Publish the agent's acknowledgment of `gen`.
    pub fn ack_release(&self, gen: u32) {
        self.last_gen.store(gen, Ordering::Release);
    }

    pub fn last_gen(&self) -> u32 {
        self.last_gen.load(Ordering::Acquire)
    }

    pub fn sig_acquire(&self) -> u32 {
        self.sig.load(Ordering::Acquire)
    }

    pub fn signum(&self) -> SignalNum {
        SignalNum(self.signum.load(Ordering::Relaxed))
    }

    // Orchestrator-side writers.

    /// Publish a new assignment: store the fields, then release the bumped
    /// generation. Returns the published generation.
    pub fn publish(&self, tid: Tid, hint: WaitHint) -> u32 {
        let next = self.gen.load(Ordering::Relaxed).wrapping_add(1);
        self.tid.store(tid.0, Ordering::Relaxed);
        self.wait_hint.store(hint.0, Ordering::Relaxed);
        self.busy.store(tid.is_some() as u32, Ordering::Relaxed);
        self.gen.store(next, Ordering::Release);
        next
    }

    /// Request a signal against the assignment published as `gen`: store
    /// the signal number, then release the request generation.
    pub fn post_signal(&self, gen: u32, signum: SignalNum) {
        self.signum.store(signum.0, Ordering::Relaxed);
        self.sig.store(gen, Ordering::Release);
    }
}

/// The mappable array of per-core control blocks.
///
/// Allocated zeroed once at node start, torn down at node stop. Entries are
/// only ever mutated in place; the region itself never grows or shrinks.
pub struct ControlRegion {
    blocks: Box<[CoreBlock]>,
}

impl ControlRegion {
    pub fn new(nr_cores: usize) -> Result<ControlRegion> {
        if nr_cores == 0 {
            bail!("control region needs at least one core");
        }
        let blocks: Box<[CoreBlock]> = (0..nr_cores).map(|_| CoreBlock::zeroed()).collect();
        Ok(ControlRegion { blocks })
    }

    pub fn nr_cores(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, core: CoreId) -> &CoreBlock {
        &self.blocks[core.index()]
    }
}

impl std::fmt::Debug for ControlRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRegion")
            .field("nr_cores", &self.nr_cores())
            .finish_non_exhaustive()
    }
}

/// Writer-side handle the orchestrator drives assignments through.
///
/// Owns the publish discipline (fields before generation) and wakes the
/// target core's waiter after each publish, since a futex-style wait
/// strategy cannot observe a plain store.
pub struct Orchestrator {
    region: Arc<ControlRegion>,
    wait: Arc<dyn WaitStrategy>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(region: Arc<ControlRegion>, wait: Arc<dyn WaitStrategy>) -> Orchestrator {
        Orchestrator { region, wait }
    }

    /// Assign `tid` to run on `core`. Returns the published generation.
    pub fn assign(&self, core: CoreId, tid: Tid, hint: WaitHint) -> u32 {
        let blk = self.region.block(core);
        let gen = blk.publish(tid, hint);
        self.wait.notify(blk.gen_word());
        gen
    }

    /// Publish the no-thread sentinel, leaving `core` idle.
    pub fn assign_idle(&self, core: CoreId) -> u32 {
        self.assign(core, Tid::NONE, WaitHint::SHALLOW)
    }

    /// Advisory view of whether `core` currently has an assigned thread.
    pub fn core_busy(&self, core: CoreId) -> bool {
        self.region.block(core).busy()
    }

    /// Advisory view of the last generation `core`'s agent acted on.
    pub fn core_acked(&self, core: CoreId) -> u32 {
        self.region.block(core).last_gen()
    }
}
