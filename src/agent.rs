//! Per-core agents — the kernel-resident half of the handoff protocol.
//!
//! One agent per core. Each agent owns a private [`AgentSlot`] recording
//! what it believes is true (last generation acted on, the thread it handed
//! the core to, a busy mirror) and reacts to the orchestrator's writes in
//! the shared [`CoreBlock`](crate::shm::CoreBlock):
//!
//! - [`Agents::enter_idle`]: the idle-loop takeover. Waits on the
//!   generation word and converts a new assignment into a thread wakeup.
//! - [`Agents::park`]: voluntary relinquish with a stay-scheduled fast
//!   path when the newest assignment names the caller itself.
//! - [`Agents::service_interrupt`]: the broadcast callback that delivers a
//!   requested signal to the core's current thread, unless the request has
//!   been superseded by a newer assignment.
//!
//! Slot access is confined to code executing in that core's context; the
//! slot array never escapes this module. The fields are atomics only so
//! the in-process simulation has defined behavior — the protocol itself
//! takes no locks.
//!
//! Expected races (vanished thread, superseded signal request) degrade to
//! "treat as idle" and are logged at debug level. The one loud log is a
//! double assignment of an already-active thread, which indicates a broken
//! orchestrator invariant rather than a race.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::host::{ThreadHost, ThreadState};
use crate::shm::ControlRegion;
use crate::types::{CoreId, Tid, WaitHint};
use crate::wait::WaitStrategy;

/// Kernel-private per-core record. Padded to its own cache line.
#[repr(align(64))]
struct AgentSlot {
    /// Generation this agent has already processed.
    last_gen: AtomicU32,
    /// Thread this agent believes it handed the core to. May be stale if
    /// that thread has since died or moved.
    tid: AtomicI32,
    /// Private busy mirror; decides whether a pending signal request is
    /// even relevant.
    busy: AtomicBool,
}

impl AgentSlot {
    fn new() -> AgentSlot {
        AgentSlot {
            last_gen: AtomicU32::new(0),
            tid: AtomicI32::new(0),
            busy: AtomicBool::new(false),
        }
    }

    fn last_gen(&self) -> u32 {
        self.last_gen.load(Ordering::Relaxed)
    }

    fn set_last_gen(&self, gen: u32) {
        self.last_gen.store(gen, Ordering::Relaxed);
    }

    fn tid(&self) -> Tid {
        Tid(self.tid.load(Ordering::Relaxed))
    }

    fn set_tid(&self, tid: Tid) {
        self.tid.store(tid.0, Ordering::Relaxed);
    }

    fn busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Relaxed);
    }
}

/// What a pass through the idle takeover did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// A previous handoff is still settling; nothing was touched.
    Settling,
    /// The generation did not change (budget expiry or spurious wake).
    Idle,
    /// A new assignment was armed and its thread woken.
    Handoff(Tid),
    /// A new generation arrived but left the core idle (no-thread
    /// sentinel, or the wakeup failed and the assignment degraded).
    Empty,
}

/// Result of a voluntary park.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkOutcome {
    /// The newest assignment names the caller; it stays scheduled and
    /// never slept.
    Stayed,
    /// The caller slept and was resumed on the given core.
    Resumed(CoreId),
}

/// All per-core agents plus their shared collaborators.
pub struct Agents {
    shm: Arc<ControlRegion>,
    host: Arc<dyn ThreadHost>,
    wait: Arc<dyn WaitStrategy>,
    slots: Box<[AgentSlot]>,
    /// Assignments silently degraded to idle because the wakeup failed.
    /// Diagnostic only; the orchestrator's signal is the advisory busy
    /// flag staying clear.
    dropped: AtomicU64,
}

impl Agents {
    pub fn new(
        shm: Arc<ControlRegion>,
        host: Arc<dyn ThreadHost>,
        wait: Arc<dyn WaitStrategy>,
    ) -> Agents {
        let slots: Box<[AgentSlot]> = (0..shm.nr_cores()).map(|_| AgentSlot::new()).collect();
        Agents {
            shm,
            host,
            wait,
            slots,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn nr_cores(&self) -> usize {
        self.slots.len()
    }

    pub fn host(&self) -> &Arc<dyn ThreadHost> {
        &self.host
    }

    pub fn wait(&self) -> &Arc<dyn WaitStrategy> {
        &self.wait
    }

    pub fn region(&self) -> &Arc<ControlRegion> {
        &self.shm
    }

    /// Count of assignments that degraded to idle on wakeup failure.
    pub fn dropped_assignments(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn slot(&self, core: CoreId) -> &AgentSlot {
        &self.slots[core.index()]
    }

    /// One pass of the idle-loop takeover for `core`.
    ///
    /// Runs in the core's idle context. Blocks on the generation word via
    /// the wait strategy; returns after at most one generation worth of
    /// work so the caller can service doorbells between passes.
    pub fn enter_idle(&self, core: CoreId) -> IdleOutcome {
        let slot = self.slot(core);
        let blk = self.shm.block(core);

        // Entered the idle loop while a previous handoff is still
        // settling: the woken thread has not started (or parked) yet.
        // Hold off on any bookkeeping until the next generation.
        let believed = slot.tid();
        if believed.is_some() && self.host.lookup(believed).is_some() {
            let seen = blk.gen_acquire();
            self.wait
                .wait_for_change(blk.gen_word(), seen, WaitHint::SHALLOW);
            return IdleOutcome::Settling;
        }

        // Mark the core idle; clear the stale advisory flag only if no
        // newer request has been published meanwhile.
        slot.set_busy(false);
        if blk.busy() && blk.gen_acquire() == slot.last_gen() {
            blk.set_busy(false);
        }

        // Low-power wait for the next request.
        let hint = blk.wait_hint();
        let gen = self
            .wait
            .wait_for_change(blk.gen_word(), slot.last_gen(), hint);
        if gen == slot.last_gen() {
            return IdleOutcome::Idle;
        }

        let mut tid = blk.tid();
        slot.set_last_gen(gen);
        if tid.is_some() && !self.wake_thread_on(core, tid) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tid = Tid::NONE;
        }
        slot.set_tid(tid);
        blk.set_busy(tid.is_some());
        slot.set_busy(tid.is_some());
        blk.ack_release(gen);

        if tid.is_some() {
            IdleOutcome::Handoff(tid)
        } else {
            IdleOutcome::Empty
        }
    }

    /// Voluntarily give the calling thread's core back.
    ///
    /// If the newest assignment names the caller itself, returns
    /// [`ParkOutcome::Stayed`] without sleeping. Otherwise arms whatever
    /// the assignment names (possibly nothing) and sleeps the caller,
    /// returning the core it resumes on.
    pub fn park(&self) -> ParkOutcome {
        let core = self.host.current_core();
        let slot = self.slot(core);
        let blk = self.shm.block(core);

        slot.set_busy(false);

        let gen = blk.gen_acquire();
        if gen == slot.last_gen() {
            // No decision since the one we handled; the core goes idle.
            blk.set_busy(false);
            slot.set_tid(Tid::NONE);
            return ParkOutcome::Resumed(self.host.block_current());
        }

        let tid = blk.tid();
        slot.set_last_gen(gen);

        // Stay-scheduled fast path: the orchestrator re-picked the caller.
        if tid == self.host.current() {
            blk.set_busy(true);
            slot.set_busy(true);
            blk.ack_release(gen);
            return ParkOutcome::Stayed;
        }

        // The decision names someone else (or nobody). Arm it, then give
        // up the core regardless.
        let mut tid = tid;
        if tid.is_some() && !self.wake_thread_on(core, tid) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tid = Tid::NONE;
        }
        slot.set_tid(tid);
        blk.set_busy(tid.is_some());
        slot.set_busy(tid.is_some());
        blk.ack_release(gen);

        ParkOutcome::Resumed(self.host.block_current())
    }

    /// Block the calling thread until the host resumes it.
    ///
    /// Used by a freshly-assigned thread to yield the CPU until the actual
    /// switch machinery runs; nothing in the protocol state changes.
    pub fn begin_wait(&self) {
        self.host.block_current();
    }

    /// Broadcast callback: deliver the requested signal to whichever
    /// thread currently owns `core`. Runs in the core's context.
    ///
    /// Returns `true` only if a signal was actually delivered. Skips are
    /// silent: an idle core, a vanished thread, and a request superseded
    /// by a newer assignment are all expected races.
    pub fn service_interrupt(&self, core: CoreId) -> bool {
        let slot = self.slot(core);
        let blk = self.shm.block(core);

        if !slot.busy() {
            return false;
        }

        let tid = slot.tid();
        if self.host.lookup(tid).is_none() {
            debug!("{core}: interrupt target {tid} no longer exists");
            return false;
        }

        let sig = blk.sig_acquire();
        if sig != slot.last_gen() {
            debug!(
                "{core}: dropping signal request for gen {sig} (acted on {})",
                slot.last_gen()
            );
            return false;
        }

        match self.host.deliver_signal(tid, blk.signum()) {
            Ok(()) => true,
            Err(e) => {
                debug!("{core}: signal delivery to {tid} failed: {e}");
                false
            }
        }
    }

    /// Restrict `tid` to `core` and wake it (the shared assignment
    /// helper). `false` means the caller must treat the assignment as the
    /// no-thread sentinel.
    fn wake_thread_on(&self, core: CoreId, tid: Tid) -> bool {
        match self.host.lookup(tid) {
            None => {
                debug!("{core}: assigned {tid} vanished before wakeup");
                false
            }
            Some(ThreadState::Running) | Some(ThreadState::Waking) => {
                // The orchestrator must never hand out a thread that is
                // already active; this is a contract violation on its
                // side, not a race we can absorb quietly.
                warn!("{core}: refusing to wake {tid}: already running or waking");
                false
            }
            Some(ThreadState::Sleeping) => {
                if let Err(e) = self.host.restrict_to_core(tid, core) {
                    debug!("{core}: restricting {tid} failed: {e}");
                    return false;
                }
                if let Err(e) = self.host.wake(tid) {
                    debug!("{core}: waking {tid} failed: {e}");
                    return false;
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostError;
    use crate::types::SignalNum;
    use crate::wait::SpinWait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted host: a thread table plus recorded side effects.
    struct TestHost {
        threads: Mutex<HashMap<Tid, ThreadState>>,
        wakes: Mutex<Vec<(Tid, CoreId)>>,
        signals: Mutex<Vec<(Tid, SignalNum)>>,
        blocks: Mutex<u32>,
        current: Tid,
        on_core: CoreId,
        resume_core: CoreId,
    }

    impl TestHost {
        fn new(current: Tid, on_core: CoreId) -> TestHost {
            TestHost {
                threads: Mutex::new(HashMap::new()),
                wakes: Mutex::new(Vec::new()),
                signals: Mutex::new(Vec::new()),
                blocks: Mutex::new(0),
                current,
                on_core,
                resume_core: on_core,
            }
        }

        fn add(&self, tid: Tid, state: ThreadState) {
            self.threads.lock().unwrap().insert(tid, state);
        }

        fn wakes(&self) -> Vec<(Tid, CoreId)> {
            self.wakes.lock().unwrap().clone()
        }

        fn signals(&self) -> Vec<(Tid, SignalNum)> {
            self.signals.lock().unwrap().clone()
        }

        fn block_count(&self) -> u32 {
            *self.blocks.lock().unwrap()
        }
    }

    impl ThreadHost for TestHost {
        fn lookup(&self, tid: Tid) -> Option<ThreadState> {
            self.threads.lock().unwrap().get(&tid).copied()
        }

        fn restrict_to_core(&self, tid: Tid, core: CoreId) -> Result<(), HostError> {
            self.wakes.lock().unwrap().push((tid, core));
            Ok(())
        }

        fn wake(&self, tid: Tid) -> Result<(), HostError> {
            self.threads
                .lock()
                .unwrap()
                .insert(tid, ThreadState::Running);
            Ok(())
        }

        fn deliver_signal(&self, tid: Tid, signum: SignalNum) -> Result<(), HostError> {
            self.signals.lock().unwrap().push((tid, signum));
            Ok(())
        }

        fn current(&self) -> Tid {
            self.current
        }

        fn current_core(&self) -> CoreId {
            self.on_core
        }

        fn block_current(&self) -> CoreId {
            *self.blocks.lock().unwrap() += 1;
            self.resume_core
        }
    }

    fn setup(host: Arc<TestHost>) -> (Agents, Arc<ControlRegion>) {
        let region = Arc::new(ControlRegion::new(4).unwrap());
        let agents = Agents::new(region.clone(), host, Arc::new(SpinWait::new(4)));
        (agents, region)
    }

    const CORE: CoreId = CoreId(0);

    #[test]
    fn test_handoff_wakes_assigned_thread() {
        let host = Arc::new(TestHost::new(Tid(99), CORE));
        host.add(Tid(7), ThreadState::Sleeping);
        let (agents, region) = setup(host.clone());

        let gen = region.block(CORE).publish(Tid(7), WaitHint::SHALLOW);
        assert_eq!(agents.enter_idle(CORE), IdleOutcome::Handoff(Tid(7)));
        assert_eq!(host.wakes(), vec![(Tid(7), CORE)]);
        assert!(region.block(CORE).busy());
        assert_eq!(region.block(CORE).last_gen(), gen);
    }

    #[test]
    fn test_unchanged_generation_is_noop() {
        let host = Arc::new(TestHost::new(Tid(99), CORE));
        let (agents, region) = setup(host.clone());

        // Sentinel assignment, acted on once.
        region.block(CORE).publish(Tid::NONE, WaitHint::SHALLOW);
        assert_eq!(agents.enter_idle(CORE), IdleOutcome::Empty);

        // Re-observing the same generation does nothing.
        assert_eq!(agents.enter_idle(CORE), IdleOutcome::Idle);
        assert_eq!(agents.enter_idle(CORE), IdleOutcome::Idle);
        assert!(host.wakes().is_empty());
    }

    #[test]
    fn test_settling_guard_blocks_until_next_generation() {
        let host = Arc::new(TestHost::new(Tid(99), CORE));
        host.add(Tid(7), ThreadState::Sleeping);
        let (agents, region) = setup(host.clone());

        region.block(CORE).publish(Tid(7), WaitHint::SHALLOW);
        assert_eq!(agents.enter_idle(CORE), IdleOutcome::Handoff(Tid(7)));

        // Thread 7 is now alive; re-entering the idle loop must not
        // disturb the outstanding handoff.
        assert_eq!(agents.enter_idle(CORE), IdleOutcome::Settling);
        assert!(region.block(CORE).busy(), "busy must survive the guard");
    }

    #[test]
    fn test_vanished_thread_degrades_to_idle() {
        let host = Arc::new(TestHost::new(Tid(99), CORE));
        let (agents, region) = setup(host.clone());

        region.block(CORE).publish(Tid(1234), WaitHint::SHALLOW);
        assert_eq!(agents.enter_idle(CORE), IdleOutcome::Empty);
        assert!(!region.block(CORE).busy());
        assert!(host.wakes().is_empty());
        assert_eq!(agents.dropped_assignments(), 1);
    }

    #[test]
    fn test_double_assignment_rejected() {
        let host = Arc::new(TestHost::new(Tid(99), CORE));
        host.add(Tid(7), ThreadState::Running);
        let (agents, region) = setup(host.clone());

        region.block(CORE).publish(Tid(7), WaitHint::SHALLOW);
        assert_eq!(agents.enter_idle(CORE), IdleOutcome::Empty);
        assert!(host.wakes().is_empty(), "an active thread must not be re-woken");
        assert!(!region.block(CORE).busy());
    }

    #[test]
    fn test_stale_busy_flag_cleared() {
        let host = Arc::new(TestHost::new(Tid(99), CORE));
        let (agents, region) = setup(host);

        region.block(CORE).set_busy(true);
        assert_eq!(agents.enter_idle(CORE), IdleOutcome::Idle);
        assert!(!region.block(CORE).busy());
    }

    #[test]
    fn test_park_fast_path_does_not_sleep() {
        let me = Tid(42);
        let host = Arc::new(TestHost::new(me, CORE));
        host.add(me, ThreadState::Running);
        let (agents, region) = setup(host.clone());

        let gen = region.block(CORE).publish(me, WaitHint::SHALLOW);
        assert_eq!(agents.park(), ParkOutcome::Stayed);
        assert_eq!(host.block_count(), 0, "fast path must not sleep");
        assert!(region.block(CORE).busy());
        assert_eq!(region.block(CORE).last_gen(), gen);
    }

    #[test]
    fn test_park_with_no_new_decision_sleeps() {
        let me = Tid(42);
        let host = Arc::new(TestHost::new(me, CORE));
        let (agents, region) = setup(host.clone());

        assert_eq!(agents.park(), ParkOutcome::Resumed(CORE));
        assert_eq!(host.block_count(), 1);
        assert!(!region.block(CORE).busy());
    }

    #[test]
    fn test_park_arms_successor_then_sleeps() {
        let me = Tid(42);
        let host = Arc::new(TestHost::new(me, CORE));
        host.add(Tid(7), ThreadState::Sleeping);
        let (agents, region) = setup(host.clone());

        region.block(CORE).publish(Tid(7), WaitHint::SHALLOW);
        assert_eq!(agents.park(), ParkOutcome::Resumed(CORE));
        assert_eq!(host.wakes(), vec![(Tid(7), CORE)]);
        assert_eq!(host.block_count(), 1, "caller must still give up the core");
        assert!(region.block(CORE).busy());
    }

    #[test]
    fn test_interrupt_on_idle_core_is_noop() {
        let host = Arc::new(TestHost::new(Tid(99), CORE));
        let (agents, _region) = setup(host.clone());

        assert!(!agents.service_interrupt(CORE));
        assert!(host.signals().is_empty());
    }

    #[test]
    fn test_interrupt_delivers_when_generations_match() {
        let host = Arc::new(TestHost::new(Tid(99), CORE));
        host.add(Tid(7), ThreadState::Sleeping);
        let (agents, region) = setup(host.clone());

        let gen = region.block(CORE).publish(Tid(7), WaitHint::SHALLOW);
        agents.enter_idle(CORE);

        region.block(CORE).post_signal(gen, SignalNum(10));
        assert!(agents.service_interrupt(CORE));
        assert_eq!(host.signals(), vec![(Tid(7), SignalNum(10))]);
    }

    #[test]
    fn test_interrupt_dropped_on_generation_mismatch() {
        let host = Arc::new(TestHost::new(Tid(99), CORE));
        host.add(Tid(7), ThreadState::Sleeping);
        let (agents, region) = setup(host.clone());

        let gen = region.block(CORE).publish(Tid(7), WaitHint::SHALLOW);
        agents.enter_idle(CORE);

        // Request targets a generation the agent has not acted on.
        region.block(CORE).post_signal(gen.wrapping_add(1), SignalNum(10));
        assert!(!agents.service_interrupt(CORE));
        assert!(host.signals().is_empty());
    }

    #[test]
    fn test_interrupt_skips_vanished_thread() {
        let host = Arc::new(TestHost::new(Tid(99), CORE));
        host.add(Tid(7), ThreadState::Sleeping);
        let (agents, region) = setup(host.clone());

        let gen = region.block(CORE).publish(Tid(7), WaitHint::SHALLOW);
        agents.enter_idle(CORE);

        // The thread dies before the interrupt lands.
        host.threads.lock().unwrap().remove(&Tid(7));
        region.block(CORE).post_signal(gen, SignalNum(10));
        assert!(!agents.service_interrupt(CORE));
        assert!(host.signals().is_empty());
    }
}
