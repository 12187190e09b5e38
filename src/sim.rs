//! In-process simulated host.
//!
//! [`SimHost`] backs the [`ThreadHost`] capability with a registry of
//! simulated threads so the whole protocol runs inside one process: state
//! transitions are explicit, signals are recorded instead of delivered,
//! and parking is a condvar the test (or a real OS thread standing in for
//! a scheduled thread) blocks on. A thread-local context guard answers
//! "which thread/core is this code executing as", standing in for the
//! kernel's current-task and current-cpu notions.
//!
//! Wake-versus-sleep races behave like the real host: a wake of a thread
//! that is not (yet) sleeping is a no-op, and a wake that lands after the
//! sleeper becomes visibly `Sleeping` is never lost (epoch counter). The
//! orchestrator's no-double-assignment contract is what keeps the first
//! case out of the protocol's way, exactly as on the real host.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::host::{HostError, ThreadHost, ThreadState};
use crate::types::{CoreId, SignalNum, Tid};

struct Parker {
    inner: Mutex<ParkState>,
    cv: Condvar,
}

struct ParkState {
    /// Bumped on every wake/resume; sleepers wait for it to move.
    epoch: u64,
    resume_core: CoreId,
}

impl Parker {
    fn new() -> Arc<Parker> {
        Arc::new(Parker {
            inner: Mutex::new(ParkState {
                epoch: 0,
                resume_core: CoreId(0),
            }),
            cv: Condvar::new(),
        })
    }

    fn current_epoch(&self) -> u64 {
        self.inner.lock().unwrap().epoch
    }

    fn release(&self, core: CoreId) {
        let mut state = self.inner.lock().unwrap();
        state.epoch += 1;
        state.resume_core = core;
        self.cv.notify_all();
    }

    fn wait_past(&self, seen: u64) -> CoreId {
        let mut state = self.inner.lock().unwrap();
        while state.epoch == seen {
            state = self.cv.wait(state).unwrap();
        }
        state.resume_core
    }
}

struct SimThread {
    state: ThreadState,
    pinned: Option<CoreId>,
    /// When set, affinity changes fail with [`HostError::Refused`].
    restrict_denied: bool,
    signals: Vec<SignalNum>,
    parker: Arc<Parker>,
}

thread_local! {
    static SIM_CTX: Cell<Option<(Tid, CoreId)>> = const { Cell::new(None) };
}

/// Scoped "currently executing as (tid, core)" context. Restores the
/// previous context on drop so nested scopes behave.
pub struct SimCtx {
    prev: Option<(Tid, CoreId)>,
}

impl Drop for SimCtx {
    fn drop(&mut self) {
        SIM_CTX.with(|c| c.set(self.prev));
    }
}

#[derive(Default)]
pub struct SimHost {
    threads: Mutex<HashMap<Tid, SimThread>>,
}

impl SimHost {
    pub fn new() -> SimHost {
        SimHost::default()
    }

    /// Register a simulated thread, initially sleeping.
    pub fn add_thread(&self, tid: Tid) {
        self.threads.lock().unwrap().insert(
            tid,
            SimThread {
                state: ThreadState::Sleeping,
                pinned: None,
                restrict_denied: false,
                signals: Vec::new(),
                parker: Parker::new(),
            },
        );
    }

    /// Make a thread disappear, as if it exited.
    pub fn remove_thread(&self, tid: Tid) {
        self.threads.lock().unwrap().remove(&tid);
    }

    /// Make further affinity restrictions of `tid` fail, as a host that
    /// rejects the change (exiting task, disallowed cpuset) would.
    pub fn deny_restrict(&self, tid: Tid) {
        if let Some(t) = self.threads.lock().unwrap().get_mut(&tid) {
            t.restrict_denied = true;
        }
    }

    /// Force a state, e.g. to stage a double-assignment scenario.
    pub fn set_state(&self, tid: Tid, state: ThreadState) {
        if let Some(t) = self.threads.lock().unwrap().get_mut(&tid) {
            t.state = state;
        }
    }

    /// Signals recorded against a thread, in delivery order.
    pub fn signals_for(&self, tid: Tid) -> Vec<SignalNum> {
        self.threads
            .lock()
            .unwrap()
            .get(&tid)
            .map(|t| t.signals.clone())
            .unwrap_or_default()
    }

    /// Core the thread was last restricted to.
    pub fn pinned_core(&self, tid: Tid) -> Option<CoreId> {
        self.threads.lock().unwrap().get(&tid).and_then(|t| t.pinned)
    }

    /// Externally resume a parked thread onto `core` (a context switch
    /// completing, in host terms).
    pub fn resume(&self, tid: Tid, core: CoreId) {
        let parker = {
            let mut threads = self.threads.lock().unwrap();
            match threads.get_mut(&tid) {
                Some(t) => {
                    t.state = ThreadState::Running;
                    t.parker.clone()
                }
                None => return,
            }
        };
        parker.release(core);
    }

    /// Enter "(tid, core) is executing here" context for the current OS
    /// thread.
    pub fn enter(&self, tid: Tid, core: CoreId) -> SimCtx {
        let prev = SIM_CTX.with(|c| c.replace(Some((tid, core))));
        SimCtx { prev }
    }
}

impl ThreadHost for SimHost {
    fn lookup(&self, tid: Tid) -> Option<ThreadState> {
        self.threads.lock().unwrap().get(&tid).map(|t| t.state)
    }

    fn restrict_to_core(&self, tid: Tid, core: CoreId) -> Result<(), HostError> {
        match self.threads.lock().unwrap().get_mut(&tid) {
            Some(t) if t.restrict_denied => Err(HostError::Refused),
            Some(t) => {
                t.pinned = Some(core);
                Ok(())
            }
            None => Err(HostError::Vanished),
        }
    }

    fn wake(&self, tid: Tid) -> Result<(), HostError> {
        let (parker, core) = {
            let mut threads = self.threads.lock().unwrap();
            match threads.get_mut(&tid) {
                Some(t) => {
                    t.state = ThreadState::Running;
                    (t.parker.clone(), t.pinned.unwrap_or(CoreId(0)))
                }
                None => return Err(HostError::Vanished),
            }
        };
        parker.release(core);
        Ok(())
    }

    fn deliver_signal(&self, tid: Tid, signum: SignalNum) -> Result<(), HostError> {
        match self.threads.lock().unwrap().get_mut(&tid) {
            Some(t) => {
                t.signals.push(signum);
                Ok(())
            }
            None => Err(HostError::Vanished),
        }
    }

    fn current(&self) -> Tid {
        SIM_CTX.with(|c| c.get()).map(|(tid, _)| tid).unwrap_or(Tid::NONE)
    }

    fn current_core(&self) -> CoreId {
        SIM_CTX
            .with(|c| c.get())
            .map(|(_, core)| core)
            .unwrap_or(CoreId(0))
    }

    fn block_current(&self) -> CoreId {
        let me = self.current();
        let parker = {
            let threads = self.threads.lock().unwrap();
            match threads.get(&me) {
                Some(t) => t.parker.clone(),
                // Not a registered thread; nothing can resume it, so
                // refuse to sleep and report the context core.
                None => return self.current_core(),
            }
        };

        let seen = parker.current_epoch();
        if let Some(t) = self.threads.lock().unwrap().get_mut(&me) {
            t.state = ThreadState::Sleeping;
        }
        let core = parker.wait_past(seen);
        if let Some(t) = self.threads.lock().unwrap().get_mut(&me) {
            t.state = ThreadState::Running;
        }
        core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_and_lookup() {
        let host = SimHost::new();
        assert_eq!(host.lookup(Tid(1)), None);
        host.add_thread(Tid(1));
        assert_eq!(host.lookup(Tid(1)), Some(ThreadState::Sleeping));
        host.remove_thread(Tid(1));
        assert_eq!(host.lookup(Tid(1)), None);
    }

    #[test]
    fn test_denied_restriction_is_refused() {
        let host = SimHost::new();
        host.add_thread(Tid(4));
        host.deny_restrict(Tid(4));
        assert_eq!(
            host.restrict_to_core(Tid(4), CoreId(1)),
            Err(HostError::Refused)
        );
        assert_eq!(host.pinned_core(Tid(4)), None);
    }

    #[test]
    fn test_wake_records_pin_and_runs() {
        let host = SimHost::new();
        host.add_thread(Tid(2));
        host.restrict_to_core(Tid(2), CoreId(3)).unwrap();
        host.wake(Tid(2)).unwrap();
        assert_eq!(host.lookup(Tid(2)), Some(ThreadState::Running));
        assert_eq!(host.pinned_core(Tid(2)), Some(CoreId(3)));
    }

    #[test]
    fn test_block_and_external_resume() {
        let host = Arc::new(SimHost::new());
        host.add_thread(Tid(5));

        let h = host.clone();
        let blocker = std::thread::spawn(move || {
            let _ctx = h.enter(Tid(5), CoreId(0));
            h.block_current()
        });

        // Give the blocker a moment to commit to sleeping, then resume it.
        std::thread::sleep(std::time::Duration::from_millis(10));
        host.resume(Tid(5), CoreId(2));
        assert_eq!(blocker.join().unwrap(), CoreId(2));
    }

    #[test]
    fn test_wake_of_running_thread_does_not_satisfy_later_block() {
        let host = Arc::new(SimHost::new());
        host.add_thread(Tid(5));

        // Wake while the thread is not sleeping: a no-op, as on the host.
        host.wake(Tid(5)).unwrap();

        let h = host.clone();
        let blocker = std::thread::spawn(move || {
            let _ctx = h.enter(Tid(5), CoreId(0));
            h.block_current()
        });

        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(
            host.lookup(Tid(5)),
            Some(ThreadState::Sleeping),
            "the stale wake must not have satisfied the block"
        );
        host.resume(Tid(5), CoreId(2));
        assert_eq!(blocker.join().unwrap(), CoreId(2));
    }

    #[test]
    fn test_context_guard_nests() {
        let host = SimHost::new();
        let _outer = host.enter(Tid(1), CoreId(0));
        assert_eq!(host.current(), Tid(1));
        {
            let _inner = host.enter(Tid(2), CoreId(1));
            assert_eq!(host.current(), Tid(2));
            assert_eq!(host.current_core(), CoreId(1));
        }
        assert_eq!(host.current(), Tid(1));
        assert_eq!(host.current_core(), CoreId(0));
    }

    #[test]
    fn test_signals_recorded_in_order() {
        let host = SimHost::new();
        host.add_thread(Tid(9));
        host.deliver_signal(Tid(9), SignalNum(10)).unwrap();
        host.deliver_signal(Tid(9), SignalNum(12)).unwrap();
        assert_eq!(host.signals_for(Tid(9)), vec![SignalNum(10), SignalNum(12)]);
        assert!(host.deliver_signal(Tid(8), SignalNum(1)).is_err());
    }
}
