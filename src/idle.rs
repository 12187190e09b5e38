//! Idle-policy takeover.
//!
//! The host normally has its own "enter low-power idle" action per core.
//! The takeover replaces it with one that drives the handoff protocol, and
//! must be able to put the original back at teardown. [`IdleSlot`] is that
//! installation point: it holds the active policy, saves the displaced one
//! on install, and restores it on request.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use crate::agent::{Agents, IdleOutcome};
use crate::types::CoreId;

/// What a core does when it has nothing to run.
pub trait IdlePolicy: Send + Sync {
    fn enter_idle(&self, core: CoreId) -> IdleOutcome;
}

/// Baseline policy standing in for the host's own idle action: give the
/// OS scheduler a chance and report nothing happened.
pub struct YieldIdle;

impl IdlePolicy for YieldIdle {
    fn enter_idle(&self, _core: CoreId) -> IdleOutcome {
        std::thread::yield_now();
        IdleOutcome::Idle
    }
}

/// The takeover policy: one pass of the agents' idle protocol.
pub struct AgentIdle {
    agents: Arc<Agents>,
}

impl AgentIdle {
    pub fn new(agents: Arc<Agents>) -> AgentIdle {
        AgentIdle { agents }
    }
}

impl IdlePolicy for AgentIdle {
    fn enter_idle(&self, core: CoreId) -> IdleOutcome {
        self.agents.enter_idle(core)
    }
}

/// Holder of the currently-installed idle policy.
///
/// `install` displaces the active policy and keeps it for `restore`;
/// nested installs are refused, so restore always puts back exactly what
/// was displaced.
pub struct IdleSlot {
    inner: Mutex<SlotState>,
}

struct SlotState {
    active: Arc<dyn IdlePolicy>,
    saved: Option<Arc<dyn IdlePolicy>>,
}

impl IdleSlot {
    pub fn new(initial: Arc<dyn IdlePolicy>) -> IdleSlot {
        IdleSlot {
            inner: Mutex::new(SlotState {
                active: initial,
                saved: None,
            }),
        }
    }

    /// Install `policy`, saving the displaced one for [`restore`].
    ///
    /// [`restore`]: IdleSlot::restore
    pub fn install(&self, policy: Arc<dyn IdlePolicy>) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.saved.is_some() {
            bail!("an idle policy is already installed");
        }
        state.saved = Some(std::mem::replace(&mut state.active, policy));
        Ok(())
    }

    /// Put the displaced policy back. No-op if nothing is installed.
    pub fn restore(&self) {
        let mut state = self.inner.lock().unwrap();
        if let Some(prev) = state.saved.take() {
            state.active = prev;
        }
    }

    /// Run one idle pass on `core` under the active policy.
    pub fn enter_idle(&self, core: CoreId) -> IdleOutcome {
        // Clone the handle out so idle passes never hold the slot lock.
        let policy = self.inner.lock().unwrap().active.clone();
        policy.enter_idle(core)
    }
}
