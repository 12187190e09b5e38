//! Privileged control surface.
//!
//! The device-like boundary callers go through: validates the operation
//! and the caller's capability before anything touches protocol state.
//! Three operations exist (begin-wait, park, request-interrupt), matching
//! the external interface contract; only request-interrupt is privileged.

use std::fmt;
use std::sync::Arc;

use crate::agent::{Agents, ParkOutcome};
use crate::dispatch::CrossCall;
use crate::mask::CoreMask;
use crate::types::{SignalNum, Tid};

/// Highest signal number the surface accepts. Mirrors the host's real
/// signal range; anything outside is an input error, not a host error.
const MAX_SIGNAL: i32 = 64;

/// Identity and capability of a calling context.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub tid: Tid,
    /// Administrative capability, required for privileged operations.
    pub admin: bool,
}

impl Caller {
    pub fn admin(tid: Tid) -> Caller {
        Caller { tid, admin: true }
    }

    pub fn unprivileged(tid: Tid) -> Caller {
        Caller { tid, admin: false }
    }
}

#[derive(Debug)]
pub enum CtlRequest<'a> {
    /// Block until the host resumes the caller (simple entry point for a
    /// freshly-assigned thread).
    BeginWait,
    /// Full voluntary park protocol.
    Park,
    /// Deliver `signum` to the threads currently owning the cores in
    /// `mask_bytes` (little-endian bitmask, any length).
    Interrupt {
        mask_bytes: &'a [u8],
        signum: SignalNum,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum CtlResponse {
    /// begin-wait returned after resume.
    Waited,
    /// park completed.
    Parked(ParkOutcome),
    /// request-interrupt was dispatched to this many cores.
    Interrupted { targeted: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlError {
    /// Malformed operation or argument; nothing was mutated.
    InvalidRequest(&'static str),
    /// Caller lacks the administrative capability; nothing was mutated.
    PermissionDenied,
}

impl fmt::Display for CtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtlError::InvalidRequest(what) => write!(f, "invalid request: {what}"),
            CtlError::PermissionDenied => write!(f, "permission denied"),
        }
    }
}

impl std::error::Error for CtlError {}

pub struct CtlSurface {
    agents: Arc<Agents>,
    cross: Arc<dyn CrossCall>,
}

impl CtlSurface {
    pub fn new(agents: Arc<Agents>, cross: Arc<dyn CrossCall>) -> CtlSurface {
        CtlSurface { agents, cross }
    }

    pub fn handle(&self, caller: &Caller, req: CtlRequest<'_>) -> Result<CtlResponse, CtlError> {
        match req {
            CtlRequest::BeginWait => {
                self.agents.begin_wait();
                Ok(CtlResponse::Waited)
            }
            CtlRequest::Park => Ok(CtlResponse::Parked(self.agents.park())),
            CtlRequest::Interrupt { mask_bytes, signum } => {
                self.request_interrupt(caller, mask_bytes, signum)
            }
        }
    }

    /// Validate and dispatch a request-interrupt. Capability first, then
    /// inputs, then side effects.
    fn request_interrupt(
        &self,
        caller: &Caller,
        mask_bytes: &[u8],
        signum: SignalNum,
    ) -> Result<CtlResponse, CtlError> {
        if !caller.admin {
            return Err(CtlError::PermissionDenied);
        }
        if signum.0 <= 0 || signum.0 > MAX_SIGNAL {
            return Err(CtlError::InvalidRequest("signal number out of range"));
        }

        let nr = self.agents.nr_cores();
        let mask = CoreMask::from_user_bytes(mask_bytes, nr);

        // Pin the request to each target's current assignment generation:
        // an agent that has not acted on that generation yet will see the
        // mismatch and drop the request instead of hitting the wrong
        // thread.
        let region = self.agents.region();
        for core in mask.iter() {
            let blk = region.block(core);
            blk.post_signal(blk.gen_acquire(), signum);
        }

        self.cross.call_cores(&mask);
        Ok(CtlResponse::Interrupted {
            targeted: mask.weight(),
        })
    }
}
