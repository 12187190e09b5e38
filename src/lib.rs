//! corehand - Lock-free core handoff between a user-space scheduler and
//! per-core kernel agents.
//!
//! A privileged orchestrator decides which thread runs on which core; one
//! agent per core executes those decisions using only a shared
//! per-core control block and an acquire/release generation counter. No
//! locks cross cores, handoff latency is bounded by a wait-on-address
//! primitive, and every failure mode an assignment can hit (thread died,
//! moved, already running) degrades to an idle core rather than an error.
//!
//! # Architecture
//!
//! - **Shared control blocks** ([`shm`]): the wire-format contract both
//!   sides map; generation counter as the single synchronization point.
//! - **Agents** ([`agent`]): idle-loop takeover, voluntary park with a
//!   stay-scheduled fast path, and the per-core signal service.
//! - **Wait strategies** ([`wait`]): pluggable wait-on-address (futex or
//!   backoff spin) standing in for monitor/mwait.
//! - **Idle takeover** ([`idle`]): installable idle policy with
//!   save/restore of whatever it displaced.
//! - **Cross-core calls** ([`dispatch`]): doorbell broadcast so signal
//!   requests are serviced on the targeted core, never remotely.
//! - **Control surface** ([`ctl`]): capability checks and input
//!   validation in front of the three operations.
//! - **Node** ([`node`]): bring-up/teardown plumbing and the per-core
//!   service loops.
//! - **Simulated host** ([`sim`]): in-process [`host::ThreadHost`] so the
//!   whole protocol runs and is tested without a kernel.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use corehand::{Caller, Node, SimHost, Tid, WaitHint};
//!
//! let host = Arc::new(SimHost::new());
//! host.add_thread(Tid(100));
//!
//! let node = Node::builder().cores(2).start(host.clone()).unwrap();
//! let admin = Caller::admin(Tid(1));
//! let orch = node.orchestrator(&admin).unwrap();
//!
//! // Hand core 1 to thread 100; its agent wakes the thread.
//! orch.assign(corehand::CoreId(1), Tid(100), WaitHint::SHALLOW);
//! ```

pub mod agent;
pub mod ctl;
pub mod dispatch;
pub mod host;
pub mod idle;
pub mod mask;
pub mod node;
pub mod probe;
pub mod shm;
pub mod sim;
pub mod types;
pub mod wait;

pub use agent::{Agents, IdleOutcome, ParkOutcome};
pub use ctl::{Caller, CtlError, CtlRequest, CtlResponse, CtlSurface};
pub use dispatch::{CrossCall, DoorbellCall, InlineCall};
pub use host::{HostError, ThreadHost, ThreadState};
pub use idle::{AgentIdle, IdlePolicy, IdleSlot, YieldIdle};
pub use mask::CoreMask;
pub use node::{Node, NodeBuilder};
pub use probe::ProbeRegion;
pub use shm::{ControlRegion, CoreBlock, Orchestrator};
pub use sim::SimHost;
pub use types::{CoreId, SignalNum, Tid, WaitHint};
#[cfg(target_os = "linux")]
pub use wait::FutexWait;
pub use wait::{SpinWait, WaitStrategy};
