//! Node lifecycle: one-time bring-up, per-core service loops, teardown.
//!
//! A [`Node`] owns everything for the system's lifetime: the shared
//! control region, the agents, the idle-policy takeover, the doorbells,
//! and one service thread per core standing in for that core's idle
//! context. Bring-up acquires resources in dependency order and any
//! failure releases exactly what was already acquired, in reverse.
//! Teardown stops and joins the service threads, restores the displaced
//! idle policy, and drops the region last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::agent::Agents;
use crate::ctl::{Caller, CtlError, CtlSurface};
use crate::dispatch::DoorbellCall;
use crate::host::ThreadHost;
use crate::idle::{AgentIdle, IdleSlot, YieldIdle};
use crate::probe::ProbeRegion;
use crate::shm::{ControlRegion, Orchestrator};
use crate::types::CoreId;
use crate::wait::{SpinWait, WaitStrategy};

const DEFAULT_PROBE_BYTES: usize = 4096;

pub struct NodeBuilder {
    nr_cores: usize,
    wait: Option<Arc<dyn WaitStrategy>>,
    probe_bytes: usize,
}

impl NodeBuilder {
    pub fn cores(mut self, nr_cores: usize) -> NodeBuilder {
        self.nr_cores = nr_cores;
        self
    }

    pub fn wait_strategy(mut self, wait: Arc<dyn WaitStrategy>) -> NodeBuilder {
        self.wait = Some(wait);
        self
    }

    pub fn probe_bytes(mut self, bytes: usize) -> NodeBuilder {
        self.probe_bytes = bytes;
        self
    }

    /// Bring the node up against `host`.
    pub fn start(self, host: Arc<dyn ThreadHost>) -> Result<Node> {
        let wait = self
            .wait
            .unwrap_or_else(|| Arc::new(SpinWait::default()) as Arc<dyn WaitStrategy>);

        // Fallible allocations first, so nothing needs manual unwinding.
        let region = Arc::new(
            ControlRegion::new(self.nr_cores).context("allocating the control region")?,
        );
        let probe = Arc::new(
            ProbeRegion::new(self.probe_bytes).context("allocating the probe region")?,
        );

        let agents = Arc::new(Agents::new(region.clone(), host, wait.clone()));
        let bells = Arc::new(DoorbellCall::new(region.clone(), wait.clone()));
        let ctl = CtlSurface::new(agents.clone(), bells.clone());

        let idle = Arc::new(IdleSlot::new(Arc::new(YieldIdle)));
        idle.install(Arc::new(AgentIdle::new(agents.clone())))
            .context("installing the idle takeover")?;

        let stop = Arc::new(AtomicBool::new(false));
        let mut node = Node {
            region,
            agents,
            idle,
            bells,
            ctl,
            probe,
            wait,
            stop,
            workers: Vec::with_capacity(self.nr_cores),
        };

        for i in 0..self.nr_cores {
            match node.spawn_worker(CoreId(i as u32)) {
                Ok(handle) => node.workers.push(handle),
                Err(e) => {
                    // Release what came up: stop the earlier workers and
                    // put the idle policy back before bailing.
                    node.shutdown();
                    return Err(e);
                }
            }
        }

        info!("node up: {} cores", node.region.nr_cores());
        Ok(node)
    }
}

pub struct Node {
    region: Arc<ControlRegion>,
    agents: Arc<Agents>,
    idle: Arc<IdleSlot>,
    bells: Arc<DoorbellCall>,
    ctl: CtlSurface,
    probe: Arc<ProbeRegion>,
    wait: Arc<dyn WaitStrategy>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder {
            nr_cores: 1,
            wait: None,
            probe_bytes: DEFAULT_PROBE_BYTES,
        }
    }

    fn spawn_worker(&self, core: CoreId) -> Result<JoinHandle<()>> {
        let agents = self.agents.clone();
        let idle = self.idle.clone();
        let bells = self.bells.clone();
        let stop = self.stop.clone();

        std::thread::Builder::new()
            .name(format!("agent-{}", core.0))
            .spawn(move || {
                debug!("{core}: agent service loop up");
                while !stop.load(Ordering::Acquire) {
                    while bells.take(core) {
                        agents.service_interrupt(core);
                    }
                    // One bounded idle pass through the installed policy;
                    // doorbells get a look between passes.
                    idle.enter_idle(core);
                }
                debug!("{core}: agent service loop down");
            })
            .with_context(|| format!("spawning the agent thread for {core}"))
    }

    pub fn nr_cores(&self) -> usize {
        self.region.nr_cores()
    }

    pub fn ctl(&self) -> &CtlSurface {
        &self.ctl
    }

    pub fn agents(&self) -> &Arc<Agents> {
        &self.agents
    }

    /// Writer-side handle over the shared region (the mmap equivalent).
    /// Privileged.
    pub fn orchestrator(&self, caller: &Caller) -> Result<Orchestrator, CtlError> {
        if !caller.admin {
            return Err(CtlError::PermissionDenied);
        }
        Ok(Orchestrator::new(self.region.clone(), self.wait.clone()))
    }

    /// Raw view of the shared region. Privileged.
    pub fn map_region(&self, caller: &Caller) -> Result<Arc<ControlRegion>, CtlError> {
        if !caller.admin {
            return Err(CtlError::PermissionDenied);
        }
        Ok(self.region.clone())
    }

    /// The latency-probe block. Privileged.
    pub fn map_probe(&self, caller: &Caller) -> Result<Arc<ProbeRegion>, CtlError> {
        if !caller.admin {
            return Err(CtlError::PermissionDenied);
        }
        Ok(self.probe.clone())
    }

    /// Stop the service loops, restore the idle policy. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        // Break every core out of its idle wait so the stop flag is seen.
        for i in 0..self.region.nr_cores() {
            self.wait
                .notify(self.region.block(CoreId(i as u32)).gen_word());
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.idle.restore();
        info!("node down");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
