//! End-to-end exercises of a threaded node against the simulated host.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use corehand::{
    Caller, CoreId, CtlError, CtlRequest, CtlResponse, Node, ParkOutcome, SignalNum, SimHost,
    SpinWait, ThreadHost, ThreadState, Tid, WaitHint,
};

use common::wait_for;

fn start_node(nr_cores: usize) -> (Arc<SimHost>, Node) {
    common::setup();
    let host = Arc::new(SimHost::new());
    let node = Node::builder()
        .cores(nr_cores)
        .wait_strategy(Arc::new(SpinWait::new(500)))
        .start(host.clone())
        .unwrap();
    (host, node)
}

#[test]
fn test_assignment_reaches_a_sleeping_thread() {
    let (host, node) = start_node(2);
    let admin = Caller::admin(Tid(1));
    let orch = node.orchestrator(&admin).unwrap();
    let t = Tid(100);
    host.add_thread(t);

    let gen = orch.assign(CoreId(1), t, WaitHint::SHALLOW);
    assert!(wait_for(Duration::from_secs(10), || {
        host.lookup(t) == Some(ThreadState::Running)
    }));
    assert_eq!(host.pinned_core(t), Some(CoreId(1)));
    assert!(wait_for(Duration::from_secs(10), || {
        orch.core_acked(CoreId(1)) == gen
    }));
    assert!(orch.core_busy(CoreId(1)));
}

#[test]
fn test_interrupt_reaches_the_running_owner() {
    let (host, node) = start_node(2);
    let admin = Caller::admin(Tid(1));
    let orch = node.orchestrator(&admin).unwrap();
    let t = Tid(100);
    host.add_thread(t);

    let gen = orch.assign(CoreId(1), t, WaitHint::SHALLOW);
    assert!(wait_for(Duration::from_secs(10), || {
        orch.core_acked(CoreId(1)) == gen
    }));

    let resp = node
        .ctl()
        .handle(
            &admin,
            CtlRequest::Interrupt {
                mask_bytes: &[0b10],
                signum: SignalNum(12),
            },
        )
        .unwrap();
    assert_eq!(resp, CtlResponse::Interrupted { targeted: 1 });
    assert!(wait_for(Duration::from_secs(10), || {
        host.signals_for(t) == vec![SignalNum(12)]
    }));
}

#[test]
fn test_parked_thread_is_woken_by_reassignment() {
    let (host, node) = start_node(1);
    let admin = Caller::admin(Tid(1));
    let orch = node.orchestrator(&admin).unwrap();
    let t = Tid(100);
    host.add_thread(t);
    host.set_state(t, ThreadState::Running);

    thread::scope(|s| {
        let handle = s.spawn(|| {
            let _ctx = host.enter(t, CoreId(0));
            node.ctl().handle(&Caller::unprivileged(t), CtlRequest::Park)
        });

        assert!(wait_for(Duration::from_secs(10), || {
            host.lookup(t) == Some(ThreadState::Sleeping)
        }));

        orch.assign(CoreId(0), t, WaitHint::SHALLOW);
        let resp = handle.join().unwrap().unwrap();
        assert_eq!(resp, CtlResponse::Parked(ParkOutcome::Resumed(CoreId(0))));
    });
    assert_eq!(host.lookup(t), Some(ThreadState::Running));
}

#[test]
fn test_begin_wait_blocks_until_resumed() {
    let (host, node) = start_node(1);
    let t = Tid(100);
    host.add_thread(t);
    host.set_state(t, ThreadState::Running);

    thread::scope(|s| {
        let handle = s.spawn(|| {
            let _ctx = host.enter(t, CoreId(0));
            node.ctl().handle(&Caller::unprivileged(t), CtlRequest::BeginWait)
        });

        assert!(wait_for(Duration::from_secs(10), || {
            host.lookup(t) == Some(ThreadState::Sleeping)
        }));
        host.resume(t, CoreId(0));
        assert_eq!(handle.join().unwrap().unwrap(), CtlResponse::Waited);
    });
}

#[test]
fn test_privileged_surfaces_are_gated() {
    let (_host, node) = start_node(1);
    let user = Caller::unprivileged(Tid(100));
    assert!(matches!(
        node.orchestrator(&user).unwrap_err(),
        CtlError::PermissionDenied
    ));
    assert!(matches!(
        node.map_region(&user).unwrap_err(),
        CtlError::PermissionDenied
    ));
    assert!(matches!(
        node.map_probe(&user).unwrap_err(),
        CtlError::PermissionDenied
    ));
}

#[test]
fn test_shutdown_is_idempotent() {
    let (_host, mut node) = start_node(2);
    node.shutdown();
    node.shutdown();
}

/// Seeded churn: assignments, interrupts, and idles in random order.
/// Every assignment targets a freshly-registered sleeping thread and
/// waits for the acknowledgement, so nothing should ever be dropped.
#[test]
fn test_random_churn_drops_nothing() {
    let (host, node) = start_node(2);
    let admin = Caller::admin(Tid(1));
    let orch = node.orchestrator(&admin).unwrap();

    let mut rng = SmallRng::seed_from_u64(42);
    let mut next_tid = 100;
    for _ in 0..200 {
        let core = CoreId(rng.gen_range(0..2));
        match rng.gen_range(0..10) {
            0..=6 => {
                let t = Tid(next_tid);
                next_tid += 1;
                host.add_thread(t);
                let gen = orch.assign(core, t, WaitHint::SHALLOW);
                assert!(wait_for(Duration::from_secs(10), || {
                    orch.core_acked(core) == gen
                }));
                // The thread runs to completion and exits.
                host.remove_thread(t);
            }
            7..=8 => {
                let gen = orch.assign_idle(core);
                assert!(wait_for(Duration::from_secs(10), || {
                    orch.core_acked(core) == gen
                }));
            }
            _ => {
                let mask = [1u8 << core.0];
                node.ctl()
                    .handle(
                        &admin,
                        CtlRequest::Interrupt {
                            mask_bytes: &mask,
                            signum: SignalNum(10),
                        },
                    )
                    .unwrap();
            }
        }
    }
    assert_eq!(node.agents().dropped_assignments(), 0);
}
