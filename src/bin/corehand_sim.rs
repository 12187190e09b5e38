//! corehand-sim — drive the handoff protocol against the simulated host.
//!
//! Spins up a node, a population of simulated worker threads, and a
//! seeded orchestrator that randomly assigns, parks, idles, and preempts
//! them, then reports what the protocol did. Mostly a smoke-and-latency
//! playground; the same seed always produces the same decision sequence.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use corehand::{
    Caller, CoreId, CtlRequest, CtlResponse, Node, SignalNum, SimHost, SpinWait, ThreadHost,
    ThreadState, Tid, WaitHint,
};

/// Drive the core-handoff protocol against a simulated host.
#[derive(Parser)]
#[command(name = "corehand-sim")]
struct Cli {
    /// Number of cores to manage.
    #[arg(short, long, default_value_t = 4)]
    cores: u32,

    /// Number of simulated worker threads.
    #[arg(short, long, default_value_t = 8)]
    threads: u32,

    /// Orchestrator decision rounds.
    #[arg(short, long, default_value_t = 1000)]
    rounds: u32,

    /// PRNG seed for the decision sequence.
    #[arg(long, env = "COREHAND_SEED", default_value_t = 42)]
    seed: u64,

    /// Increase verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let llv = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let host = Arc::new(SimHost::new());
    let mut next_tid = 100;
    let mut pool: Vec<Tid> = Vec::new();
    for _ in 0..cli.threads {
        let tid = Tid(next_tid);
        next_tid += 1;
        host.add_thread(tid);
        pool.push(tid);
    }

    let mut node = Node::builder()
        .cores(cli.cores as usize)
        .wait_strategy(Arc::new(SpinWait::default()))
        .start(host.clone())?;

    let admin = Caller::admin(Tid(1));
    let orch = node.orchestrator(&admin)?;

    let mut rng = SmallRng::seed_from_u64(cli.seed);
    let mut assigned = 0u64;
    let mut idled = 0u64;
    let mut preempts = 0u64;
    let mut signals = 0usize;

    for _ in 0..cli.rounds {
        let core = CoreId(rng.gen_range(0..cli.cores));
        match rng.gen_range(0..10) {
            // Mostly: hand the core to a random sleeping thread.
            0..=5 => {
                let tid = pool[rng.gen_range(0..pool.len())];
                if host.lookup(tid) == Some(ThreadState::Sleeping) {
                    orch.assign(core, tid, WaitHint::SHALLOW);
                    assigned += 1;
                }
            }
            // Sometimes: idle the core and recycle its thread.
            6..=7 => {
                orch.assign_idle(core);
                idled += 1;
            }
            // Occasionally: ask the current owner to yield.
            _ => {
                let mut bytes = vec![0u8; (cli.cores as usize).div_ceil(8)];
                bytes[core.index() / 8] |= 1 << (core.index() % 8);
                match node.ctl().handle(
                    &admin,
                    CtlRequest::Interrupt {
                        mask_bytes: &bytes,
                        signum: SignalNum(10),
                    },
                )? {
                    CtlResponse::Interrupted { targeted } => preempts += targeted as u64,
                    _ => unreachable!(),
                }
            }
        }

        // Running threads finish their quantum and exit; replace them so
        // the pool of assignable work stays full. An exit is also what
        // lets the core's agent move past its settling check.
        for slot in 0..pool.len() {
            let tid = pool[slot];
            if host.lookup(tid) == Some(ThreadState::Running) && rng.gen_bool(0.5) {
                signals += host.signals_for(tid).len();
                host.remove_thread(tid);
                let fresh = Tid(next_tid);
                next_tid += 1;
                host.add_thread(fresh);
                pool[slot] = fresh;
            }
        }
    }

    // Give the agents a moment to drain the last round.
    std::thread::sleep(std::time::Duration::from_millis(50));

    for &tid in &pool {
        signals += host.signals_for(tid).len();
    }
    info!(
        "rounds={} assigned={} idled={} preempt-requests={} signals-delivered={} dropped={}",
        cli.rounds,
        assigned,
        idled,
        preempts,
        signals,
        node.agents().dropped_assignments()
    );

    node.shutdown();
    Ok(())
}
