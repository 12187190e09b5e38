//! Wait-on-address strategies.
//!
//! The idle takeover needs "block until this word changes or a budget
//! elapses, as cheaply as the platform allows". On hardware that would be
//! monitor/mwait; here it is a pluggable [`WaitStrategy`] so the protocol
//! runs (and is testable) anywhere:
//!
//! - [`SpinWait`]: exponential-backoff spin loop, portable default.
//! - [`FutexWait`]: Linux futex wait/wake with a hint-derived timeout.
//!
//! Writers must call [`WaitStrategy::notify`] after mutating a waited-on
//! word — a plain store is invisible to a futex sleeper. Spin waiters
//! ignore the notification and rely on their bounded budget instead, so
//! waking is never lost, only (for spinners) slightly delayed.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::WaitHint;

/// Blocking-wait capability over a single shared word.
///
/// `wait_for_change` returns the word's current value once it differs from
/// `seen` or the hint's budget elapses, whichever comes first. The final
/// load carries acquire semantics, so a caller that observes a new value
/// also observes everything published before it. Spurious returns with the
/// value unchanged are allowed; callers re-check and re-arm.
pub trait WaitStrategy: Send + Sync {
    fn wait_for_change(&self, addr: &AtomicU32, seen: u32, hint: WaitHint) -> u32;

    /// Wake any waiter blocked on `addr`. May be a no-op.
    fn notify(&self, addr: &AtomicU32);
}

/// Exponential-backoff spin wait. Works everywhere; burns a core while
/// waiting, which is exactly what the takeover wants from an idle core.
pub struct SpinWait {
    /// Base number of checks before giving up one budget round.
    max_spins: u32,
}

impl SpinWait {
    pub fn new(max_spins: u32) -> SpinWait {
        SpinWait {
            max_spins: max_spins.max(1),
        }
    }
}

impl Default for SpinWait {
    fn default() -> Self {
        SpinWait::new(10_000)
    }
}

impl WaitStrategy for SpinWait {
    fn wait_for_change(&self, addr: &AtomicU32, seen: u32, hint: WaitHint) -> u32 {
        // A deeper hint buys a longer spin budget before the caller gets
        // control back to re-check its surroundings.
        let budget = self.max_spins.saturating_mul(hint.0.saturating_add(1));
        let mut pause = 1u32;
        let mut spent = 0u32;
        loop {
            let cur = addr.load(Ordering::Acquire);
            if cur != seen || spent >= budget {
                return cur;
            }
            for _ in 0..pause {
                std::hint::spin_loop();
            }
            spent = spent.saturating_add(pause);
            if pause < 64 {
                pause <<= 1;
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn notify(&self, _addr: &AtomicU32) {}
}

/// Futex-backed wait for Linux. The kernel re-checks the expected value
/// under its own lock, so there is no arm/check race to handle here.
#[cfg(target_os = "linux")]
pub struct FutexWait {
    /// Timeout granted per hint step, in nanoseconds.
    step_ns: u64,
}

#[cfg(target_os = "linux")]
impl FutexWait {
    pub fn new(step_ns: u64) -> FutexWait {
        FutexWait {
            step_ns: step_ns.max(1),
        }
    }
}

#[cfg(target_os = "linux")]
impl Default for FutexWait {
    fn default() -> Self {
        // 250us per hint step keeps the idle loop responsive to doorbells
        // even if a wake is lost to a racing teardown.
        FutexWait::new(250_000)
    }
}

#[cfg(target_os = "linux")]
impl WaitStrategy for FutexWait {
    fn wait_for_change(&self, addr: &AtomicU32, seen: u32, hint: WaitHint) -> u32 {
        let cur = addr.load(Ordering::Acquire);
        if cur != seen {
            return cur;
        }

        let budget = self.step_ns.saturating_mul(hint.0 as u64 + 1);
        let ts = libc::timespec {
            tv_sec: (budget / 1_000_000_000) as libc::time_t,
            tv_nsec: (budget % 1_000_000_000) as libc::c_long,
        };
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                addr as *const AtomicU32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                seen,
                &ts as *const libc::timespec,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
        // Woken, timed out, or spurious — the caller re-checks either way.
        addr.load(Ordering::Acquire)
    }

    fn notify(&self, addr: &AtomicU32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                addr as *const AtomicU32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}
