//! Latency-probe memory.
//!
//! The orchestrator measures memory latency against a small region that
//! must not be served from a CPU cache. The real uncached mapping is a
//! platform facility; this portable stand-in provides the shape of the
//! capability — a fixed, page-aligned, locked-down block with volatile
//! accessors — and documents the cache-bypass property as best-effort
//! where the platform offers nothing stronger.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use anyhow::{bail, Context, Result};
use log::debug;

const PAGE_SIZE: usize = 4096;

/// Page-aligned probe block. Allocation is fatal-on-failure at node
/// start; the block never grows or moves afterwards.
pub struct ProbeRegion {
    ptr: *mut u8,
    layout: Layout,
    locked: bool,
}

// The region is plain bytes behind volatile accessors; concurrent probes
// race benignly by design.
unsafe impl Send for ProbeRegion {}
unsafe impl Sync for ProbeRegion {}

impl ProbeRegion {
    pub fn new(len: usize) -> Result<ProbeRegion> {
        if len == 0 {
            bail!("probe region must not be empty");
        }
        let len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let layout =
            Layout::from_size_align(len, PAGE_SIZE).context("bad probe region layout")?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            bail!("probe region allocation of {len} bytes failed");
        }

        let locked = lock_pages(ptr, len);
        if !locked {
            debug!("probe region not locked; latency numbers may include faults");
        }

        Ok(ProbeRegion {
            ptr,
            layout,
            locked,
        })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Whether the pages are pinned resident.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Volatile read; never elided or cached by the compiler.
    pub fn read(&self, offset: usize) -> u8 {
        assert!(offset < self.len());
        unsafe { self.ptr.add(offset).read_volatile() }
    }

    /// Volatile write.
    pub fn write(&self, offset: usize, val: u8) {
        assert!(offset < self.len());
        unsafe { self.ptr.add(offset).write_volatile(val) }
    }
}

impl std::fmt::Debug for ProbeRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRegion")
            .field("len", &self.len())
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl Drop for ProbeRegion {
    fn drop(&mut self) {
        unsafe {
            if self.locked {
                unlock_pages(self.ptr, self.layout.size());
            }
            dealloc(self.ptr, self.layout);
        }
    }
}

#[cfg(target_os = "linux")]
fn lock_pages(ptr: *mut u8, len: usize) -> bool {
    unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
}

#[cfg(target_os = "linux")]
fn unlock_pages(ptr: *mut u8, len: usize) {
    unsafe {
        libc::munlock(ptr as *const libc::c_void, len);
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_pages(_ptr: *mut u8, _len: usize) -> bool {
    false
}

#[cfg(not(target_os = "linux"))]
fn unlock_pages(_ptr: *mut u8, _len: usize) {}
