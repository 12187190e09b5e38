//! Core bitmasks for targeting interrupt broadcasts.
//!
//! A [`CoreMask`] is a fixed-width `BitVec` of `u64` words, one bit per
//! core, in the same spirit as a kernel cpumask. Masks that arrive from an
//! untrusted caller come in as raw bytes of whatever length the caller
//! felt like supplying; [`CoreMask::from_user_bytes`] normalizes them to
//! the configured width instead of reading past either end.

use std::fmt;

use bitvec::prelude::*;

use crate::types::CoreId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreMask {
    mask: BitVec<u64, Lsb0>,
}

impl CoreMask {
    /// Empty mask sized for `nr_cores`.
    pub fn new(nr_cores: usize) -> CoreMask {
        CoreMask {
            mask: bitvec![u64, Lsb0; 0; nr_cores],
        }
    }

    /// Build a mask from caller-supplied bytes (little-endian bit order).
    ///
    /// A short buffer is zero-padded; an over-long one is truncated to the
    /// configured width. Bits beyond `nr_cores` inside the last consumed
    /// byte are dropped as well.
    pub fn from_user_bytes(bytes: &[u8], nr_cores: usize) -> CoreMask {
        let mut mask = CoreMask::new(nr_cores);
        for (byte_idx, &byte) in bytes.iter().enumerate() {
            if byte_idx * 8 >= nr_cores {
                break;
            }
            let mut v = byte;
            while v != 0 {
                let bit = v.trailing_zeros() as usize;
                v &= v - 1;
                let core = byte_idx * 8 + bit;
                if core < nr_cores {
                    mask.mask.set(core, true);
                }
            }
        }
        mask
    }

    pub fn from_cores(cores: &[CoreId], nr_cores: usize) -> CoreMask {
        let mut mask = CoreMask::new(nr_cores);
        for &core in cores {
            mask.set(core);
        }
        mask
    }

    pub fn set(&mut self, core: CoreId) {
        if core.index() < self.mask.len() {
            self.mask.set(core.index(), true);
        }
    }

    pub fn test(&self, core: CoreId) -> bool {
        self.mask.get(core.index()).map(|b| *b).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn nr_cores(&self) -> usize {
        self.mask.len()
    }

    /// Iterate the set cores in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = CoreId> + '_ {
        self.mask.iter_ones().map(|i| CoreId(i as u32))
    }
}

impl fmt::Display for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        write!(f, "{{")?;
        for core in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", core.0)?;
            first = false;
        }
        write!(f, "}}")
    }
}
