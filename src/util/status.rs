//! Packed atomic status word shared by the lanes of a transport

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam::utils::CachePadded;

/// Atomic lifecycle word: a small state sub-field plus independent
/// request and readiness bits.
///
/// All mutations go through compare-and-swap. Side effects are decided
/// by the caller only after [`StatusWord::transition`] reports a commit.
pub struct StatusWord {
    bits: CachePadded<AtomicU32>,
}

impl StatusWord {
    /// Create a status word holding `bits`
    pub fn new(bits: u32) -> Self {
        Self {
            bits: CachePadded::new(AtomicU32::new(bits)),
        }
    }

    /// Load the current status
    pub fn load(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    /// Apply `f` in a compare-and-swap loop.
    ///
    /// `f` receives the freshly loaded status and returns the target
    /// status, or `None` to abandon the transition. On commit the
    /// `(old, new)` pair is returned.
    pub fn transition<F>(&self, mut f: F) -> Option<(u32, u32)>
    where
        F: FnMut(u32) -> Option<u32>,
    {
        let mut old = self.load();
        loop {
            let new = f(old)?;
            match self
                .bits
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some((old, new)),
                Err(actual) => old = actual,
            }
        }
    }

    /// Set `mask`; returns the previous status
    pub fn set(&self, mask: u32) -> u32 {
        self.bits.fetch_or(mask, Ordering::AcqRel)
    }

    /// Clear `mask`; returns the previous status
    pub fn clear(&self, mask: u32) -> u32 {
        self.bits.fetch_and(!mask, Ordering::AcqRel)
    }
}

impl fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusWord({:#010x})", self.load())
    }
}
