//! Software emulation for testing and development.
//!
//! Keeps the hardware page size but replaces every privileged operation with an
//! equivalent that is safe to run in a host process: interrupt masking becomes a no-op
//! and cache maintenance degrades to compiler/CPU fences.

use core::sync::atomic::{Ordering, fence};

use crate::VirtualAddress;

/// Page size in bytes (4 KiB, matching the hardware translation granule).
pub const PAGE_SIZE: usize = 4096;

/// Emulated `clflush` line size.
const CACHE_LINE_SIZE: usize = 64;

/// Runs `f`; there are no interrupts to mask in emulation.
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}

/// Returns the emulated `clflush` line size.
pub fn clflush_line_size() -> usize {
    CACHE_LINE_SIZE
}

/// Emulated cache line flush.
///
/// # Safety
/// Always safe in emulation; unsafe to match the hardware signature.
#[inline]
pub unsafe fn clflush(_addr: VirtualAddress) {}

/// Emulated memory fence.
#[inline]
pub fn mfence() {
    fence(Ordering::SeqCst);
}

/// Emulated whole-cache write-back.
///
/// # Safety
/// Always safe in emulation; unsafe to match the hardware signature.
#[inline]
pub unsafe fn wbinvd() {
    fence(Ordering::SeqCst);
}
