//! x86_64 hardware implementation.
//!
//! Page size comes from the 4 KiB translation granule shared by the CPU, the GTT and
//! the IOMMUs we drive. Cache maintenance uses `clflush`/`mfence`, falling back to
//! `wbinvd` where the CPU lacks `clflush`.

use core::arch::{asm, x86_64 as intrinsics};

use x86_64::structures::paging::{PageSize, Size4KiB};

use crate::VirtualAddress;

/// Page size in bytes; also the granule of every translation table entry.
pub const PAGE_SIZE: usize = Size4KiB::SIZE as usize;

/// Runs `f` with interrupts masked on the current CPU.
///
/// Address-space bookkeeping may be reached from interrupt context, so the lock around
/// it must never be held with interrupts enabled.
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    x86_64::instructions::interrupts::without_interrupts(f)
}

/// Returns the `clflush` line size in bytes, or 0 if `clflush` is unavailable.
pub fn clflush_line_size() -> usize {
    // SAFETY: cpuid leaf 1 is available on every x86_64 CPU.
    let leaf = unsafe { intrinsics::__cpuid(1) };
    if leaf.edx & (1 << 19) == 0 {
        return 0;
    }
    (((leaf.ebx >> 8) & 0xff) * 8) as usize
}

/// Flushes the cache line containing `addr`.
///
/// # Safety
/// `addr` must be mapped in the current address space.
#[inline]
pub unsafe fn clflush(addr: VirtualAddress) {
    // SAFETY: the caller guarantees the address is mapped.
    unsafe { intrinsics::_mm_clflush(addr.as_ptr::<u8>()) }
}

/// Orders all prior loads and stores, including cache flushes.
#[inline]
pub fn mfence() {
    // SAFETY: mfence has no preconditions; SSE2 is part of the x86_64 baseline.
    unsafe { intrinsics::_mm_mfence() }
}

/// Writes back and invalidates every cache on this CPU.
///
/// # Safety
/// Must run at CPL 0.
#[inline]
pub unsafe fn wbinvd() {
    // SAFETY: the caller guarantees we are running privileged.
    unsafe { asm!("wbinvd", options(nostack, preserves_flags)) }
}
