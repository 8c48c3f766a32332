//! CPU cache synchronization around DMA transfers.
//!
//! Devices behind a graphics aperture do not snoop the CPU caches unless the mapping
//! asks for it. Drivers therefore call [`SgDma::sync`](crate::SgDma::sync) before and
//! after each transfer, which hands the mapping to the [`SyncHook`] installed on the
//! tag.

use core::ops::BitOr;

use crate::{
    BufferKind, DmaError, Mapping, PhysicalAddress, VirtualAddress,
    arch::{self, PAGE_SIZE},
};

/// Which side of a transfer a sync is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncOps(u8);

impl SyncOps {
    /// Before the device reads memory written by the device (CPU about to read back).
    pub const PREREAD: Self = Self(1 << 0);
    /// Before the device reads memory written by the CPU.
    pub const PREWRITE: Self = Self(1 << 1);
    /// After the device wrote memory the CPU will read.
    pub const POSTREAD: Self = Self(1 << 2);
    /// After the device read memory the CPU wrote.
    pub const POSTWRITE: Self = Self(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns whether any of the flags in `other` are set.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns whether any pre-transfer operation is requested.
    pub const fn is_pre(self) -> bool {
        self.intersects(Self(Self::PREREAD.0 | Self::PREWRITE.0))
    }

    /// Returns whether any post-transfer operation is requested.
    pub const fn is_post(self) -> bool {
        self.intersects(Self(Self::POSTREAD.0 | Self::POSTWRITE.0))
    }
}

impl BitOr for SyncOps {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Makes the CPU and device views of a mapped range agree.
pub trait SyncHook: Send + Sync {
    /// Synchronizes `len` bytes starting `offset` bytes into the loaded buffer.
    fn sync(&self, mapping: &Mapping, offset: usize, len: usize, ops: SyncOps)
    -> Result<(), DmaError>;
}

/// CPU cache maintenance primitives.
pub trait CacheOps: Send + Sync {
    /// Returns the granule of [`flush_virtual`](Self::flush_virtual), or 0 if the CPU
    /// cannot flush single cache lines.
    fn line_size(&self) -> usize;

    /// Writes back and invalidates every line of `[va, va + len)`.
    fn flush_virtual(&self, va: VirtualAddress, len: usize);

    /// Writes back and invalidates the page at `pa`.
    fn flush_page(&self, pa: PhysicalAddress);

    /// Writes back and invalidates the whole cache.
    fn flush_all(&self);

    /// Orders cache flushes against surrounding memory accesses.
    fn fence(&self);
}

/// Cache maintenance on the current CPU.
///
/// Physical pages are reached through a linear direct map of physical memory.
pub struct ArchCache {
    direct_map: VirtualAddress,
    line_size: usize,
}

impl ArchCache {
    /// Creates cache operations for physical memory mapped linearly at `direct_map`.
    ///
    /// # Safety
    ///
    /// Every physical page that will be synced must be mapped at `direct_map + pa`, and
    /// the caller must be running privileged.
    pub unsafe fn new(direct_map: VirtualAddress) -> Self {
        Self {
            direct_map,
            line_size: arch::clflush_line_size(),
        }
    }
}

impl CacheOps for ArchCache {
    fn line_size(&self) -> usize {
        self.line_size
    }

    fn flush_virtual(&self, va: VirtualAddress, len: usize) {
        if self.line_size == 0 || len == 0 {
            return;
        }
        let mut line = va.align_down(self.line_size);
        let end = va + len;
        while line < end {
            // SAFETY: buffers are only synced while loaded, so their pages are mapped.
            unsafe { arch::clflush(line) };
            line = line + self.line_size;
        }
    }

    fn flush_page(&self, pa: PhysicalAddress) {
        let va = self.direct_map + pa.page_base().as_u64() as usize;
        self.flush_virtual(va, PAGE_SIZE);
    }

    fn flush_all(&self) {
        // SAFETY: construction requires privileged execution.
        unsafe { arch::wbinvd() };
    }

    fn fence(&self) {
        arch::mfence();
    }
}

/// Flushes CPU caches for mappings whose device does not snoop them.
///
/// Every operation except a lone `POSTWRITE` needs a flush: before a device read, data
/// has to reach memory; before and after a device write, stale or speculatively loaded
/// lines have to go.
pub struct CacheFlushSync<C: CacheOps> {
    cache: C,
}

impl<C: CacheOps> CacheFlushSync<C> {
    pub fn new(cache: C) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    fn flush_linear(&self, base: VirtualAddress, start: usize, end: usize) {
        let mut va = base + start;
        let mut offset = start;
        while offset < end {
            self.cache.flush_virtual(va, PAGE_SIZE);
            va = va + PAGE_SIZE;
            offset += PAGE_SIZE;
        }
    }

    fn flush_raw(&self, mapping: &Mapping, start: usize, end: usize) {
        let mut offset = 0;
        let mut last_page = None;
        for run in mapping.physical_runs() {
            let run_end = offset + run.len;
            if run_end > start && offset < end {
                let page = run.addr.page_base();
                if last_page != Some(page) {
                    self.cache.flush_page(page);
                    last_page = Some(page);
                }
            }
            offset = run_end;
            if offset >= end {
                break;
            }
        }
    }
}

impl<C: CacheOps> SyncHook for CacheFlushSync<C> {
    fn sync(
        &self,
        mapping: &Mapping,
        offset: usize,
        len: usize,
        ops: SyncOps,
    ) -> Result<(), DmaError> {
        if ops.is_pre() && ops.is_post() {
            log::error!("sync: mixed PRE and POST operations {:?}", ops);
            return Err(DmaError::InvalidArgument);
        }
        if offset >= mapping.mapped_len() {
            log::error!(
                "sync: bad offset {:#x} (size = {:#x})",
                offset,
                mapping.mapped_len()
            );
            return Err(DmaError::InvalidArgument);
        }
        if len == 0 || len > mapping.mapped_len() - offset {
            log::error!("sync: bad length {:#x} at offset {:#x}", len, offset);
            return Err(DmaError::InvalidArgument);
        }

        if mapping.is_coherent() {
            return Ok(());
        }
        if !ops.intersects(SyncOps::PREREAD | SyncOps::PREWRITE | SyncOps::POSTREAD) {
            return Ok(());
        }

        if self.cache.line_size() == 0 {
            self.cache.flush_all();
            return Ok(());
        }

        let start = offset & !(PAGE_SIZE - 1);
        let end = (offset + len).next_multiple_of(PAGE_SIZE);

        self.cache.fence();
        let result = match (mapping.kind(), mapping.linear_base()) {
            (BufferKind::Linear, Some(base)) => {
                self.flush_linear(base, start, end);
                Ok(())
            }
            (BufferKind::Raw, _) => {
                self.flush_raw(mapping, start, end);
                Ok(())
            }
            (kind, _) => {
                log::error!("sync: cannot flush a {:?} buffer", kind);
                Err(DmaError::Unsupported)
            }
        };
        self.cache.fence();
        result
    }
}
