//! The generic, non-translating DMA backend.
//!
//! Scatter/gather mapping is layered on top of a plain DMA implementation that knows how
//! to turn a [`Buffer`] into physical memory. The mapping layer then gives those physical
//! pages device-virtual addresses through the aperture.

use alloc::vec::Vec;

use spin::Mutex;

use crate::{
    AddressContext, Buffer, DmaError, Extent, HumanSize, MapParams, PhysicalAddress, RawSegment,
    Span, VirtualAddress, arch,
};

/// Primitive DMA operations the mapping layer delegates to.
pub trait DmaBackend: Send + Sync {
    /// Allocates the per-mapping storage for physical runs.
    fn create_raw_mapping(&self, params: &MapParams) -> Result<Vec<RawSegment>, DmaError>;

    /// Releases storage returned by [`create_raw_mapping`](Self::create_raw_mapping).
    fn destroy_raw_mapping(&self, runs: Vec<RawSegment>);

    /// Resolves `buffer` into physically contiguous runs appended to `out`, in buffer
    /// order. No run crosses a page boundary.
    ///
    /// On failure `out` may hold a partial result; the caller discards it.
    fn load_raw(&self, buffer: &Buffer<'_>, out: &mut Vec<RawSegment>) -> Result<(), DmaError>;

    /// Forgets the runs produced by a load.
    fn unload_raw(&self, runs: &mut Vec<RawSegment>);

    /// Allocates `size` bytes of physically contiguous DMA-able memory.
    fn alloc_dma_memory(
        &self,
        size: usize,
        align: usize,
        boundary: usize,
    ) -> Result<RawSegment, DmaError>;

    /// Frees memory returned by [`alloc_dma_memory`](Self::alloc_dma_memory).
    fn free_dma_memory(&self, memory: RawSegment) -> Result<(), DmaError>;
}

/// A backend for memory the device can reach directly.
///
/// Virtual buffers are resolved page by page through their [`AddressContext`]. DMA
/// memory, if configured, is carved out of one physical range.
pub struct DirectBackend {
    memory: Option<Mutex<Extent>>,
}

impl DirectBackend {
    /// Creates a backend with no DMA memory to hand out.
    pub fn new() -> Self {
        Self { memory: None }
    }

    /// Creates a backend that allocates DMA memory from `[start, start + size)`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn with_memory(start: PhysicalAddress, size: u64) -> Self {
        Self {
            memory: Some(Mutex::new(Extent::new(start.as_u64(), size))),
        }
    }

    /// Walks a virtually contiguous range page by page.
    fn walk_virtual(
        context: &dyn AddressContext,
        base: VirtualAddress,
        len: usize,
        out: &mut Vec<RawSegment>,
    ) -> Result<(), DmaError> {
        let mut va = base;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(arch::PAGE_SIZE - va.page_offset());
            let pa = context.extract(va).ok_or_else(|| {
                log::debug!("{:?}: no physical page behind {}", context.id(), va);
                DmaError::InvalidArgument
            })?;
            push_run(out, RawSegment::new(pa, chunk))?;
            remaining -= chunk;
            if remaining > 0 {
                va = va.checked_add(chunk).ok_or_else(|| {
                    log::debug!("{:?}: buffer at {} wraps the address space", context.id(), base);
                    DmaError::InvalidArgument
                })?;
            }
        }
        Ok(())
    }

    /// Splits a physically contiguous segment at page boundaries.
    fn split_physical(seg: &RawSegment, out: &mut Vec<RawSegment>) -> Result<(), DmaError> {
        let mut pa = seg.addr;
        let mut remaining = seg.len;
        while remaining > 0 {
            let chunk = remaining.min(arch::PAGE_SIZE - pa.page_offset());
            push_run(out, RawSegment::new(pa, chunk))?;
            remaining -= chunk;
            if remaining > 0 {
                pa = pa.checked_add(chunk).ok_or_else(|| {
                    log::debug!("segment at {} wraps the physical address space", seg.addr);
                    DmaError::InvalidArgument
                })?;
            }
        }
        Ok(())
    }
}

impl Default for DirectBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaBackend for DirectBackend {
    fn create_raw_mapping(&self, params: &MapParams) -> Result<Vec<RawSegment>, DmaError> {
        let mut runs = Vec::new();
        runs.try_reserve(params.max_size.div_ceil(arch::PAGE_SIZE) + 1)
            .map_err(|_| DmaError::OutOfMemory)?;
        Ok(runs)
    }

    fn destroy_raw_mapping(&self, runs: Vec<RawSegment>) {
        drop(runs);
    }

    fn load_raw(&self, buffer: &Buffer<'_>, out: &mut Vec<RawSegment>) -> Result<(), DmaError> {
        match *buffer {
            Buffer::Linear { base, len, context } => Self::walk_virtual(context, base, len, out),
            Buffer::Chain { fragments, context } => {
                for fragment in fragments {
                    Self::walk_virtual(context, fragment.data, fragment.len, out)?;
                }
                Ok(())
            }
            Buffer::Scatter { iov, context } => {
                // Pages of another address space cannot be kept resident for the life of
                // the mapping.
                if !context.is_kernel() {
                    return Err(DmaError::Unsupported);
                }
                for vec in iov {
                    Self::walk_virtual(context, vec.base, vec.len, out)?;
                }
                Ok(())
            }
            Buffer::Raw(segs) => {
                for seg in segs {
                    Self::split_physical(seg, out)?;
                }
                Ok(())
            }
        }
    }

    fn unload_raw(&self, runs: &mut Vec<RawSegment>) {
        runs.clear();
    }

    fn alloc_dma_memory(
        &self,
        size: usize,
        align: usize,
        boundary: usize,
    ) -> Result<RawSegment, DmaError> {
        let memory = self.memory.as_ref().ok_or(DmaError::OutOfMemory)?;
        let size = size.div_ceil(arch::PAGE_SIZE) * arch::PAGE_SIZE;

        let span = arch::without_interrupts(|| {
            memory
                .lock()
                .reserve(size as u64, align.max(1) as u64, boundary as u64, None)
        })
        .map_err(|err| match err {
            DmaError::AddressSpaceExhausted => {
                log::debug!("no {} block of DMA memory available", HumanSize::from(size));
                DmaError::OutOfMemory
            }
            other => other,
        })?;

        Ok(RawSegment::new(PhysicalAddress::new(span.start()), size))
    }

    fn free_dma_memory(&self, memory: RawSegment) -> Result<(), DmaError> {
        let extent = self.memory.as_ref().ok_or(DmaError::NotFound)?;
        let span = Span::new(memory.addr.as_u64(), memory.len as u64);
        arch::without_interrupts(|| extent.lock().release(span))
    }
}

/// Appends a run, reporting allocation failure instead of aborting.
fn push_run(out: &mut Vec<RawSegment>, run: RawSegment) -> Result<(), DmaError> {
    out.try_reserve(1).map_err(|_| DmaError::OutOfMemory)?;
    out.push(run);
    Ok(())
}
