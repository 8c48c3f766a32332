//! The scatter/gather DMA tag.
//!
//! An [`SgDma`] owns one aperture of device-virtual address space and the binder that
//! programs its translation table. Mappings created from it are loaded in three steps:
//!
//! 1. The buffer is resolved into physical runs and every page is recorded in the
//!    mapping's registry (sizing pass).
//! 2. A span of aperture space, one page per recorded page, is reserved and each page
//!    is bound to its slot of the span, followed by a single translation flush.
//! 3. The runs are translated to bus addresses and merged into segments (emission
//!    pass).
//!
//! Any failure unwinds whatever the earlier steps did before returning, so a failed
//! load always leaves the mapping exactly as it was.

use alloc::boxed::Box;
use core::{
    mem,
    sync::atomic::{AtomicU64, Ordering},
};

use spin::Mutex;

use crate::{
    AddressContext, Buffer, BusAddress, DirectBackend, DmaBackend, DmaError, Extent, Fragment,
    HumanSize, IoVec, LOW_WINDOW_END, MapFlags, MapParams, MapState, Mapping, PageBinder,
    RawSegment, Span, SyncHook, SyncOps, VirtualAddress,
    arch::{self, PAGE_SIZE},
    binder, segment,
};

/// A scatter/gather DMA tag for one translation aperture.
pub struct SgDma<B: PageBinder, D: DmaBackend = DirectBackend> {
    /// Name used in log messages.
    name: &'static str,
    /// First bus address of the aperture.
    start: BusAddress,
    /// Device-virtual address space; locked only around a single reserve or release.
    extent: Mutex<Extent>,
    binder: B,
    backend: D,
    sync: Option<Box<dyn SyncHook>>,
    /// Alignment recorded by the last DMA memory allocation, applied to every load.
    align: AtomicU64,
    /// Boundary recorded by the last DMA memory allocation; overrides mapping boundaries.
    boundary: AtomicU64,
}

impl<B: PageBinder, D: DmaBackend> SgDma<B, D> {
    /// Creates a tag managing `size` bytes of aperture starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` or `size` is not page aligned, or `size` is zero.
    pub fn new(name: &'static str, start: BusAddress, size: u64, binder: B, backend: D) -> Self {
        assert!(
            start.is_aligned(PAGE_SIZE as u64),
            "aperture start must be page aligned"
        );
        assert!(
            size != 0 && size % PAGE_SIZE as u64 == 0,
            "aperture size must be a non-zero number of pages"
        );

        log::debug!("{}: {} of DVMA space at {}", name, HumanSize(size), start);

        Self {
            name,
            start,
            extent: Mutex::new(Extent::new(start.as_u64(), size)),
            binder,
            backend,
            sync: None,
            align: AtomicU64::new(0),
            boundary: AtomicU64::new(0),
        }
    }

    /// Installs the hook called by [`sync`](Self::sync).
    pub fn with_sync(mut self, hook: impl SyncHook + 'static) -> Self {
        self.sync = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn binder(&self) -> &B {
        &self.binder
    }

    pub fn backend(&self) -> &D {
        &self.backend
    }

    /// Returns the first bus address of the aperture.
    pub fn start(&self) -> BusAddress {
        self.start
    }

    /// Returns the size of the aperture in bytes.
    pub fn size(&self) -> u64 {
        arch::without_interrupts(|| self.extent.lock().size())
    }

    /// Returns the number of bytes of aperture currently held by loaded mappings.
    pub fn outstanding(&self) -> u64 {
        arch::without_interrupts(|| self.extent.lock().allocated_size())
    }

    /// Creates an unloaded mapping.
    ///
    /// Only per-mapping storage is allocated; neither the address space nor the binder
    /// is touched.
    pub fn create(&self, params: MapParams) -> Result<Mapping, DmaError> {
        params.validate()?;
        let runs = self.backend.create_raw_mapping(&params)?;
        Mapping::new(params, runs)
    }

    /// Destroys a mapping, unloading it first if it is still loaded.
    pub fn destroy(&self, mut mapping: Mapping) {
        if mapping.is_loaded() {
            self.unload(&mut mapping);
        }
        let runs = mem::take(&mut mapping.runs);
        self.backend.destroy_raw_mapping(runs);
    }

    /// Raises the alignment of spans reserved for `mapping`.
    ///
    /// Alignments below one page are ignored.
    pub fn set_alignment(&self, mapping: &mut Mapping, align: u64) -> Result<(), DmaError> {
        if !align.is_power_of_two() {
            return Err(DmaError::InvalidArgument);
        }
        if align < PAGE_SIZE as u64 {
            return Ok(());
        }
        mapping.align = align;
        Ok(())
    }

    /// Loads `buffer` into `mapping`.
    ///
    /// # Panics
    ///
    /// Panics if the mapping is already loaded.
    pub fn load(&self, mapping: &mut Mapping, buffer: Buffer<'_>) -> Result<(), DmaError> {
        assert!(
            !mapping.is_loaded(),
            "{}: load of a mapping that is already loaded",
            self.name
        );

        let Some(len) = buffer.len() else {
            log::debug!("{}: buffer length overflows", self.name);
            return Err(DmaError::InvalidArgument);
        };
        if len == 0 || len > mapping.params.max_size {
            log::debug!(
                "{}: cannot load {} into a mapping of at most {}",
                self.name,
                HumanSize::from(len),
                HumanSize::from(mapping.params.max_size)
            );
            return Err(DmaError::InvalidArgument);
        }

        let result = self
            .backend
            .load_raw(&buffer, &mut mapping.runs)
            .and_then(|()| self.map_runs(mapping));
        if let Err(err) = result {
            self.backend.unload_raw(&mut mapping.runs);
            return Err(err);
        }

        mapping.kind = buffer.kind();
        mapping.owner = buffer.context().map(|context| context.id());
        mapping.linear_base = match buffer {
            Buffer::Linear { base, .. } => Some(base),
            _ => None,
        };
        mapping.mapped_len = len;
        mapping.state = MapState::Loaded;

        log::trace!(
            "{}: loaded {:?} in {} segments",
            self.name,
            buffer,
            mapping.segments.len()
        );
        Ok(())
    }

    /// Loads a virtually contiguous buffer.
    pub fn load_linear(
        &self,
        mapping: &mut Mapping,
        base: VirtualAddress,
        len: usize,
        context: &dyn AddressContext,
    ) -> Result<(), DmaError> {
        self.load(mapping, Buffer::Linear { base, len, context })
    }

    /// Loads a chain of fragments.
    pub fn load_chain(
        &self,
        mapping: &mut Mapping,
        fragments: &[Fragment],
        context: &dyn AddressContext,
    ) -> Result<(), DmaError> {
        self.load(mapping, Buffer::Chain { fragments, context })
    }

    /// Loads a scatter list. Only kernel contexts are supported.
    pub fn load_scatter(
        &self,
        mapping: &mut Mapping,
        iov: &[IoVec],
        context: &dyn AddressContext,
    ) -> Result<(), DmaError> {
        self.load(mapping, Buffer::Scatter { iov, context })
    }

    /// Loads physical memory, typically from [`alloc_dma_memory`](Self::alloc_dma_memory).
    pub fn load_raw(&self, mapping: &mut Mapping, segs: &[RawSegment]) -> Result<(), DmaError> {
        self.load(mapping, Buffer::Raw(segs))
    }

    /// Unloads `mapping`, returning its span to the aperture.
    ///
    /// Unloading a mapping that is not loaded does nothing.
    pub fn unload(&self, mapping: &mut Mapping) {
        if !mapping.is_loaded() {
            log::trace!("{}: unload of a mapping that is not loaded", self.name);
            return;
        }
        self.unmap(mapping);
        self.backend.unload_raw(&mut mapping.runs);
        mapping.reset();
    }

    /// Allocates physically contiguous DMA memory.
    ///
    /// The alignment and boundary are also recorded on the tag and constrain every later
    /// load: the boundary replaces the mapping's own unless it is zero, and the alignment
    /// raises the mapping's own.
    pub fn alloc_dma_memory(
        &self,
        size: usize,
        align: usize,
        boundary: usize,
    ) -> Result<RawSegment, DmaError> {
        if (align != 0 && !align.is_power_of_two())
            || (boundary != 0 && !boundary.is_power_of_two())
        {
            return Err(DmaError::InvalidArgument);
        }
        self.align.store(align as u64, Ordering::Relaxed);
        self.boundary.store(boundary as u64, Ordering::Relaxed);
        self.backend.alloc_dma_memory(size, align, boundary)
    }

    /// Frees memory returned by [`alloc_dma_memory`](Self::alloc_dma_memory).
    pub fn free_dma_memory(&self, memory: RawSegment) -> Result<(), DmaError> {
        self.backend.free_dma_memory(memory)
    }

    /// Synchronizes CPU caches for part of a loaded buffer.
    ///
    /// Does nothing if no hook is installed.
    pub fn sync(
        &self,
        mapping: &Mapping,
        offset: usize,
        len: usize,
        ops: SyncOps,
    ) -> Result<(), DmaError> {
        match &self.sync {
            Some(hook) => hook.sync(mapping, offset, len, ops),
            None => Ok(()),
        }
    }

    /// Unbinds every page of the aperture and hands back the binder and backend.
    pub fn teardown(self) -> (B, D) {
        let outstanding = self.outstanding();
        if outstanding != 0 {
            log::warn!(
                "{}: torn down with {} of DVMA space still loaded",
                self.name,
                HumanSize(outstanding)
            );
        }

        let pages = self.size() / PAGE_SIZE as u64;
        for page in 0..pages {
            self.binder
                .unbind_page(self.start + (page as usize) * PAGE_SIZE);
        }
        self.binder.flush_tlb();

        (self.binder, self.backend)
    }

    /// Records, reserves, binds and translates the runs of a mapping.
    ///
    /// On failure nothing stays reserved or bound and the registry is empty.
    fn map_runs(&self, mapping: &mut Mapping) -> Result<(), DmaError> {
        mapping.registry.clear();
        if let Err(err) = segment::record_pages(&mapping.runs, &mut mapping.registry) {
            mapping.registry.clear();
            return Err(err);
        }

        let boundary = self.effective_boundary(mapping);
        let align = self.effective_align(mapping);
        let size = mapping.registry.span_size();
        let span = match self.reserve(size, align, boundary, mapping.params.flags) {
            Ok(span) => span,
            Err(err) => {
                log::debug!(
                    "{}: no {} span (align {:#x}, boundary {:#x}) available",
                    self.name,
                    HumanSize(size),
                    align,
                    boundary
                );
                mapping.registry.clear();
                return Err(err);
            }
        };

        mapping
            .registry
            .assign(BusAddress::new(span.start()).page_number());
        mapping.span = Some(span);
        binder::bind_registry(&self.binder, &mapping.registry, mapping.params.flags);

        mapping.segments.reset(boundary);
        if let Err(err) =
            segment::build_segments(&mapping.runs, &mapping.registry, &mut mapping.segments)
        {
            self.unmap(mapping);
            return Err(err);
        }
        Ok(())
    }

    /// Unbinds a mapping's pages, releases its span and drops its segments.
    fn unmap(&self, mapping: &mut Mapping) {
        binder::unbind_registry(&self.binder, &mapping.registry);
        mapping.registry.clear();

        if let Some(span) = mapping.span.take() {
            if self.release(span).is_err() {
                log::warn!(
                    "{}: {} of DVMA space lost",
                    self.name,
                    HumanSize(span.size())
                );
            }
        }

        mapping.segments.clear();
    }

    fn effective_boundary(&self, mapping: &Mapping) -> u64 {
        match self.boundary.load(Ordering::Relaxed) {
            0 => mapping.params.boundary,
            boundary => boundary,
        }
    }

    fn effective_align(&self, mapping: &Mapping) -> u64 {
        self.align
            .load(Ordering::Relaxed)
            .max(mapping.align)
            .max(PAGE_SIZE as u64)
    }

    fn reserve(
        &self,
        size: u64,
        align: u64,
        boundary: u64,
        flags: MapFlags,
    ) -> Result<Span, DmaError> {
        arch::without_interrupts(|| {
            let mut extent = self.extent.lock();
            let window = flags
                .is_low_window()
                .then(|| extent.start()..=LOW_WINDOW_END);
            extent.reserve(size, align, boundary, window)
        })
    }

    fn release(&self, span: Span) -> Result<(), DmaError> {
        arch::without_interrupts(|| self.extent.lock().release(span))
    }
}
