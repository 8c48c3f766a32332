//! Mapping handles.
//!
//! A [`Mapping`] is created by [`SgDma::create`](crate::SgDma::create) and owns everything
//! one buffer binding needs: the page registry, the physical runs of the loaded buffer,
//! and the translated segments. It does not own its span of aperture space; that is
//! borrowed from the tag between load and unload.

use alloc::vec::Vec;

use crate::{
    BufferKind, ContextId, DmaError, HumanSize, MapFlags, PageRegistry, RawSegment, Segment,
    SegmentList, Span, VirtualAddress, arch::PAGE_SIZE,
};

/// Limits a mapping is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapParams {
    /// Largest buffer the mapping can be loaded with, in bytes.
    pub max_size: usize,
    /// Largest number of segments a load may produce.
    pub max_segments: usize,
    /// Largest single segment, in bytes.
    pub max_segsz: usize,
    /// Power of two no segment may cross, or 0.
    pub boundary: u64,
    pub flags: MapFlags,
}

impl MapParams {
    /// Creates parameters with no boundary and no flags.
    pub const fn new(max_size: usize, max_segments: usize, max_segsz: usize) -> Self {
        Self {
            max_size,
            max_segments,
            max_segsz,
            boundary: 0,
            flags: MapFlags::empty(),
        }
    }

    pub const fn with_boundary(mut self, boundary: u64) -> Self {
        self.boundary = boundary;
        self
    }

    pub const fn with_flags(mut self, flags: MapFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Checks that the limits describe a mapping that can ever be loaded.
    pub fn validate(&self) -> Result<(), DmaError> {
        if self.max_size == 0 || self.max_segments == 0 || self.max_segsz == 0 {
            return Err(DmaError::InvalidArgument);
        }
        if self.boundary != 0 && !self.boundary.is_power_of_two() {
            return Err(DmaError::InvalidArgument);
        }
        Ok(())
    }
}

/// Lifecycle state of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    /// Holds no buffer, no span and no bindings.
    Created,
    /// Holds a bound span and translated segments.
    Loaded,
}

/// One logical buffer binding.
pub struct Mapping {
    pub(crate) params: MapParams,
    /// Alignment of the span, at least one page.
    pub(crate) align: u64,
    pub(crate) state: MapState,
    pub(crate) registry: PageRegistry,
    /// Physical runs of the loaded buffer, in buffer order, none crossing a page.
    pub(crate) runs: Vec<RawSegment>,
    pub(crate) segments: SegmentList,
    pub(crate) span: Option<Span>,
    pub(crate) kind: BufferKind,
    pub(crate) linear_base: Option<VirtualAddress>,
    pub(crate) owner: Option<ContextId>,
    pub(crate) mapped_len: usize,
}

impl Mapping {
    pub(crate) fn new(params: MapParams, runs: Vec<RawSegment>) -> Result<Self, DmaError> {
        params.validate()?;
        Ok(Self {
            params,
            align: PAGE_SIZE as u64,
            state: MapState::Created,
            registry: PageRegistry::for_map_size(params.max_size),
            runs,
            segments: SegmentList::new(params.max_segments, params.max_segsz, params.boundary)?,
            span: None,
            kind: BufferKind::Unbound,
            linear_base: None,
            owner: None,
            mapped_len: 0,
        })
    }

    /// Forgets everything recorded by a load and returns to [`MapState::Created`].
    ///
    /// Bindings and the span must already have been torn down.
    pub(crate) fn reset(&mut self) {
        self.registry.clear();
        self.runs.clear();
        self.segments.clear();
        self.span = None;
        self.kind = BufferKind::Unbound;
        self.linear_base = None;
        self.owner = None;
        self.mapped_len = 0;
        self.state = MapState::Created;
    }

    pub fn params(&self) -> &MapParams {
        &self.params
    }

    pub fn state(&self) -> MapState {
        self.state
    }

    /// Returns true if the mapping currently holds a buffer.
    pub fn is_loaded(&self) -> bool {
        self.state == MapState::Loaded
    }

    /// Returns the alignment the next span will be reserved with.
    pub fn alignment(&self) -> u64 {
        self.align
    }

    pub fn flags(&self) -> MapFlags {
        self.params.flags
    }

    /// Returns true if the device snoops the CPU caches for this mapping.
    pub fn is_coherent(&self) -> bool {
        self.params.flags.is_coherent()
    }

    /// Returns the translated segments; empty unless loaded.
    pub fn segments(&self) -> &[Segment] {
        self.segments.as_slice()
    }

    /// Returns the length of the loaded buffer in bytes.
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    /// Returns the span of aperture space the buffer is bound to.
    pub fn span(&self) -> Option<Span> {
        self.span
    }

    /// Returns the shape of the loaded buffer.
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Returns the address context that owns the loaded buffer, if it has one.
    pub fn owner(&self) -> Option<ContextId> {
        self.owner
    }

    /// Returns the virtual base of a loaded linear buffer.
    pub fn linear_base(&self) -> Option<VirtualAddress> {
        self.linear_base
    }

    /// Returns the physical runs of the loaded buffer, in buffer order.
    pub fn physical_runs(&self) -> &[RawSegment] {
        &self.runs
    }

    pub fn registry(&self) -> &PageRegistry {
        &self.registry
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Some(span) = self.span {
            log::error!(
                "mapping dropped while loaded: {} of DVMA space at {:#x} lost",
                HumanSize(span.size()),
                span.start()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_builder() {
        let params = MapParams::new(0x10_000, 4, PAGE_SIZE)
            .with_boundary(0x1_0000)
            .with_flags(MapFlags::COHERENT);
        assert_eq!(params.boundary, 0x1_0000);
        assert!(params.flags.is_coherent());
        assert_eq!(params.validate(), Ok(()));
    }

    #[test]
    fn params_validation() {
        assert_eq!(
            MapParams::new(0, 1, PAGE_SIZE).validate(),
            Err(DmaError::InvalidArgument)
        );
        assert_eq!(
            MapParams::new(PAGE_SIZE, 0, PAGE_SIZE).validate(),
            Err(DmaError::InvalidArgument)
        );
        assert_eq!(
            MapParams::new(PAGE_SIZE, 1, 0).validate(),
            Err(DmaError::InvalidArgument)
        );
        assert_eq!(
            MapParams::new(PAGE_SIZE, 1, PAGE_SIZE)
                .with_boundary(0x1800)
                .validate(),
            Err(DmaError::InvalidArgument)
        );
    }

    #[test]
    fn new_mapping_is_empty() {
        let mapping = Mapping::new(MapParams::new(8 * PAGE_SIZE, 4, PAGE_SIZE), Vec::new()).unwrap();
        assert_eq!(mapping.state(), MapState::Created);
        assert!(!mapping.is_loaded());
        assert_eq!(mapping.kind(), BufferKind::Unbound);
        assert_eq!(mapping.alignment(), PAGE_SIZE as u64);
        assert!(mapping.segments().is_empty());
        assert_eq!(mapping.mapped_len(), 0);
        assert_eq!(mapping.span(), None);
        assert_eq!(mapping.registry().capacity(), 16);
    }

    #[test]
    fn registry_sized_from_max_size() {
        let mapping =
            Mapping::new(MapParams::new(100 * PAGE_SIZE, 4, PAGE_SIZE), Vec::new()).unwrap();
        assert_eq!(mapping.registry().capacity(), 104);
    }
}
