//! Segment building.
//!
//! Loading a buffer takes two passes over the same physical runs:
//!
//! 1. [`record_pages`] inserts every page the runs touch into the mapping's registry, so
//!    the size of the device-virtual span is known.
//! 2. Once the span is reserved and bound, [`build_segments`] translates each run to its
//!    bus address and appends it to the mapping's [`SegmentList`], which merges
//!    device-contiguous runs and splits at boundaries.

use alloc::vec::Vec;

use crate::{BusAddress, DmaError, PageRegistry, RawSegment, arch::PAGE_SIZE};

/// One bus-contiguous run handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    addr: BusAddress,
    len: usize,
}

impl Segment {
    /// Creates a segment.
    pub const fn new(addr: BusAddress, len: usize) -> Self {
        Self { addr, len }
    }

    /// Returns the first bus address of this segment.
    pub const fn addr(&self) -> BusAddress {
        self.addr
    }

    /// Returns the length of this segment in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the segment is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the bus address one past the end of this segment.
    pub fn end(&self) -> BusAddress {
        self.addr + self.len
    }
}

/// The translated segments of one mapping, with the limits they must respect.
#[derive(Debug)]
pub struct SegmentList {
    segs: Vec<Segment>,
    max_segments: usize,
    max_segsz: usize,
    boundary: u64,
}

impl SegmentList {
    /// Creates an empty list holding at most `max_segments` segments of at most
    /// `max_segsz` bytes each, none crossing a multiple of `boundary` (0 for none).
    pub fn new(max_segments: usize, max_segsz: usize, boundary: u64) -> Result<Self, DmaError> {
        if max_segments == 0 || max_segsz == 0 {
            return Err(DmaError::InvalidArgument);
        }
        if boundary != 0 && !boundary.is_power_of_two() {
            return Err(DmaError::InvalidArgument);
        }

        let mut segs = Vec::new();
        segs.try_reserve_exact(max_segments)
            .map_err(|_| DmaError::OutOfMemory)?;
        Ok(Self {
            segs,
            max_segments,
            max_segsz,
            boundary,
        })
    }

    /// Empties the list and sets the boundary for the next load.
    ///
    /// # Panics
    ///
    /// Panics if `boundary` is neither zero nor a power of two.
    pub fn reset(&mut self, boundary: u64) {
        assert!(
            boundary == 0 || boundary.is_power_of_two(),
            "boundary must be a power of two"
        );
        self.segs.clear();
        self.boundary = boundary;
    }

    /// Empties the list.
    pub fn clear(&mut self) {
        self.segs.clear();
    }

    /// Returns the segments built so far.
    pub fn as_slice(&self) -> &[Segment] {
        &self.segs
    }

    /// Returns the number of segments.
    pub fn len(&self) -> usize {
        self.segs.len()
    }

    /// Returns true if there are no segments.
    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    /// Returns the number of bytes covered by all segments.
    pub fn total_len(&self) -> usize {
        self.segs.iter().map(Segment::len).sum()
    }

    /// Returns the boundary segments may not cross (0 for none).
    pub fn boundary(&self) -> u64 {
        self.boundary
    }

    /// Appends `len` bytes at `addr`.
    ///
    /// The range is cut at every boundary multiple. Each piece extends the last segment
    /// when it starts exactly where that segment ends, both lie in the same boundary
    /// block, and the whole merged segment stays within the maximum segment size.
    /// Otherwise the piece opens a new segment, split further at the maximum segment
    /// size if needed. A last segment is never partially filled.
    ///
    /// Fails with [`DmaError::TooManySegments`] if that would need more segments than
    /// allowed; the segments appended before the failure are kept.
    pub fn append_range(&mut self, addr: BusAddress, len: usize) -> Result<(), DmaError> {
        let mut addr = addr;
        let mut remaining = len;

        while remaining > 0 {
            let room = self.room_before_boundary(addr);

            if let Some(last) = self.segs.last_mut() {
                let chunk = remaining.min(room);
                let contiguous = last.end() == addr;
                let same_block = self.boundary == 0
                    || last.addr.as_u64() / self.boundary == addr.as_u64() / self.boundary;
                let fits = last
                    .len
                    .checked_add(chunk)
                    .is_some_and(|merged| merged <= self.max_segsz);
                if contiguous && same_block && fits {
                    last.len += chunk;
                    addr = addr + chunk;
                    remaining -= chunk;
                    continue;
                }
            }

            if self.segs.len() >= self.max_segments {
                return Err(DmaError::TooManySegments);
            }
            let chunk = remaining.min(self.max_segsz).min(room);
            self.segs.push(Segment::new(addr, chunk));
            addr = addr + chunk;
            remaining -= chunk;
        }

        Ok(())
    }

    /// Returns how many bytes starting at `addr` fit before the next boundary multiple.
    fn room_before_boundary(&self, addr: BusAddress) -> usize {
        if self.boundary == 0 {
            return usize::MAX;
        }
        match addr.next_boundary(self.boundary) {
            Some(next) => usize::try_from(next - addr).unwrap_or(usize::MAX),
            None => usize::MAX,
        }
    }
}

/// Sizing pass: records every page touched by `runs` in `registry`.
///
/// Stops at the first page the registry cannot take.
pub(crate) fn record_pages(runs: &[RawSegment], registry: &mut PageRegistry) -> Result<(), DmaError> {
    for run in runs.iter().filter(|run| run.len != 0) {
        debug_assert!(
            run.addr.page_offset() + run.len <= PAGE_SIZE,
            "run of {:#x} bytes at {} crosses a page",
            run.len,
            run.addr
        );
        registry.insert(run.addr).inspect_err(|_| {
            log::debug!(
                "page {} does not fit in a registry of {} pages",
                run.addr.page_base(),
                registry.capacity()
            );
        })?;
    }
    Ok(())
}

/// Emission pass: translates `runs` through the bound `registry` into `segments`.
pub(crate) fn build_segments(
    runs: &[RawSegment],
    registry: &PageRegistry,
    segments: &mut SegmentList,
) -> Result<(), DmaError> {
    for run in runs.iter().filter(|run| run.len != 0) {
        let Some(bus) = registry.translate(run.addr) else {
            log::error!("physical address {} was never bound", run.addr);
            return Err(DmaError::InvalidArgument);
        };
        segments.append_range(bus, run.len)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PageNumber, PhysicalAddress, arch::PAGE_SIZE};

    const PAGE: usize = PAGE_SIZE;

    fn bus(addr: u64) -> BusAddress {
        BusAddress::new(addr)
    }

    fn segs(list: &SegmentList) -> Vec<(u64, usize)> {
        list.as_slice()
            .iter()
            .map(|s| (s.addr().as_u64(), s.len()))
            .collect()
    }

    mod append_range {
        use super::*;

        #[test]
        fn contiguous_ranges_merge() {
            let mut list = SegmentList::new(4, usize::MAX, 0).unwrap();
            list.append_range(bus(0x1000), PAGE).unwrap();
            list.append_range(bus(0x2000), PAGE).unwrap();
            list.append_range(bus(0x3000), 0x10).unwrap();
            assert_eq!(segs(&list), [(0x1000, 2 * PAGE + 0x10)]);
        }

        #[test]
        fn gap_opens_new_segment() {
            let mut list = SegmentList::new(4, usize::MAX, 0).unwrap();
            list.append_range(bus(0x1000), 0x100).unwrap();
            list.append_range(bus(0x1200), 0x100).unwrap();
            assert_eq!(segs(&list), [(0x1000, 0x100), (0x1200, 0x100)]);
        }

        #[test]
        fn zero_length_is_skipped() {
            let mut list = SegmentList::new(1, usize::MAX, 0).unwrap();
            list.append_range(bus(0x1000), 0).unwrap();
            assert!(list.is_empty());
        }

        #[test]
        fn merge_respects_max_segment_size() {
            let mut list = SegmentList::new(4, 0x1800, 0).unwrap();
            list.append_range(bus(0x1000), PAGE).unwrap();
            list.append_range(bus(0x2000), PAGE).unwrap();
            assert_eq!(segs(&list), [(0x1000, PAGE), (0x2000, PAGE)]);
        }

        #[test]
        fn large_range_split_by_max_segment_size() {
            let mut list = SegmentList::new(8, 0x1000, 0).unwrap();
            list.append_range(bus(0x10_0800), 0x2800).unwrap();
            assert_eq!(
                segs(&list),
                [(0x10_0800, 0x1000), (0x10_1800, 0x1000), (0x10_2800, 0x800)]
            );
        }

        #[test]
        fn range_split_at_boundary() {
            let mut list = SegmentList::new(4, usize::MAX, 0x2000).unwrap();
            list.append_range(bus(0x1800), 0x1000).unwrap();
            assert_eq!(segs(&list), [(0x1800, 0x800), (0x2000, 0x800)]);
        }

        #[test]
        fn no_merge_across_boundary() {
            let mut list = SegmentList::new(4, usize::MAX, 0x2000).unwrap();
            list.append_range(bus(0x1000), PAGE).unwrap();
            list.append_range(bus(0x2000), PAGE).unwrap();
            list.append_range(bus(0x3000), PAGE).unwrap();
            assert_eq!(segs(&list), [(0x1000, PAGE), (0x2000, 2 * PAGE)]);
        }

        #[test]
        fn too_many_segments() {
            let mut list = SegmentList::new(2, usize::MAX, 0).unwrap();
            list.append_range(bus(0x1000), 0x10).unwrap();
            list.append_range(bus(0x3000), 0x10).unwrap();
            assert_eq!(
                list.append_range(bus(0x5000), 0x10),
                Err(DmaError::TooManySegments)
            );
            // Merging into the last segment still works when full.
            list.append_range(bus(0x3010), 0x10).unwrap();
            assert_eq!(segs(&list), [(0x1000, 0x10), (0x3000, 0x20)]);
        }

        #[test]
        fn boundary_split_counts_against_limit() {
            let mut list = SegmentList::new(1, usize::MAX, 0x1000).unwrap();
            assert_eq!(
                list.append_range(bus(0x0800), 0x1000),
                Err(DmaError::TooManySegments)
            );
        }

        #[test]
        fn boundary_law_holds_for_every_segment() {
            let boundary = 0x4000u64;
            let mut list = SegmentList::new(64, 0x3000, boundary).unwrap();
            let mut addr = 0x1_0200u64;
            for len in [0x1e00usize, 0x2000, 0x5000, 0x10, 0x3ff0] {
                list.append_range(bus(addr), len).unwrap();
                addr += len as u64;
            }
            assert_eq!(list.total_len(), 0x1e00 + 0x2000 + 0x5000 + 0x10 + 0x3ff0);
            for seg in list.as_slice() {
                let first = seg.addr().as_u64();
                let last = first + seg.len() as u64 - 1;
                assert_eq!(first / boundary, last / boundary, "{:?} crosses", seg);
                assert!(seg.len() <= 0x3000);
            }
        }

        #[test]
        fn reset_applies_new_boundary() {
            let mut list = SegmentList::new(4, usize::MAX, 0).unwrap();
            list.append_range(bus(0x1800), 0x1000).unwrap();
            assert_eq!(list.len(), 1);

            list.reset(0x2000);
            assert!(list.is_empty());
            assert_eq!(list.boundary(), 0x2000);
            list.append_range(bus(0x1800), 0x1000).unwrap();
            assert_eq!(list.len(), 2);
        }
    }

    #[test]
    fn rejects_bad_limits() {
        assert_eq!(
            SegmentList::new(0, PAGE, 0).err(),
            Some(DmaError::InvalidArgument)
        );
        assert_eq!(
            SegmentList::new(1, 0, 0).err(),
            Some(DmaError::InvalidArgument)
        );
        assert_eq!(
            SegmentList::new(1, PAGE, 0x3000).err(),
            Some(DmaError::InvalidArgument)
        );
    }

    mod passes {
        use super::*;

        fn run(pa: u64, len: usize) -> RawSegment {
            RawSegment::new(PhysicalAddress::new(pa), len)
        }

        #[test]
        fn physically_scattered_pages_merge_when_bus_contiguous() {
            let runs = [run(0x9_0000, PAGE), run(0x3_0000, PAGE)];
            let mut registry = PageRegistry::with_capacity(16);
            record_pages(&runs, &mut registry).unwrap();
            assert_eq!(registry.len(), 2);

            registry.assign(PageNumber::new(0x100));
            let mut list = SegmentList::new(4, usize::MAX, 0).unwrap();
            build_segments(&runs, &registry, &mut list).unwrap();
            assert_eq!(segs(&list), [(0x10_0000, 2 * PAGE)]);
        }

        #[test]
        fn revisited_page_breaks_contiguity() {
            let runs = [run(0x9_0000, 0x100), run(0x3_0000, 0x100), run(0x9_0100, 0x100)];
            let mut registry = PageRegistry::with_capacity(16);
            record_pages(&runs, &mut registry).unwrap();
            assert_eq!(registry.len(), 2);

            registry.assign(PageNumber::new(0x100));
            let mut list = SegmentList::new(4, usize::MAX, 0).unwrap();
            build_segments(&runs, &registry, &mut list).unwrap();
            assert_eq!(
                segs(&list),
                [(0x10_0000, 0x100), (0x10_1000, 0x100), (0x10_0100, 0x100)]
            );
        }

        #[test]
        #[cfg(debug_assertions)]
        #[should_panic(expected = "crosses a page")]
        fn run_crossing_a_page_is_rejected() {
            let runs = [run(0x9_0800, PAGE)];
            let mut registry = PageRegistry::with_capacity(16);
            let _ = record_pages(&runs, &mut registry);
        }

        #[test]
        fn sizing_stops_at_capacity() {
            let runs: Vec<_> = (0..3).map(|i| run(i * PAGE as u64, PAGE)).collect();
            let mut registry = PageRegistry::with_capacity(2);
            assert_eq!(
                record_pages(&runs, &mut registry),
                Err(DmaError::TooManyPages)
            );
        }

        #[test]
        fn emission_before_binding_fails() {
            let runs = [run(0x1000, 0x10)];
            let mut registry = PageRegistry::with_capacity(2);
            record_pages(&runs, &mut registry).unwrap();
            let mut list = SegmentList::new(1, usize::MAX, 0).unwrap();
            assert_eq!(
                build_segments(&runs, &registry, &mut list),
                Err(DmaError::InvalidArgument)
            );
        }
    }
}
