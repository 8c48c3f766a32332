//! Linear address-space allocator.
//!
//! This module manages one bounded extent of integer addresses, in the spirit of the BSD
//! `extent(9)` allocator. [`SgDma`](crate::SgDma) uses it to carve device-virtual spans
//! out of the aperture, and [`DirectBackend`](crate::DirectBackend) uses it to hand out
//! physically contiguous DMA memory.
//!
//! Live spans are kept in a list sorted by start address. Released spans are not
//! coalesced with anything: a release has to name exactly the span that was reserved.

use alloc::vec::Vec;
use core::ops::RangeInclusive;

use crate::{DmaError, arch::PAGE_SIZE};

/// Highest address reachable by devices limited to 24-bit DMA.
pub const LOW_WINDOW_END: u64 = 0xff_ffff;

/// A contiguous range of addresses reserved from an [`Extent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    start: u64,
    size: u64,
}

impl Span {
    /// Creates a new span.
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// Returns the first address of this span.
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Returns the size of this span in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns the last address (inclusive) of this span.
    pub const fn last(&self) -> u64 {
        self.start + (self.size - 1)
    }

    /// Returns true if this span overlaps with another span.
    pub const fn overlaps(&self, other: &Span) -> bool {
        self.start <= other.last() && other.start <= self.last()
    }

    /// Returns true if this span contains the given address.
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.last()
    }
}

/// A bounded, linear address space from which aligned spans are reserved.
///
/// The extent does no locking of its own; owners wrap it in a `spin::Mutex` and hold
/// the lock only for the duration of one reserve or release.
#[derive(Debug)]
pub struct Extent {
    /// First address managed by this extent.
    start: u64,
    /// Last address (inclusive) managed by this extent.
    end: u64,
    /// Live spans, sorted by start address, never overlapping.
    spans: Vec<Span>,
}

impl Extent {
    /// Creates an extent covering `size` bytes starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or the range would wrap around the address space.
    pub fn new(start: u64, size: u64) -> Self {
        assert!(size != 0, "extent must not be empty");
        let end = start
            .checked_add(size - 1)
            .expect("extent wraps around the address space");
        Self {
            start,
            end,
            spans: Vec::new(),
        }
    }

    /// Returns the first address of the extent.
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Returns the last address (inclusive) of the extent.
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Returns the total size of the extent in bytes.
    pub const fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Reserves `size` bytes aligned to `align`.
    ///
    /// The alignment is raised to at least one page. A non-zero `boundary` keeps the span
    /// from crossing any multiple of `boundary`, unless the span is larger than the
    /// boundary, in which case the constraint is dropped and left to the segment builder.
    /// `window` restricts the search to an inclusive sub-range of the extent.
    ///
    /// Uses a first-fit search in address order.
    pub fn reserve(
        &mut self,
        size: u64,
        align: u64,
        boundary: u64,
        window: Option<RangeInclusive<u64>>,
    ) -> Result<Span, DmaError> {
        if size == 0 || size % PAGE_SIZE as u64 != 0 {
            return Err(DmaError::InvalidArgument);
        }
        if !align.is_power_of_two() || (boundary != 0 && !boundary.is_power_of_two()) {
            return Err(DmaError::InvalidArgument);
        }

        let align = align.max(PAGE_SIZE as u64);
        let boundary = if size > boundary { 0 } else { boundary };

        let (lo, hi) = match window {
            Some(window) => (
                self.start.max(*window.start()),
                self.end.min(*window.end()),
            ),
            None => (self.start, self.end),
        };
        if lo > hi {
            return Err(DmaError::AddressSpaceExhausted);
        }

        let start = self
            .find_free(lo, hi, size, align, boundary)
            .ok_or(DmaError::AddressSpaceExhausted)?;

        let span = Span::new(start, size);
        let index = self.spans.partition_point(|s| s.start < start);
        self.spans.insert(index, span);
        Ok(span)
    }

    /// Releases a span previously returned by [`reserve`](Self::reserve).
    ///
    /// Returns [`DmaError::NotFound`] if no live span matches exactly; the extent is left
    /// untouched in that case.
    pub fn release(&mut self, span: Span) -> Result<(), DmaError> {
        let index = self
            .spans
            .binary_search_by_key(&span.start, |s| s.start)
            .map_err(|_| DmaError::NotFound)?;

        if self.spans[index].size != span.size {
            return Err(DmaError::NotFound);
        }

        self.spans.remove(index);
        Ok(())
    }

    /// Returns the number of live spans.
    pub fn allocated_spans(&self) -> usize {
        self.spans.len()
    }

    /// Returns the total number of bytes held by live spans.
    pub fn allocated_size(&self) -> u64 {
        self.spans.iter().map(|s| s.size).sum()
    }

    /// Returns the number of bytes not held by any live span.
    pub fn free_size(&self) -> u64 {
        self.size() - self.allocated_size()
    }

    /// Walks the gaps between live spans inside `[lo, hi]` and returns the first start
    /// address where the request fits.
    fn find_free(&self, lo: u64, hi: u64, size: u64, align: u64, boundary: u64) -> Option<u64> {
        let mut cursor = lo;

        for span in &self.spans {
            if span.last() < cursor {
                continue;
            }
            if span.start > hi {
                break;
            }

            if span.start > cursor {
                if let Some(start) = Self::fit(cursor, span.start - 1, size, align, boundary) {
                    return Some(start);
                }
            }

            cursor = span.last().checked_add(1)?;
            if cursor > hi {
                return None;
            }
        }

        Self::fit(cursor, hi, size, align, boundary)
    }

    /// Places a request inside the gap `[lo, hi]`, honoring alignment and boundary.
    fn fit(lo: u64, hi: u64, size: u64, align: u64, boundary: u64) -> Option<u64> {
        let mut start = align_up(lo, align)?;

        if boundary != 0 {
            let last = start.checked_add(size - 1)?;
            if start / boundary != last / boundary {
                start = align_up(start, boundary.max(align))?;
            }
        }

        let last = start.checked_add(size - 1)?;
        (last <= hi).then_some(start)
    }
}

/// Rounds `value` up to a multiple of the power-of-two `align`, or `None` on overflow.
fn align_up(value: u64, align: u64) -> Option<u64> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}
