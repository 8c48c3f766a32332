//! Per-mapping physical page registry.
//!
//! Every mapping owns one registry recording the distinct physical frames its buffer
//! touches. Once the mapping has a device-virtual span, each frame is assigned one
//! aperture page of that span, in the order the frames were first seen.
//!
//! Storage is a fixed arena of entries in insertion order plus an index sorted by frame
//! number. Both are allocated once, when the mapping is created; loading, unloading
//! and reloading a mapping never allocates.

use alloc::boxed::Box;
use alloc::vec;

use crate::{BusAddress, DmaError, FrameNumber, PageNumber, PhysicalAddress, arch::PAGE_SIZE};

/// Extra registry slots beyond the mapping's page count, for heavily fragmented buffers
/// whose pieces straddle more pages than their total size suggests.
pub const REGISTRY_SLACK: usize = 4;

/// Smallest registry ever created.
pub const REGISTRY_MIN_PAGES: usize = 16;

/// One physical frame and the aperture page it is bound to, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageEntry {
    frame: FrameNumber,
    page: Option<PageNumber>,
}

impl PageEntry {
    const EMPTY: Self = Self {
        frame: FrameNumber::new(0),
        page: None,
    };
}

/// An ordered set of the physical pages touched by one mapping.
pub struct PageRegistry {
    /// Entries in insertion order; only the first `len` are live.
    entries: Box<[PageEntry]>,
    /// Indices into `entries`, sorted by frame number; only the first `len` are live.
    index: Box<[usize]>,
    /// Number of live entries.
    len: usize,
    /// First aperture page of the bound span.
    base: Option<PageNumber>,
}

impl PageRegistry {
    /// Creates a registry holding at most `capacity` distinct pages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: vec![PageEntry::EMPTY; capacity].into_boxed_slice(),
            index: vec![0; capacity].into_boxed_slice(),
            len: 0,
            base: None,
        }
    }

    /// Creates a registry sized for a mapping of at most `max_size` bytes.
    pub fn for_map_size(max_size: usize) -> Self {
        let pages = max_size.div_ceil(PAGE_SIZE);
        Self::with_capacity((pages + REGISTRY_SLACK).max(REGISTRY_MIN_PAGES))
    }

    /// Returns the maximum number of distinct pages this registry can hold.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Returns the number of distinct pages recorded.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no pages are recorded.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if the pages have been assigned aperture pages.
    pub fn is_bound(&self) -> bool {
        self.base.is_some()
    }

    /// Returns the size in bytes of the span needed to map every recorded page.
    pub fn span_size(&self) -> u64 {
        (self.len * PAGE_SIZE) as u64
    }

    /// Forgets every recorded page and any assignment.
    pub fn clear(&mut self) {
        self.len = 0;
        self.base = None;
    }

    /// Records the page containing `phys`.
    ///
    /// Recording a page that is already present is a no-op. Once the registry is full,
    /// only pages already present are accepted; a new page fails with
    /// [`DmaError::TooManyPages`].
    pub fn insert(&mut self, phys: PhysicalAddress) -> Result<(), DmaError> {
        let frame = phys.frame_number();

        let pos = match self.search(frame) {
            Ok(_) => return Ok(()),
            Err(pos) => pos,
        };

        if self.len >= self.capacity() {
            return Err(DmaError::TooManyPages);
        }

        self.entries[self.len] = PageEntry { frame, page: None };
        self.index.copy_within(pos..self.len, pos + 1);
        self.index[pos] = self.len;
        self.len += 1;
        Ok(())
    }

    /// Returns true if the page containing `phys` has been recorded.
    pub fn contains(&self, phys: PhysicalAddress) -> bool {
        self.search(phys.frame_number()).is_ok()
    }

    /// Assigns consecutive aperture pages, starting at `base`, to the recorded pages in
    /// insertion order.
    pub fn assign(&mut self, base: PageNumber) {
        for (i, entry) in self.entries[..self.len].iter_mut().enumerate() {
            entry.page = Some(base + i as u64);
        }
        self.base = Some(base);
    }

    /// Translates a physical address to the bus address it is mapped at.
    ///
    /// Returns `None` if the page was never recorded or the registry is not bound yet.
    pub fn translate(&self, phys: PhysicalAddress) -> Option<BusAddress> {
        let slot = self.search(phys.frame_number()).ok()?;
        let page = self.entries[self.index[slot]].page?;
        Some(page.start() + phys.page_offset())
    }

    /// Iterates over the recorded pages in insertion order, with their assigned bus
    /// address if bound.
    pub fn iter(&self) -> impl Iterator<Item = (PhysicalAddress, Option<BusAddress>)> + '_ {
        self.entries[..self.len]
            .iter()
            .map(|entry| (entry.frame.start(), entry.page.map(PageNumber::start)))
    }

    /// Binary searches the sorted index for `frame`.
    fn search(&self, frame: FrameNumber) -> Result<usize, usize> {
        self.index[..self.len].binary_search_by_key(&frame, |&i| self.entries[i].frame)
    }
}
