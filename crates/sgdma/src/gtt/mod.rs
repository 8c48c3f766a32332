//! Graphics translation table (GTT) binder.
//!
//! The GTT is the page table behind an integrated graphics aperture: one 32-bit entry
//! per aperture page, reached through memory-mapped I/O. Entries that are not in use
//! point at a scribble page instead of being invalidated, so that speculative reads by
//! the device always land somewhere harmless.

mod entry;

pub use entry::GttEntry;

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{BusAddress, DmaError, MapFlags, PageBinder, PhysicalAddress, arch::PAGE_SIZE};

/// A graphics translation table covering one aperture.
pub struct Gtt {
    /// First entry of the table.
    table: NonNull<u32>,
    /// Number of entries, one per aperture page.
    entries: usize,
    /// Bus address translated by entry 0.
    aperture: BusAddress,
    /// Entry written into every unused slot.
    scribble: GttEntry,
    /// Index of the most recently written entry, read back on flush.
    last_written: AtomicUsize,
}

// SAFETY: the table is only accessed through single 32-bit volatile reads and writes,
// and every entry is owned by exactly one mapping at a time.
unsafe impl Send for Gtt {}
unsafe impl Sync for Gtt {}

impl Gtt {
    /// Creates a binder over `entries` translation entries starting at `table`.
    ///
    /// Entry `i` translates the aperture page at `aperture + i * PAGE_SIZE`. Unused
    /// entries are pointed at `scribble`. The table is left untouched; call
    /// [`scrub`](Self::scrub) to reset it.
    ///
    /// Fails with [`DmaError::InvalidArgument`] if the scribble page cannot be encoded
    /// in an entry, or if `aperture` is not page aligned.
    ///
    /// # Safety
    ///
    /// `table` must be valid for volatile reads and writes of `entries` consecutive
    /// `u32`s for as long as the returned `Gtt` exists, and nothing else may write to it
    /// in that time.
    pub unsafe fn new(
        table: NonNull<u32>,
        entries: usize,
        aperture: BusAddress,
        scribble: PhysicalAddress,
    ) -> Result<Self, DmaError> {
        if !aperture.is_aligned(PAGE_SIZE as u64) {
            return Err(DmaError::InvalidArgument);
        }
        let scribble = GttEntry::new(scribble, MapFlags::empty()).ok_or_else(|| {
            log::error!("gtt: scribble page {} cannot be encoded", scribble);
            DmaError::InvalidArgument
        })?;

        Ok(Self {
            table,
            entries,
            aperture,
            scribble,
            last_written: AtomicUsize::new(0),
        })
    }

    /// Returns the first bus address translated by this table.
    pub fn aperture_start(&self) -> BusAddress {
        self.aperture
    }

    /// Returns the size of the aperture in bytes.
    pub fn aperture_size(&self) -> u64 {
        (self.entries * PAGE_SIZE) as u64
    }

    /// Returns the number of translation entries.
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Returns true if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Reads back the entry translating `bus`.
    ///
    /// Returns `None` if `bus` lies outside the aperture.
    pub fn entry(&self, bus: BusAddress) -> Option<GttEntry> {
        let index = self.index(bus)?;
        // SAFETY: index is within the table, as checked by `index`.
        let raw = unsafe { self.table.add(index).read_volatile() };
        Some(GttEntry::from_u32(raw))
    }

    /// Points every entry at the scribble page and flushes.
    pub fn scrub(&self) {
        for index in 0..self.entries {
            self.write(index, self.scribble);
        }
        self.flush_tlb();
    }

    /// Returns the entry index translating `bus`, if it lies inside the aperture.
    fn index(&self, bus: BusAddress) -> Option<usize> {
        if bus < self.aperture {
            return None;
        }
        let index = ((bus - self.aperture) / PAGE_SIZE as u64) as usize;
        (index < self.entries).then_some(index)
    }

    fn write(&self, index: usize, entry: GttEntry) {
        // SAFETY: callers only pass indices obtained from `index` or below `entries`.
        unsafe { self.table.add(index).write_volatile(entry.as_u32()) };
        self.last_written.store(index, Ordering::Relaxed);
    }
}

impl PageBinder for Gtt {
    fn bind_page(&self, bus: BusAddress, phys: PhysicalAddress, flags: MapFlags) {
        let Some(index) = self.index(bus) else {
            log::error!("gtt: bind_page failed: ba {} outside aperture, pa {}", bus, phys);
            return;
        };
        let Some(entry) = GttEntry::new(phys, flags) else {
            log::error!("gtt: bind_page failed: ba {}, pa {} cannot be encoded", bus, phys);
            return;
        };
        self.write(index, entry);
    }

    fn unbind_page(&self, bus: BusAddress) {
        let Some(index) = self.index(bus) else {
            log::error!("gtt: unbind_page failed: ba {} outside aperture", bus);
            return;
        };
        self.write(index, self.scribble);
    }

    fn flush_tlb(&self) {
        if self.entries == 0 {
            return;
        }
        // Posting read: make sure every earlier entry write has reached the device.
        let index = self.last_written.load(Ordering::Relaxed);
        // SAFETY: last_written is always below `entries`.
        let _ = unsafe { self.table.add(index).read_volatile() };
    }
}
