//! The translation-table binder interface.
//!
//! A [`PageBinder`] is whatever owns the device's translation table: an AGP/GART
//! aperture, an IOMMU, or a test double. The mapping layer only ever asks it to point
//! one aperture page at one physical page, to point it away again, and to flush the
//! device's translation cache after a batch of either.

use core::ops::BitOr;

use crate::{BusAddress, PhysicalAddress, registry::PageRegistry};

/// Per-mapping flags that influence how pages are bound and where spans are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapFlags(u32);

impl MapFlags {
    /// Coherent bit (bit 0): the device snoops CPU caches for this mapping.
    const COHERENT_BIT: u32 = 1 << 0;

    /// Low-window bit (bit 1): the span must lie below [`LOW_WINDOW_END`].
    ///
    /// [`LOW_WINDOW_END`]: crate::LOW_WINDOW_END
    const LOW_WINDOW_BIT: u32 = 1 << 1;

    /// Request a snooped, cache-coherent translation.
    pub const COHERENT: Self = Self(Self::COHERENT_BIT);

    /// Restrict the span to the legacy 24-bit window.
    pub const LOW_WINDOW: Self = Self(Self::LOW_WINDOW_BIT);

    /// Creates empty flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates flags from a raw value, dropping unknown bits.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & (Self::COHERENT_BIT | Self::LOW_WINDOW_BIT))
    }

    /// Returns the raw value of these flags.
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Returns whether every flag in `other` is also set here.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns whether the coherent bit is set.
    pub const fn is_coherent(self) -> bool {
        self.0 & Self::COHERENT_BIT != 0
    }

    /// Sets or clears the coherent bit.
    pub fn set_coherent(&mut self, coherent: bool) {
        if coherent {
            self.0 |= Self::COHERENT_BIT;
        } else {
            self.0 &= !Self::COHERENT_BIT;
        }
    }

    /// Returns whether the low-window bit is set.
    pub const fn is_low_window(self) -> bool {
        self.0 & Self::LOW_WINDOW_BIT != 0
    }

    /// Sets or clears the low-window bit.
    pub fn set_low_window(&mut self, low_window: bool) {
        if low_window {
            self.0 |= Self::LOW_WINDOW_BIT;
        } else {
            self.0 &= !Self::LOW_WINDOW_BIT;
        }
    }
}

impl BitOr for MapFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Installs and removes translation entries in a device's page table.
///
/// Implementations are infallible from the caller's point of view: a backend that
/// cannot honor a request (an address outside its aperture, a physical address its
/// entries cannot encode) logs the problem and leaves the entry alone.
///
/// None of these are ever called with the address-space lock held, so implementations
/// are free to take their own locks or perform register I/O.
pub trait PageBinder: Send + Sync {
    /// Points the aperture page at `bus` to the physical page at `phys`.
    fn bind_page(&self, bus: BusAddress, phys: PhysicalAddress, flags: MapFlags);

    /// Removes the translation for the aperture page at `bus`.
    fn unbind_page(&self, bus: BusAddress);

    /// Invalidates any translations the device has cached.
    fn flush_tlb(&self);
}

/// Binds every page of a registry, in insertion order, then flushes once.
///
/// Pages that were never assigned an aperture page are skipped.
pub(crate) fn bind_registry<B>(binder: &B, registry: &PageRegistry, flags: MapFlags)
where
    B: PageBinder + ?Sized,
{
    for (phys, bus) in registry.iter() {
        if let Some(bus) = bus {
            binder.bind_page(bus, phys, flags);
        }
    }
    binder.flush_tlb();
}

/// Unbinds every page of a registry, in insertion order, then flushes once.
pub(crate) fn unbind_registry<B>(binder: &B, registry: &PageRegistry)
where
    B: PageBinder + ?Sized,
{
    for (_, bus) in registry.iter() {
        if let Some(bus) = bus {
            binder.unbind_page(bus);
        }
    }
    binder.flush_tlb();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        PageNumber,
        arch::PAGE_SIZE,
        testing::{BinderOp, RecordingBinder},
    };

    const PAGE: u64 = PAGE_SIZE as u64;

    mod flags {
        use super::*;

        #[test]
        fn empty_by_default() {
            let flags = MapFlags::default();
            assert_eq!(flags, MapFlags::empty());
            assert!(!flags.is_coherent());
            assert!(!flags.is_low_window());
        }

        #[test]
        fn set_and_clear() {
            let mut flags = MapFlags::empty();
            flags.set_coherent(true);
            assert!(flags.is_coherent());
            assert!(flags.contains(MapFlags::COHERENT));
            assert!(!flags.contains(MapFlags::COHERENT | MapFlags::LOW_WINDOW));

            flags.set_low_window(true);
            flags.set_coherent(false);
            assert_eq!(flags, MapFlags::LOW_WINDOW);
        }

        #[test]
        fn from_raw_drops_unknown_bits() {
            assert_eq!(MapFlags::from_raw(0xff), MapFlags::COHERENT | MapFlags::LOW_WINDOW);
            assert_eq!(MapFlags::from_raw(0x3).to_raw(), 0x3);
        }
    }

    fn registry_with(frames: &[u64]) -> PageRegistry {
        let mut registry = PageRegistry::with_capacity(16);
        for &frame in frames {
            registry
                .insert(PhysicalAddress::new(frame * PAGE))
                .unwrap();
        }
        registry
    }

    #[test]
    fn bind_walks_insertion_order_then_flushes_once() {
        let mut registry = registry_with(&[9, 2, 5]);
        registry.assign(PageNumber::new(0x40));

        let binder = RecordingBinder::new();
        bind_registry(&binder, &registry, MapFlags::COHERENT);

        assert_eq!(
            binder.ops(),
            [
                BinderOp::Bind(BusAddress::new(0x40 * PAGE), PhysicalAddress::new(9 * PAGE), MapFlags::COHERENT),
                BinderOp::Bind(BusAddress::new(0x41 * PAGE), PhysicalAddress::new(2 * PAGE), MapFlags::COHERENT),
                BinderOp::Bind(BusAddress::new(0x42 * PAGE), PhysicalAddress::new(5 * PAGE), MapFlags::COHERENT),
                BinderOp::Flush,
            ]
        );
    }

    #[test]
    fn unbind_mirrors_bind() {
        let mut registry = registry_with(&[3, 1]);
        registry.assign(PageNumber::new(8));

        let binder = RecordingBinder::new();
        bind_registry(&binder, &registry, MapFlags::empty());
        assert_eq!(binder.bound_pages(), 2);

        unbind_registry(&binder, &registry);
        assert_eq!(binder.bound_pages(), 0);
        assert_eq!(binder.flushes(), 2);
        assert_eq!(
            &binder.ops()[3..],
            [
                BinderOp::Unbind(BusAddress::new(8 * PAGE)),
                BinderOp::Unbind(BusAddress::new(9 * PAGE)),
                BinderOp::Flush,
            ]
        );
    }

    #[test]
    fn unassigned_registry_only_flushes() {
        let registry = registry_with(&[1, 2]);
        let binder = RecordingBinder::new();
        bind_registry(&binder, &registry, MapFlags::empty());
        assert_eq!(binder.ops(), [BinderOp::Flush]);
    }
}
