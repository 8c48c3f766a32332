//! Address types for the three address spaces a DMA mapping deals with.
//!
//! - [`PhysicalAddress`]: where the memory really lives.
//! - [`BusAddress`]: what the device issues on the bus (device-virtual, DVMA).
//! - [`VirtualAddress`]: what the CPU uses to reach the buffer.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch};

/// Macro to define common address type functionality.
///
/// Physical and bus addresses are always 64 bits wide, regardless of the CPU's
/// pointer width, while virtual addresses follow the pointer width.
macro_rules! impl_address_common {
    ($name:ident, $repr:ty, $as_raw:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name($repr);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: $repr) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn $as_raw(self) -> $repr {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: $repr) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: $repr) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: $repr) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                (self.0 & (arch::PAGE_SIZE as $repr - 1)) as usize
            }

            /// Returns the address of the start of the page containing this address.
            #[inline]
            pub const fn page_base(self) -> Self {
                Self(self.0 & !(arch::PAGE_SIZE as $repr - 1))
            }

            /// Returns this address advanced by `rhs` bytes, or `None` if that wraps.
            #[inline]
            pub fn checked_add(self, rhs: usize) -> Option<Self> {
                let rhs = <$repr>::try_from(rhs).ok()?;
                self.0.checked_add(rhs).map(Self)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<$repr> for $name {
            #[inline]
            fn from(addr: $repr) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs as $repr)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs as $repr)
            }
        }

        impl Sub<$name> for $name {
            type Output = $repr;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    u64,
    as_u64,
    "A physical memory address.\n\n\
     Physical addresses are what the translation table entries point at. They are\n\
     never dereferenced by this crate."
);

impl PhysicalAddress {
    /// Returns the frame containing this physical address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 / arch::PAGE_SIZE as u64)
    }
}

impl_address_common!(
    BusAddress,
    u64,
    as_u64,
    "A device-visible (DVMA) address.\n\n\
     Bus addresses are only meaningful to the device behind the translation window;\n\
     the aperture or IOMMU turns them back into physical addresses."
);

impl BusAddress {
    /// Returns the aperture page containing this bus address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 / arch::PAGE_SIZE as u64)
    }

    /// Returns the start of the `boundary`-sized block following the one containing
    /// this address.
    ///
    /// Returns `None` when the next block would lie beyond the 64-bit bus address space.
    #[inline]
    pub const fn next_boundary(self, boundary: u64) -> Option<BusAddress> {
        assert!(boundary.is_power_of_two(), "boundary must be a power of two");
        match (self.0 | (boundary - 1)).checked_add(1) {
            Some(next) => Some(Self(next)),
            None => None,
        }
    }
}

impl_address_common!(
    VirtualAddress,
    usize,
    as_usize,
    "A CPU virtual address.\n\n\
     Used to describe linear buffers before their pages have been resolved to\n\
     physical memory by the owning address context."
);

impl VirtualAddress {
    /// Creates a virtual address from a pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn alignment_check() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE as u64 * 4);
            assert!(addr.is_aligned(arch::PAGE_SIZE as u64));
            assert!(addr.is_aligned(1));
            assert!(!addr.is_aligned(arch::PAGE_SIZE as u64 * 8));
        }

        #[test]
        fn align_up_and_down() {
            let addr = PhysicalAddress::new(0x1_2345);
            assert_eq!(addr.align_down(0x1000), PhysicalAddress::new(0x1_2000));
            assert_eq!(addr.align_up(0x1000), PhysicalAddress::new(0x1_3000));
            let aligned = PhysicalAddress::new(0x2000);
            assert_eq!(aligned.align_up(0x1000), aligned);
            assert_eq!(aligned.align_down(0x1000), aligned);
        }

        #[test]
        fn page_offset_and_base() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE as u64 * 3 + 0x24);
            assert_eq!(addr.page_offset(), 0x24);
            assert_eq!(addr.page_base().as_u64(), arch::PAGE_SIZE as u64 * 3);
        }

        #[test]
        fn addresses_above_four_gib() {
            let addr = PhysicalAddress::new(0x8_0000_1000);
            assert_eq!(addr.frame_number().as_u64(), 0x8_0000_1000 / arch::PAGE_SIZE as u64);
            assert_eq!((addr + 0x10).as_u64(), 0x8_0000_1010);
        }

        #[test]
        fn difference() {
            let a = PhysicalAddress::new(0x3000);
            let b = PhysicalAddress::new(0x1800);
            assert_eq!(a - b, 0x1800);
            assert_eq!((a - 0x800usize).as_u64(), 0x2800);
        }

        #[test]
        fn checked_add_at_top_of_space() {
            let top = PhysicalAddress::new(u64::MAX - 0xfff);
            assert_eq!(top.checked_add(0xfff), Some(PhysicalAddress::new(u64::MAX)));
            assert_eq!(top.checked_add(0x1000), None);
        }

        #[test]
        fn formatting() {
            let addr = PhysicalAddress::new(0x100);
            assert_eq!(format!("{:?}", addr), "PhysicalAddress(0x100)");
            assert_eq!(format!("{}", addr), "0x100");
        }
    }

    mod bus_address {
        use super::*;

        #[test]
        fn next_boundary_from_inside_block() {
            let addr = BusAddress::new(0x1_0800);
            assert_eq!(addr.next_boundary(0x1000), Some(BusAddress::new(0x1_1000)));
            assert_eq!(addr.next_boundary(0x1_0000), Some(BusAddress::new(0x2_0000)));
        }

        #[test]
        fn next_boundary_from_block_start() {
            let addr = BusAddress::new(0x4000);
            assert_eq!(addr.next_boundary(0x4000), Some(BusAddress::new(0x8000)));
        }

        #[test]
        fn next_boundary_at_top_of_space() {
            let addr = BusAddress::new(u64::MAX - 0x10);
            assert_eq!(addr.next_boundary(0x1000), None);
        }

        #[test]
        fn page_number() {
            let addr = BusAddress::new(arch::PAGE_SIZE as u64 * 7 + 1);
            assert_eq!(addr.page_number().as_u64(), 7);
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn pointer_round_trip() {
            let value = 0u32;
            let addr = VirtualAddress::from_ptr(&value as *const u32);
            assert_eq!(addr.as_ptr::<u32>(), &value as *const u32);
        }

        #[test]
        fn page_offset() {
            let addr = VirtualAddress::new(arch::PAGE_SIZE + 0x10);
            assert_eq!(addr.page_offset(), 0x10);
            assert_eq!(addr.page_base(), VirtualAddress::new(arch::PAGE_SIZE));
        }
    }
}
