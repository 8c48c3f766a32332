//! Page and frame number types.
//!
//! The page registry is keyed by physical frame numbers, and every frame it holds is
//! assigned one aperture page number when the mapping is bound.

use crate::{
    address::{BusAddress, PhysicalAddress},
    arch,
};
use core::{
    fmt,
    ops::{Add, Sub},
};

/// Macro to define common page/frame number functionality.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: u64) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frame numbers correspond to PAGE_SIZE-aligned physical addresses."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE as u64)
    }

    /// Returns the physical address at the end of this frame (start of next frame).
    #[inline]
    pub const fn end(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 + 1) * arch::PAGE_SIZE as u64)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        addr.frame_number()
    }
}

impl_page_number_common!(
    PageNumber,
    "An aperture page number.\n\n\
     Page numbers correspond to PAGE_SIZE-aligned bus addresses, i.e. to single\n\
     entries of the device's translation table."
);

impl PageNumber {
    /// Returns the bus address at the start of this page.
    #[inline]
    pub const fn start(self) -> BusAddress {
        BusAddress::new(self.0 * arch::PAGE_SIZE as u64)
    }

    /// Returns the bus address at the end of this page (start of next page).
    #[inline]
    pub const fn end(self) -> BusAddress {
        BusAddress::new((self.0 + 1) * arch::PAGE_SIZE as u64)
    }
}

impl From<BusAddress> for PageNumber {
    #[inline]
    fn from(addr: BusAddress) -> Self {
        addr.page_number()
    }
}
