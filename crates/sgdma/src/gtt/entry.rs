//! Graphics translation table entry.

use crate::{MapFlags, PhysicalAddress, arch::PAGE_SIZE};

/// A single 32-bit graphics translation table entry.
///
/// The entry format:
/// - Bit 0: Valid
/// - Bits 1-2: Cache type (`0b11` = snooped, `0b00` = uncached)
/// - Bit 3: Reserved
/// - Bits 4-7: Physical address bits 32-35
/// - Bits 8-11: Reserved
/// - Bits 12-31: Physical address bits 12-31
///
/// Physical addresses therefore have to be page aligned and fit in 36 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct GttEntry(u32);

impl GttEntry {
    /// Valid bit (bit 0).
    const VALID: u32 = 1 << 0;

    /// Cache type field (bits 1-2).
    const CACHE_MASK: u32 = 0b11 << 1;

    /// Cache type for snooped (coherent) accesses.
    const CACHE_SNOOPED: u32 = 0b11 << 1;

    /// Physical address bits 32-35, stored in bits 4-7.
    const HIGH_ADDRESS_MASK: u32 = 0xf0;

    /// Physical address bits 12-31, stored in place.
    const LOW_ADDRESS_MASK: u32 = 0xffff_f000;

    /// Number of physical address bits an entry can encode.
    pub const ADDRESS_BITS: u32 = 36;

    /// Creates a valid entry pointing at `address`.
    ///
    /// Returns `None` if the address is not page aligned or does not fit in
    /// [`ADDRESS_BITS`](Self::ADDRESS_BITS).
    pub fn new(address: PhysicalAddress, flags: MapFlags) -> Option<Self> {
        let raw = address.as_u64();
        if !address.is_aligned(PAGE_SIZE as u64) || raw >> Self::ADDRESS_BITS != 0 {
            return None;
        }

        let low = raw as u32 & Self::LOW_ADDRESS_MASK;
        let high = (raw >> 28) as u32 & Self::HIGH_ADDRESS_MASK;
        let cache = if flags.is_coherent() {
            Self::CACHE_SNOOPED
        } else {
            0
        };
        Some(Self(low | high | cache | Self::VALID))
    }

    /// Returns the physical address stored in this entry.
    ///
    /// Returns None if the entry is not valid.
    pub fn address(self) -> Option<PhysicalAddress> {
        if !self.is_valid() {
            return None;
        }
        let low = (self.0 & Self::LOW_ADDRESS_MASK) as u64;
        let high = ((self.0 & Self::HIGH_ADDRESS_MASK) as u64) << 28;
        Some(PhysicalAddress::new(high | low))
    }

    /// Returns whether this entry is valid.
    pub const fn is_valid(self) -> bool {
        self.0 & Self::VALID != 0
    }

    /// Returns whether this entry requests snooped accesses.
    pub const fn is_snooped(self) -> bool {
        self.0 & Self::CACHE_MASK == Self::CACHE_SNOOPED
    }

    /// Returns the raw value of this entry.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Creates an entry from a raw value.
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }
}
