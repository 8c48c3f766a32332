//! Error type shared by every fallible DMA mapping operation.

use core::fmt;

/// Errors that can occur while creating or loading a DMA mapping.
///
/// Every failure during a load leaves the mapping exactly as it was before the load
/// started; the variant only tells the caller why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// Metadata allocation failed (registry, segment list, physical memory).
    OutOfMemory,
    /// No span of the requested size, alignment and boundary is free in the aperture.
    AddressSpaceExhausted,
    /// The buffer needs more segments than the mapping allows.
    TooManySegments,
    /// The buffer touches more distinct physical pages than the registry can hold.
    TooManyPages,
    /// The request is malformed: zero length, oversize, or an unresolvable page.
    InvalidArgument,
    /// The buffer lives somewhere this implementation cannot service.
    Unsupported,
    /// A span handed back to the allocator was never reserved from it.
    NotFound,
}

impl DmaError {
    /// Returns the closest POSIX errno value, for callers bridging to a C-style ABI.
    pub const fn errno(self) -> i32 {
        match self {
            DmaError::OutOfMemory | DmaError::AddressSpaceExhausted => 12, // ENOMEM
            DmaError::TooManySegments | DmaError::TooManyPages => 27,      // EFBIG
            DmaError::InvalidArgument => 22,                               // EINVAL
            DmaError::Unsupported => 45,                                   // EOPNOTSUPP
            DmaError::NotFound => 2,                                       // ENOENT
        }
    }
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DmaError::OutOfMemory => "out of memory",
            DmaError::AddressSpaceExhausted => "DVMA address space exhausted",
            DmaError::TooManySegments => "too many DMA segments",
            DmaError::TooManyPages => "too many physical pages for mapping",
            DmaError::InvalidArgument => "invalid argument",
            DmaError::Unsupported => "operation not supported",
            DmaError::NotFound => "span not found",
        };
        f.write_str(msg)
    }
}
