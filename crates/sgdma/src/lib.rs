#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Scatter/Gather DMA (SGDMA)
//!
//! A scatter/gather DMA mapping layer for devices that see memory through a
//! bounded translation window, such as an AGP/GART aperture or an IOMMU. It
//! provides:
//!
//! - A device-virtual address allocator over a single linear aperture.
//! - Per-mapping physical page registries with deduplication.
//! - Page table binding through a pluggable backend (see [`PageBinder`]).
//! - Segment building that merges device-contiguous runs and splits on
//!   boundary and maximum-segment-size constraints.
//! - A lifecycle manager, [`SgDma`], tying it all together.
//!
//! Software emulation of the architecture layer is used for tests and for
//! running in non-kernel environments.

extern crate alloc;

mod address;
mod arch;
mod backend;
mod binder;
mod buffer;
mod error;
mod extent;
mod gtt;
mod human_size;
mod mapping;
mod numbers;
mod registry;
mod segment;
mod sg_dma;
mod sync;

#[cfg(test)]
mod testing;

pub use address::{BusAddress, PhysicalAddress, VirtualAddress};
pub use backend::{DirectBackend, DmaBackend};
pub use binder::{MapFlags, PageBinder};
pub use buffer::{AddressContext, Buffer, BufferKind, ContextId, Fragment, IoVec, RawSegment};
pub use error::DmaError;
pub use extent::{Extent, LOW_WINDOW_END, Span};
pub use gtt::{Gtt, GttEntry};
pub use human_size::HumanSize;
pub use mapping::{MapParams, MapState, Mapping};
pub use numbers::{FrameNumber, PageNumber};
pub use registry::{PageRegistry, REGISTRY_MIN_PAGES, REGISTRY_SLACK};
pub use segment::{Segment, SegmentList};
pub use sg_dma::SgDma;
pub use sync::{ArchCache, CacheFlushSync, CacheOps, SyncHook, SyncOps};

pub use arch::PAGE_SIZE;
