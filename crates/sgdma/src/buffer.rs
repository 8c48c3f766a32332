//! Descriptions of the buffers a mapping can be loaded with.
//!
//! A buffer is either described by CPU virtual addresses in some address context (a
//! linear buffer, a chain of fragments, or a scatter list of I/O vectors), or directly
//! by physical memory (raw segments, typically from
//! [`SgDma::alloc_dma_memory`](crate::SgDma::alloc_dma_memory)).

use core::fmt;

use crate::{PhysicalAddress, VirtualAddress};

/// Identifies an address context (an address space) that owns a buffer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ContextId(u32);

impl ContextId {
    /// The kernel's own address space.
    pub const KERNEL: Self = Self(0);

    /// Creates a context identifier.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

/// An address space in which virtual buffer addresses can be resolved.
pub trait AddressContext: Sync {
    /// Returns the identifier of this context.
    fn id(&self) -> ContextId;

    /// Returns true if this is the kernel's address space.
    ///
    /// Pages in the kernel's address space stay resident for the life of a mapping;
    /// pages anywhere else may not.
    fn is_kernel(&self) -> bool {
        self.id() == ContextId::KERNEL
    }

    /// Resolves a virtual address to the physical address backing it.
    ///
    /// Returns `None` if the page is not mapped.
    fn extract(&self, va: VirtualAddress) -> Option<PhysicalAddress>;
}

/// One fragment of a buffer chain; each fragment is virtually contiguous on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub data: VirtualAddress,
    pub len: usize,
}

impl Fragment {
    pub const fn new(data: VirtualAddress, len: usize) -> Self {
        Self { data, len }
    }
}

/// One element of a scatter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub base: VirtualAddress,
    pub len: usize,
}

impl IoVec {
    pub const fn new(base: VirtualAddress, len: usize) -> Self {
        Self { base, len }
    }
}

/// A physically contiguous run of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSegment {
    pub addr: PhysicalAddress,
    pub len: usize,
}

impl RawSegment {
    pub const fn new(addr: PhysicalAddress, len: usize) -> Self {
        Self { addr, len }
    }

    /// Returns the address one past the end of this run.
    pub fn end(&self) -> PhysicalAddress {
        self.addr + self.len
    }
}

/// The shape of the buffer a mapping is loaded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferKind {
    /// Nothing loaded.
    #[default]
    Unbound,
    Linear,
    Chain,
    Scatter,
    Raw,
}

/// A buffer to be loaded into a mapping.
#[derive(Clone, Copy)]
pub enum Buffer<'a> {
    /// A virtually contiguous buffer.
    Linear {
        base: VirtualAddress,
        len: usize,
        context: &'a dyn AddressContext,
    },
    /// A chain of fragments, as used by network buffers.
    Chain {
        fragments: &'a [Fragment],
        context: &'a dyn AddressContext,
    },
    /// A scatter list of I/O vectors. Only kernel contexts are supported.
    Scatter {
        iov: &'a [IoVec],
        context: &'a dyn AddressContext,
    },
    /// Physical memory.
    Raw(&'a [RawSegment]),
}

impl<'a> Buffer<'a> {
    /// Returns the shape of this buffer.
    pub fn kind(&self) -> BufferKind {
        match self {
            Buffer::Linear { .. } => BufferKind::Linear,
            Buffer::Chain { .. } => BufferKind::Chain,
            Buffer::Scatter { .. } => BufferKind::Scatter,
            Buffer::Raw(_) => BufferKind::Raw,
        }
    }

    /// Returns the total length of this buffer in bytes, or `None` if it does not fit
    /// in a `usize`.
    pub fn len(&self) -> Option<usize> {
        fn total(mut lens: impl Iterator<Item = usize>) -> Option<usize> {
            lens.try_fold(0usize, |acc, len| acc.checked_add(len))
        }

        match self {
            Buffer::Linear { len, .. } => Some(*len),
            Buffer::Chain { fragments, .. } => total(fragments.iter().map(|f| f.len)),
            Buffer::Scatter { iov, .. } => total(iov.iter().map(|v| v.len)),
            Buffer::Raw(segs) => total(segs.iter().map(|s| s.len)),
        }
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Returns the address context the buffer lives in, if it is described virtually.
    pub fn context(&self) -> Option<&'a dyn AddressContext> {
        match *self {
            Buffer::Linear { context, .. }
            | Buffer::Chain { context, .. }
            | Buffer::Scatter { context, .. } => Some(context),
            Buffer::Raw(_) => None,
        }
    }
}

impl fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Buffer");
        s.field("kind", &self.kind());
        match self.len() {
            Some(len) => s.field("len", &len),
            None => s.field("len", &format_args!("overflow")),
        };
        if let Some(context) = self.context() {
            s.field("context", &context.id());
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;

    #[test]
    fn kernel_context_detection() {
        assert!(TestContext::kernel().is_kernel());
        assert!(!TestContext::user(7).is_kernel());
        assert_eq!(TestContext::user(7).id(), ContextId::new(7));
    }

    #[test]
    fn lengths_and_kinds() {
        let context = TestContext::kernel();
        let fragments = [
            Fragment::new(VirtualAddress::new(0x1000), 100),
            Fragment::new(VirtualAddress::new(0x5000), 0),
            Fragment::new(VirtualAddress::new(0x9000), 28),
        ];
        let chain = Buffer::Chain {
            fragments: &fragments,
            context: &context,
        };
        assert_eq!(chain.kind(), BufferKind::Chain);
        assert_eq!(chain.len(), Some(128));
        assert_eq!(chain.context().map(|c| c.id()), Some(ContextId::KERNEL));

        let segs = [
            RawSegment::new(PhysicalAddress::new(0x2000), 0x1000),
            RawSegment::new(PhysicalAddress::new(0x8000), 0x800),
        ];
        let raw = Buffer::Raw(&segs);
        assert_eq!(raw.kind(), BufferKind::Raw);
        assert_eq!(raw.len(), Some(0x1800));
        assert!(raw.context().is_none());
        assert_eq!(segs[1].end(), PhysicalAddress::new(0x8800));
    }

    #[test]
    fn overflowing_length_is_none() {
        let segs = [
            RawSegment::new(PhysicalAddress::new(0x2000), usize::MAX),
            RawSegment::new(PhysicalAddress::new(0x8000), 2),
        ];
        let raw = Buffer::Raw(&segs);
        assert_eq!(raw.len(), None);
        assert!(!raw.is_empty());
    }

    #[test]
    fn empty_scatter_list() {
        let context = TestContext::kernel();
        let buffer = Buffer::Scatter {
            iov: &[],
            context: &context,
        };
        assert!(buffer.is_empty());
        assert_eq!(BufferKind::default(), BufferKind::Unbound);
    }

    #[test]
    fn debug_shows_shape() {
        let context = TestContext::user(3);
        let buffer = Buffer::Linear {
            base: VirtualAddress::new(0x4000),
            len: 64,
            context: &context,
        };
        assert_eq!(
            format!("{:?}", buffer),
            "Buffer { kind: Linear, len: 64, context: ContextId(3) }"
        );
    }
}
