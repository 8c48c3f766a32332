//! Test doubles for the traits the mapping layer is built on.

use alloc::{collections::BTreeMap, vec::Vec};

use spin::Mutex;

use crate::{
    AddressContext, BusAddress, CacheOps, ContextId, MapFlags, PageBinder, PhysicalAddress,
    VirtualAddress, arch::PAGE_SIZE,
};

/// One call made on a [`RecordingBinder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinderOp {
    Bind(BusAddress, PhysicalAddress, MapFlags),
    Unbind(BusAddress),
    Flush,
}

/// A binder that records every call and tracks which pages are bound.
pub struct RecordingBinder {
    ops: Mutex<Vec<BinderOp>>,
    bound: Mutex<BTreeMap<BusAddress, PhysicalAddress>>,
}

impl RecordingBinder {
    pub fn new() -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            bound: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn ops(&self) -> Vec<BinderOp> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    pub fn bound_pages(&self) -> usize {
        self.bound.lock().len()
    }

    pub fn flushes(&self) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|op| matches!(op, BinderOp::Flush))
            .count()
    }

    /// Returns the physical page the aperture page at `bus` points to.
    pub fn lookup(&self, bus: BusAddress) -> Option<PhysicalAddress> {
        self.bound.lock().get(&bus.page_base()).copied()
    }
}

impl PageBinder for RecordingBinder {
    fn bind_page(&self, bus: BusAddress, phys: PhysicalAddress, flags: MapFlags) {
        self.ops.lock().push(BinderOp::Bind(bus, phys, flags));
        self.bound.lock().insert(bus, phys);
    }

    fn unbind_page(&self, bus: BusAddress) {
        self.ops.lock().push(BinderOp::Unbind(bus));
        self.bound.lock().remove(&bus);
    }

    fn flush_tlb(&self) {
        self.ops.lock().push(BinderOp::Flush);
    }
}

/// An address context backed by an explicit page table.
pub struct TestContext {
    id: ContextId,
    pages: BTreeMap<usize, PhysicalAddress>,
}

impl TestContext {
    pub fn kernel() -> Self {
        Self {
            id: ContextId::KERNEL,
            pages: BTreeMap::new(),
        }
    }

    pub fn user(id: u32) -> Self {
        Self {
            id: ContextId::new(id),
            pages: BTreeMap::new(),
        }
    }

    /// Maps consecutive virtual pages starting at `va` to the given frame numbers.
    pub fn map(mut self, va: usize, frames: &[u64]) -> Self {
        assert_eq!(va % PAGE_SIZE, 0, "test mappings must be page aligned");
        for (i, &frame) in frames.iter().enumerate() {
            self.pages
                .insert(va + i * PAGE_SIZE, PhysicalAddress::new(frame * PAGE_SIZE as u64));
        }
        self
    }
}

impl AddressContext for TestContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn extract(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let page = self.pages.get(&va.page_base().as_usize())?;
        Some(*page + va.page_offset())
    }
}

/// One call made on a [`RecordingCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    FlushVirtual(VirtualAddress, usize),
    FlushPage(PhysicalAddress),
    FlushAll,
    Fence,
}

/// Cache operations that only record what they were asked to do.
pub struct RecordingCache {
    line_size: usize,
    ops: Mutex<Vec<CacheOp>>,
}

impl RecordingCache {
    pub fn new(line_size: usize) -> Self {
        Self {
            line_size,
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn ops(&self) -> Vec<CacheOp> {
        self.ops.lock().clone()
    }
}

impl CacheOps for RecordingCache {
    fn line_size(&self) -> usize {
        self.line_size
    }

    fn flush_virtual(&self, va: VirtualAddress, len: usize) {
        self.ops.lock().push(CacheOp::FlushVirtual(va, len));
    }

    fn flush_page(&self, pa: PhysicalAddress) {
        self.ops.lock().push(CacheOp::FlushPage(pa));
    }

    fn flush_all(&self) {
        self.ops.lock().push(CacheOp::FlushAll);
    }

    fn fence(&self) {
        self.ops.lock().push(CacheOp::Fence);
    }
}
