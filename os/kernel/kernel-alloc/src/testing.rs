//! Simulated physical memory for unit tests.

use crate::config::PAGE_SIZE;
use crate::{BitmapPmm, DirectMapper, Heap, HeapConfig};
use kernel_memory_addresses::PhysicalAddress;
use kernel_mmap::{MemoryKind, MemoryMap, MemoryRegion};
use std::alloc::{Layout, alloc_zeroed};

/// Where the simulated RAM starts in "physical" address space.
pub const PHYS_BASE: u64 = 0x10_0000;

/// A leaked, page-aligned host buffer posing as `frames` frames of RAM.
pub struct SimMemory {
    frames: usize,
    mapper: DirectMapper,
}

impl SimMemory {
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        let offset = (ptr.expose_provenance() as u64).wrapping_sub(PHYS_BASE);
        Self {
            frames,
            mapper: DirectMapper::new(offset),
        }
    }

    pub const fn phys_base(&self) -> PhysicalAddress {
        PhysicalAddress::new(PHYS_BASE)
    }

    pub const fn mapper(&self) -> &DirectMapper {
        &self.mapper
    }

    /// A single usable region covering the whole buffer.
    pub fn map(&self) -> MemoryMap {
        MemoryMap::new(&[MemoryRegion::new(
            self.phys_base(),
            (self.frames * PAGE_SIZE) as u64,
            MemoryKind::Usable,
        )])
        .unwrap()
    }

    pub fn pmm(&self) -> BitmapPmm {
        unsafe { BitmapPmm::new(&self.map(), &self.mapper) }.unwrap()
    }

    pub fn heap(&self, config: HeapConfig) -> Heap<DirectMapper> {
        Heap::new(self.pmm(), self.mapper, config)
    }
}
