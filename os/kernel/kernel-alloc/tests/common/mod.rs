//! Host-side stand-in for physical memory.

#![allow(dead_code)]

use kernel_alloc::{BitmapPmm, DirectMapper, Heap, HeapConfig};
use kernel_info::memory::PAGE_SIZE_USIZE as PAGE_SIZE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_mmap::{MemoryKind, MemoryMap, MemoryRegion};
use std::alloc::{Layout, alloc_zeroed};

pub const PHYS_BASE: u64 = 0x10_0000;

/// `frames` frames of leaked host memory, posing as RAM at [`PHYS_BASE`].
pub struct SimMemory {
    pub frames: usize,
    pub mapper: DirectMapper,
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

    pub fn frame(&self, index: usize) -> PhysicalAddress {
        PhysicalAddress::new(PHYS_BASE + (index * PAGE_SIZE) as u64)
    }

    /// The whole buffer as one usable region.
    pub fn map(&self) -> MemoryMap {
        self.map_with(&[(0, self.frames, MemoryKind::Usable)])
    }

    /// A map of `(first frame, frames, kind)` entries over the buffer.
    pub fn map_with(&self, entries: &[(usize, usize, MemoryKind)]) -> MemoryMap {
        let regions: Vec<_> = entries
            .iter()
            .map(|&(first, frames, kind)| {
                assert!(first + frames <= self.frames);
                MemoryRegion::new(self.frame(first), (frames * PAGE_SIZE) as u64, kind)
            })
            .collect();
        MemoryMap::new(&regions).unwrap()
    }

    pub fn pmm(&self) -> BitmapPmm {
        self.pmm_over(&self.map())
    }

    pub fn pmm_over(&self, map: &MemoryMap) -> BitmapPmm {
        unsafe { BitmapPmm::new(map, &self.mapper) }.unwrap()
    }

    pub fn heap(&self, config: HeapConfig) -> Heap<DirectMapper> {
        Heap::new(self.pmm(), self.mapper, config)
    }
}
