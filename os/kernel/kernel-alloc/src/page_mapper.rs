//! # Physical to kernel-virtual translation
//!
//! Rust code can only dereference virtual addresses. Everything the PMM hands
//! out is physical, so the heap goes through a [`PageMapper`] whenever it
//! touches a frame.
//!
//! The kernel maps all physical memory at a fixed offset (the HHDM), so the
//! only implementation needed at runtime is [`DirectMapper`]. Tests build one
//! whose offset points into a host buffer that stands in for RAM.

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Translates between physical frames and kernel-addressable memory.
pub trait PageMapper {
    /// Where the kernel can access `pa`.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress;

    /// Inverse of [`phys_to_virt`](Self::phys_to_virt) for addresses it produced.
    fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress;
}

/// Fixed-offset mapping: `va = pa + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMapper {
    offset: u64,
}

impl DirectMapper {
    #[inline]
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// The kernel's higher-half direct map at [`HHDM_BASE`].
    #[inline]
    #[must_use]
    pub const fn hhdm() -> Self {
        Self::new(HHDM_BASE)
    }
}

impl PageMapper for DirectMapper {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(pa.as_u64().wrapping_add(self.offset))
    }

    #[inline]
    fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(va.as_u64().wrapping_sub(self.offset))
    }
}
