use crate::config::PAGE_SIZE;
use crate::error::HeapError;
use crate::{BitmapPmm, PageMapper};
use kernel_memory_addresses::VirtualAddress;

/// The PMM seen through the direct map: hands out kernel-virtual page runs.
///
/// Built per heap operation from split borrows of the heap context so the
/// pool, buckets, cache and registry can all pull pages at the same time.
pub(crate) struct PageSource<'a, M: PageMapper> {
    pub pmm: &'a mut BitmapPmm,
    pub mapper: &'a M,
}

impl<M: PageMapper> PageSource<'_, M> {
    pub fn allocate(&mut self, pages: usize) -> Result<VirtualAddress, HeapError> {
        let pa = self.pmm.allocate_pages(pages)?;
        Ok(self.mapper.phys_to_virt(pa))
    }

    /// Like [`allocate`](Self::allocate), with the pages zero-filled.
    pub fn allocate_zeroed(&mut self, pages: usize) -> Result<VirtualAddress, HeapError> {
        let va = self.allocate(pages)?;
        // SAFETY: freshly allocated, mapped and exclusively ours.
        unsafe { core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, pages * PAGE_SIZE) };
        Ok(va)
    }

    pub fn release(&mut self, base: VirtualAddress, pages: usize) -> Result<(), HeapError> {
        self.pmm.free_pages(self.mapper.virt_to_phys(base), pages)?;
        Ok(())
    }

    #[inline]
    pub fn free_pages(&self) -> usize {
        self.pmm.free_blocks()
    }
}
