//! # Big blocks
//!
//! Requests above the largest small bucket get whole pages straight from the
//! PMM. Freed blocks up to a size ceiling are parked in a small cache and
//! handed out again best-fit, which also feeds empty one-page chunks back to
//! the small buckets.

use super::chunk::{ChunkHandle, ChunkKind};
use super::chungus::ChunguousPool;
use super::list::{Linked, List, ListId};
use super::page_source::PageSource;
use crate::PageMapper;
use crate::config::HeapConfig;
use crate::error::HeapError;
use kernel_memory_addresses::VirtualAddress;
use log::{debug, trace};

pub(crate) struct BigBlockAllocator {
    /// Most recently cached block first.
    cache: List<ChunkHandle>,
    cached_pages: usize,
    config: HeapConfig,
}

impl BigBlockAllocator {
    pub const fn new(config: HeapConfig) -> Self {
        Self {
            cache: List::new(ListId::Cached),
            cached_pages: 0,
            config,
        }
    }

    pub const fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    pub const fn cached_pages(&self) -> usize {
        self.cached_pages
    }

    /// A block of at least `pages` pages, from the cache if one fits.
    pub fn alloc<M: PageMapper>(
        &mut self,
        pages: usize,
        pool: &mut ChunguousPool,
        src: &mut PageSource<'_, M>,
    ) -> Result<ChunkHandle, HeapError> {
        if let Some(hit) = self.best_fit(pages) {
            self.take(hit);
            trace!(
                "heap: reusing cached {}-page block {} for {pages} pages",
                hit.pages(),
                hit.base()
            );
            return Ok(hit);
        }

        let info = pool.claim(src)?;
        match self.fresh_pages(pages, pool, src) {
            Ok(base) => {
                info.init_big(base, pages);
                trace!("heap: {pages}-page block at {base}");
                Ok(info)
            }
            Err(e) => {
                pool.release(info, src)?;
                Err(e)
            }
        }
    }

    /// Pages from the PMM; on exhaustion the cache is flushed and the
    /// request retried once.
    pub fn fresh_pages<M: PageMapper>(
        &mut self,
        pages: usize,
        pool: &mut ChunguousPool,
        src: &mut PageSource<'_, M>,
    ) -> Result<VirtualAddress, HeapError> {
        match src.allocate(pages) {
            Err(HeapError::OutOfMemory { .. }) if !self.cache.is_empty() => {
                debug!(
                    "heap: out of memory for {pages} pages, flushing {} cached blocks",
                    self.cache.len()
                );
                self.trim(pool, src)?;
                src.allocate(pages)
            }
            other => other,
        }
    }

    /// Remove and return a cached block of exactly `pages` pages.
    pub fn take_exact(&mut self, pages: usize) -> Option<ChunkHandle> {
        let hit = self.cache.iter().find(|c| c.pages() == pages)?;
        self.take(hit);
        Some(hit)
    }

    /// Accept a block nobody uses any more: cache it if there is room and it
    /// is under the ceiling, otherwise give its pages and record back.
    pub fn retire<M: PageMapper>(
        &mut self,
        chunk: ChunkHandle,
        pool: &mut ChunguousPool,
        src: &mut PageSource<'_, M>,
    ) -> Result<(), HeapError> {
        let pages = chunk.pages();
        chunk.init_big(chunk.base(), pages);

        if self.cache.len() < self.config.cache_entries && pages <= self.config.cache_max_pages {
            self.cache.push_front(chunk);
            self.cached_pages += pages;
            trace!("heap: cached {pages}-page block {}", chunk.base());
            return Ok(());
        }

        trace!("heap: releasing {pages}-page block {}", chunk.base());
        Self::release(chunk, pool, src)
    }

    /// Return every cached block to the PMM. Returns the pages released.
    pub fn trim<M: PageMapper>(
        &mut self,
        pool: &mut ChunguousPool,
        src: &mut PageSource<'_, M>,
    ) -> Result<usize, HeapError> {
        let mut released = 0;
        while let Some(chunk) = self.cache.pop_front() {
            let pages = chunk.pages();
            self.cached_pages -= pages;
            released += pages;
            Self::release(chunk, pool, src)?;
        }
        if released > 0 {
            debug!("heap: trimmed {released} cached pages");
        }
        Ok(released)
    }

    /// Smallest cached block with at least `pages` pages; on ties the most
    /// recently cached one.
    fn best_fit(&self, pages: usize) -> Option<ChunkHandle> {
        let mut best: Option<ChunkHandle> = None;
        for candidate in self.cache.iter() {
            let have = candidate.pages();
            if have == pages {
                return Some(candidate);
            }
            if have > pages && best.is_none_or(|b| have < b.pages()) {
                best = Some(candidate);
            }
        }
        best
    }

    fn take(&mut self, chunk: ChunkHandle) {
        debug_assert_eq!(chunk.kind(), ChunkKind::Big);
        self.cache.remove(chunk);
        self.cached_pages -= chunk.pages();
    }

    fn release<M: PageMapper>(
        chunk: ChunkHandle,
        pool: &mut ChunguousPool,
        src: &mut PageSource<'_, M>,
    ) -> Result<(), HeapError> {
        debug_assert_eq!(chunk.owner(), ListId::Unlinked);
        src.release(chunk.base(), chunk.pages())?;
        pool.release(chunk, src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::testing::SimMemory;

    struct Fixture {
        pool: ChunguousPool,
        big: BigBlockAllocator,
    }

    impl Fixture {
        fn new(config: HeapConfig) -> Self {
            Self {
                pool: ChunguousPool::new(),
                big: BigBlockAllocator::new(config),
            }
        }

        fn alloc<M: PageMapper>(
            &mut self,
            pages: usize,
            src: &mut PageSource<'_, M>,
        ) -> ChunkHandle {
            self.big.alloc(pages, &mut self.pool, src).unwrap()
        }

        fn retire<M: PageMapper>(&mut self, chunk: ChunkHandle, src: &mut PageSource<'_, M>) {
            self.big.retire(chunk, &mut self.pool, src).unwrap();
        }
    }

    #[test]
    fn best_fit_prefers_exact_then_smallest() {
        let mem = SimMemory::new(64);
        let mut pmm = mem.pmm();
        let mut src = PageSource { pmm: &mut pmm, mapper: mem.mapper() };
        let mut f = Fixture::new(HeapConfig::DEFAULT);

        let four = f.alloc(4, &mut src);
        let two = f.alloc(2, &mut src);
        let three = f.alloc(3, &mut src);
        let (b4, b2, b3) = (four.base(), two.base(), three.base());
        for c in [four, two, three] {
            f.retire(c, &mut src);
        }
        assert_eq!(f.big.cached_blocks(), 3);
        assert_eq!(f.big.cached_pages(), 9);

        let free = src.free_pages();
        assert_eq!(f.alloc(3, &mut src).base(), b3);
        assert_eq!(f.alloc(1, &mut src).base(), b2);
        assert_eq!(f.alloc(4, &mut src).base(), b4);
        // All reuses came from the cache.
        assert_eq!(src.free_pages(), free);
        assert_eq!(f.big.cached_blocks(), 0);
    }

    #[test]
    fn ties_go_to_most_recent() {
        let mem = SimMemory::new(64);
        let mut pmm = mem.pmm();
        let mut src = PageSource { pmm: &mut pmm, mapper: mem.mapper() };
        let mut f = Fixture::new(HeapConfig::DEFAULT);

        let a = f.alloc(2, &mut src);
        let b = f.alloc(2, &mut src);
        let b_base = b.base();
        f.retire(a, &mut src);
        f.retire(b, &mut src);
        assert_eq!(f.alloc(1, &mut src).base(), b_base);
    }

    #[test]
    fn oversized_or_overflowing_blocks_go_back_to_the_pmm() {
        let mem = SimMemory::new(64);
        let mut pmm = mem.pmm();
        let mut src = PageSource { pmm: &mut pmm, mapper: mem.mapper() };
        let config = HeapConfig::DEFAULT
            .with_cache_entries(1)
            .with_cache_max_bytes(2 * PAGE_SIZE);
        let mut f = Fixture::new(config);

        let huge = f.alloc(3, &mut src);
        let a = f.alloc(1, &mut src);
        let b = f.alloc(1, &mut src);
        let free = src.free_pages();

        f.retire(huge, &mut src);
        assert_eq!(f.big.cached_blocks(), 0);
        assert_eq!(src.free_pages(), free + 3);

        f.retire(a, &mut src);
        f.retire(b, &mut src);
        assert_eq!(f.big.cached_blocks(), 1);
        assert_eq!(src.free_pages(), free + 4);
    }

    #[test]
    fn exhaustion_flushes_the_cache() {
        let mem = SimMemory::new(16);
        let mut pmm = mem.pmm();
        let mut src = PageSource { pmm: &mut pmm, mapper: mem.mapper() };
        let mut f = Fixture::new(HeapConfig::DEFAULT);

        // 16 frames: bitmap and one Chungus leave 14.
        let a = f.alloc(4, &mut src);
        let b = f.alloc(4, &mut src);
        f.retire(a, &mut src);
        f.retire(b, &mut src);
        assert_eq!(src.free_pages(), 6);

        // Needs 10 contiguous frames; only possible once the cache is flushed.
        let big = f.alloc(10, &mut src);
        assert_eq!(big.pages(), 10);
        assert_eq!(f.big.cached_blocks(), 0);
        assert_eq!(src.free_pages(), 4);

        let err = f.big.alloc(5, &mut f.pool, &mut src).unwrap_err();
        assert_eq!(err, HeapError::OutOfMemory { pages: 5, free: 4 });
    }

    #[test]
    fn take_exact_ignores_larger_blocks() {
        let mem = SimMemory::new(32);
        let mut pmm = mem.pmm();
        let mut src = PageSource { pmm: &mut pmm, mapper: mem.mapper() };
        let mut f = Fixture::new(HeapConfig::DEFAULT);

        let one = f.alloc(1, &mut src);
        let two = f.alloc(2, &mut src);
        let base = one.base();

        f.retire(two, &mut src);
        assert!(f.big.take_exact(1).is_none());

        f.retire(one, &mut src);
        let hit = f.big.take_exact(1).unwrap();
        assert_eq!(hit.base(), base);
        assert_eq!(f.big.cached_blocks(), 1);
        assert_eq!(f.big.cached_pages(), 2);
    }
}
