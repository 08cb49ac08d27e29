//! # Kernel heap
//!
//! [`Heap`] owns the PMM and every allocator layered on top of it:
//!
//! ```text
//!            malloc / free / realloc
//!                      │
//!        ┌─────────────┴──────────────┐
//!   ≤ 2 KiB                        > 2 KiB
//!  small buckets ── empty pages ─▶ big blocks ◀─▶ cache
//!        │                            │
//!        └────── ChunkInfo records ───┘
//!                 (Chungus pool)
//!                      │
//!               address registry
//!                      │
//!                  bitmap PMM
//! ```
//!
//! No allocation carries an inline header: the address registry maps each
//! live block back to its record.

mod big_block;
mod bucket;
mod chungus;
mod chunk;
mod list;
mod page_source;
mod registry;

pub use chungus::SLOTS as CHUNK_INFOS_PER_PAGE;

use crate::config::{HeapConfig, MAX_SMALL_SIZE, PAGE_SIZE, SMALL_BUCKETS};
use crate::error::HeapError;
use crate::{BitmapPmm, PageMapper, PmmError, PmmStats};
use big_block::BigBlockAllocator;
use bucket::{SmallBucketAllocator, order_for};
use chungus::ChunguousPool;
use chunk::{ChunkKind, block_size};
use core::fmt;
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use log::{debug, trace};
use page_source::PageSource;
use registry::AddressRegistry;

/// Point-in-time view of the heap's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub pmm: PmmStats,
    /// Chunks held by each small bucket, smallest block size first.
    pub small_chunks: [usize; SMALL_BUCKETS],
    pub cached_blocks: usize,
    pub cached_pages: usize,
    /// Pages holding `ChunkInfo` records.
    pub chunguses: usize,
    /// Claimed `ChunkInfo` records.
    pub chunk_infos: usize,
    pub live_allocations: usize,
    pub registry_capacity: usize,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}; {} live allocations, chunks per bucket {:?}, {} cached blocks ({} pages), \
             {} records in {} Chunguses, registry {} slots",
            self.pmm,
            self.live_allocations,
            self.small_chunks,
            self.cached_blocks,
            self.cached_pages,
            self.chunk_infos,
            self.chunguses,
            self.registry_capacity
        )
    }
}

/// The heap context: PMM plus small buckets, big blocks, the record pool and
/// the address registry.
///
/// Every operation takes `&mut self`; the global instance lives behind a
/// spin lock.
pub struct Heap<M: PageMapper> {
    pmm: BitmapPmm,
    mapper: M,
    config: HeapConfig,
    pool: ChunguousPool,
    small: SmallBucketAllocator,
    big: BigBlockAllocator,
    registry: AddressRegistry,
}

// SAFETY: the raw record and table pointers inside the heap point into pages
// the heap exclusively owns; moving the heap to another CPU moves that
// ownership with it.
unsafe impl<M: PageMapper + Send> Send for Heap<M> {}

/// Split borrows of a [`Heap`] for one operation.
struct Parts<'a, M: PageMapper> {
    src: PageSource<'a, M>,
    pool: &'a mut ChunguousPool,
    small: &'a mut SmallBucketAllocator,
    big: &'a mut BigBlockAllocator,
    registry: &'a mut AddressRegistry,
}

impl<M: PageMapper> Heap<M> {
    #[must_use]
    pub const fn new(pmm: BitmapPmm, mapper: M, config: HeapConfig) -> Self {
        Self {
            pmm,
            mapper,
            config,
            pool: ChunguousPool::new(),
            small: SmallBucketAllocator::new(),
            big: BigBlockAllocator::new(config),
            registry: AddressRegistry::new(),
        }
    }

    fn parts(&mut self) -> Parts<'_, M> {
        Parts {
            src: PageSource {
                pmm: &mut self.pmm,
                mapper: &self.mapper,
            },
            pool: &mut self.pool,
            small: &mut self.small,
            big: &mut self.big,
            registry: &mut self.registry,
        }
    }

    /// Allocate at least `size` bytes.
    ///
    /// A zero-byte request is served as a one-byte request. Blocks of up to
    /// 2 KiB are aligned to their power-of-two size class; larger blocks are
    /// page aligned. If the PMM runs dry, for the block or for the heap's own
    /// records, the big-block cache is flushed and the request retried once.
    ///
    /// # Errors
    /// * [`HeapError::TooLarge`] if `size` exceeds allocatable memory.
    /// * [`HeapError::OutOfMemory`] if the PMM cannot back the request.
    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let size = size.max(1);
        let pages = if size > MAX_SMALL_SIZE {
            let pages = size.div_ceil(PAGE_SIZE);
            if pages > self.pmm.allocatable_blocks() {
                return Err(HeapError::TooLarge { size });
            }
            Some(pages)
        } else {
            None
        };

        match self.carve(size, pages) {
            Err(HeapError::OutOfMemory { .. }) if self.big.cached_blocks() > 0 => {
                debug!(
                    "heap: out of memory for malloc({size}), flushing {} cached blocks",
                    self.big.cached_blocks()
                );
                self.trim()?;
                self.carve(size, pages)
            }
            other => other,
        }
    }

    /// One attempt at [`malloc`](Self::malloc). Leaves the heap unchanged
    /// on failure.
    fn carve(&mut self, size: usize, pages: Option<usize>) -> Result<NonNull<u8>, HeapError> {
        let Parts {
            mut src,
            pool,
            small,
            big,
            registry,
        } = self.parts();
        registry.reserve(&mut src)?;

        let (addr, chunk) = match pages {
            None => small.alloc(order_for(size), pool, big, &mut src)?,
            Some(pages) => {
                let chunk = big.alloc(pages, pool, &mut src)?;
                (chunk.base(), chunk)
            }
        };
        registry.insert(addr, chunk)?;

        trace!("heap: malloc({size}) = {addr}");
        NonNull::new(addr.as_mut_ptr()).ok_or(HeapError::Corrupt("null block address"))
    }

    /// [`malloc`](Self::malloc), with the first `size` bytes zeroed.
    ///
    /// # Errors
    /// As for [`malloc`](Self::malloc).
    pub fn calloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let ptr = self.malloc(size)?;
        // SAFETY: the block holds at least `size` bytes and is exclusively ours.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// Release the block at `ptr`. A null pointer is ignored.
    ///
    /// # Errors
    /// * [`HeapError::DoubleFree`] if the block was already freed.
    /// * [`HeapError::InvalidFree`] if `ptr` was never returned by this heap.
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Ok(());
        }
        let addr = VirtualAddress::from_ptr(ptr);
        let Parts {
            mut src,
            pool,
            small,
            big,
            registry,
        } = self.parts();

        let chunk = registry.remove(addr)?;
        trace!("heap: free({addr})");
        match chunk.kind() {
            ChunkKind::Small => small.free(chunk, addr, pool, big, &mut src),
            ChunkKind::Big if chunk.base() == addr => big.retire(chunk, pool, &mut src),
            _ => Err(HeapError::Corrupt("registry entry does not match its record")),
        }
    }

    /// Resize the block at `ptr` to at least `new_size` bytes.
    ///
    /// * A null `ptr` behaves like [`malloc`](Self::malloc).
    /// * `new_size == 0` frees the block and returns `None`.
    /// * If the block's capacity already covers `new_size` it is returned
    ///   unchanged; otherwise the contents move to a new block.
    ///
    /// # Errors
    /// As for [`malloc`](Self::malloc) and [`free`](Self::free); the
    /// original block is left untouched.
    pub fn realloc(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let Some(old) = NonNull::new(ptr) else {
            return self.malloc(new_size).map(Some);
        };
        if new_size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }

        let capacity = self.usable_size(ptr)?;
        if new_size <= capacity {
            return Ok(Some(old));
        }

        let new = self.malloc(new_size)?;
        // SAFETY: two distinct live blocks; the old one holds `capacity`
        // bytes and the new one more than that.
        unsafe { core::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), capacity) };
        self.free(ptr)?;
        Ok(Some(new))
    }

    /// Bytes usable at `ptr`: the block size for small blocks, the whole
    /// page run for big ones.
    ///
    /// # Errors
    /// As for [`free`](Self::free).
    pub fn usable_size(&self, ptr: *const u8) -> Result<usize, HeapError> {
        let chunk = self.registry.get(VirtualAddress::from_ptr(ptr))?;
        Ok(match chunk.kind() {
            ChunkKind::Small => block_size(chunk.order()),
            _ => chunk.size(),
        })
    }

    /// Raw frames for page tables, DMA buffers and the like. These bypass
    /// the registry and must go back through [`free_pages`](Self::free_pages).
    ///
    /// # Errors
    /// As for [`BitmapPmm::allocate_pages`], after flushing the big-block
    /// cache once on exhaustion.
    pub fn allocate_pages(&mut self, n: usize) -> Result<PhysicalAddress, HeapError> {
        match self.pmm.allocate_pages(n) {
            Err(PmmError::OutOfMemory { .. }) if self.big.cached_blocks() > 0 => {
                self.trim()?;
                Ok(self.pmm.allocate_pages(n)?)
            }
            other => other.map_err(HeapError::from),
        }
    }

    /// # Errors
    /// As for [`BitmapPmm::free_pages`].
    pub fn free_pages(&mut self, addr: PhysicalAddress, n: usize) -> Result<(), HeapError> {
        self.pmm.free_pages(addr, n).map_err(HeapError::from)
    }

    /// Mark frames overlapping `[addr, addr + n pages)` as in use, for boot
    /// structures the loader left in usable memory. Returns how many frames
    /// changed state.
    pub fn reserve(&mut self, addr: PhysicalAddress, n: usize) -> usize {
        self.pmm.reserve(addr, n)
    }

    /// Give every cached big block back to the PMM. Returns the pages released.
    ///
    /// # Errors
    /// If the PMM rejects a cached block, which means the heap is corrupt.
    pub fn trim(&mut self) -> Result<usize, HeapError> {
        let Parts { mut src, pool, big, .. } = self.parts();
        big.trim(pool, &mut src)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut small_chunks = [0; SMALL_BUCKETS];
        for (order, count) in (0u8..).zip(small_chunks.iter_mut()) {
            *count = self.small.chunks(order);
        }
        HeapStats {
            pmm: self.pmm.stats(),
            small_chunks,
            cached_blocks: self.big.cached_blocks(),
            cached_pages: self.big.cached_pages(),
            chunguses: self.pool.chunguses(),
            chunk_infos: self.pool.live_records(),
            live_allocations: self.registry.len(),
            registry_capacity: self.registry.capacity(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn pmm(&self) -> &BitmapPmm {
        &self.pmm
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> HeapConfig {
        self.config
    }
}

impl<M: PageMapper> fmt::Debug for Heap<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
