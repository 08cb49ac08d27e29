//! # Small buckets
//!
//! Requests up to [`MAX_SMALL_SIZE`] bytes are rounded up to a power of two
//! and served from one-page chunks split into blocks of that size. Each
//! bucket keeps chunks with at least one free block on its partial list and
//! exhausted chunks on its full list. A chunk whose blocks are all free again
//! is handed to the big-block allocator, which may cache the page for reuse
//! by any bucket.

use super::big_block::BigBlockAllocator;
use super::chunk::{ChunkHandle, ChunkKind, block_size, full_mask};
use super::chungus::ChunguousPool;
use super::list::{List, ListId};
use super::page_source::PageSource;
use crate::PageMapper;
use crate::config::{MAX_SMALL_SIZE, MIN_BLOCK_SIZE, SMALL_BUCKETS};
use crate::error::HeapError;
use kernel_memory_addresses::VirtualAddress;
use log::trace;

/// Bucket order serving a request of `size` bytes (`size <= MAX_SMALL_SIZE`).
#[allow(clippy::cast_possible_truncation)]
pub const fn order_for(size: usize) -> u8 {
    debug_assert!(size <= MAX_SMALL_SIZE);
    if size <= MIN_BLOCK_SIZE {
        return 0;
    }
    (size.next_power_of_two().trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as u8
}

struct Bucket {
    partial: List<ChunkHandle>,
    full: List<ChunkHandle>,
}

impl Bucket {
    const fn new(order: u8) -> Self {
        Self {
            partial: List::with_class(ListId::Partial, order),
            full: List::with_class(ListId::Full, order),
        }
    }
}

pub(crate) struct SmallBucketAllocator {
    buckets: [Bucket; SMALL_BUCKETS],
}

impl SmallBucketAllocator {
    pub const fn new() -> Self {
        let mut buckets = [const { Bucket::new(0) }; SMALL_BUCKETS];
        let mut order = 1u8;
        while (order as usize) < SMALL_BUCKETS {
            buckets[order as usize] = Bucket::new(order);
            order += 1;
        }
        Self { buckets }
    }

    /// Chunks currently owned by bucket `order`.
    pub const fn chunks(&self, order: u8) -> usize {
        let bucket = &self.buckets[order as usize];
        bucket.partial.len() + bucket.full.len()
    }

    /// Carve the lowest free block out of the first partial chunk of
    /// bucket `order`, refilling the bucket first if it has none.
    pub fn alloc<M: PageMapper>(
        &mut self,
        order: u8,
        pool: &mut ChunguousPool,
        big: &mut BigBlockAllocator,
        src: &mut PageSource<'_, M>,
    ) -> Result<(VirtualAddress, ChunkHandle), HeapError> {
        let bucket = &mut self.buckets[usize::from(order)];
        let chunk = match bucket.partial.front() {
            Some(chunk) => chunk,
            None => {
                let chunk = Self::refill(order, pool, big, src)?;
                bucket.partial.push_front(chunk);
                chunk
            }
        };

        let bitmap = chunk.bitmap();
        if bitmap == 0 {
            return Err(HeapError::Corrupt("exhausted chunk on a partial list"));
        }
        let index = bitmap.trailing_zeros();
        let bitmap = bitmap & !(1u64 << index);
        chunk.set_bitmap(bitmap);

        if bitmap == 0 {
            bucket.partial.remove(chunk);
            bucket.full.push_front(chunk);
        }

        let addr = chunk.base() + u64::from(index) * block_size(order) as u64;
        trace!("heap: {}-byte block {addr}", block_size(order));
        Ok((addr, chunk))
    }

    /// Return the block at `addr` to `chunk`.
    ///
    /// # Errors
    /// * [`HeapError::DoubleFree`] if the block is already free.
    /// * [`HeapError::Corrupt`] if `addr` is not a block boundary of `chunk`.
    pub fn free<M: PageMapper>(
        &mut self,
        chunk: ChunkHandle,
        addr: VirtualAddress,
        pool: &mut ChunguousPool,
        big: &mut BigBlockAllocator,
        src: &mut PageSource<'_, M>,
    ) -> Result<(), HeapError> {
        if chunk.kind() != ChunkKind::Small || !chunk.contains(addr) {
            return Err(HeapError::Corrupt("registry entry outside its chunk"));
        }
        let order = chunk.order();
        let size = block_size(order) as u64;
        let offset = addr - chunk.base();
        if !offset.is_multiple_of(size) {
            return Err(HeapError::Corrupt("registry entry not on a block boundary"));
        }

        let bit = 1u64 << (offset / size);
        let bitmap = chunk.bitmap();
        if bitmap & bit != 0 {
            return Err(HeapError::DoubleFree(addr));
        }

        let bucket = &mut self.buckets[usize::from(order)];
        if bitmap == 0 {
            bucket.full.remove(chunk);
        } else {
            bucket.partial.remove(chunk);
        }

        let bitmap = bitmap | bit;
        chunk.set_bitmap(bitmap);
        trace!("heap: freed {size}-byte block {addr}");

        if bitmap == full_mask(order) {
            trace!("heap: {size}-byte chunk {} is empty", chunk.base());
            return big.retire(chunk, pool, src);
        }
        bucket.partial.push_front(chunk);
        Ok(())
    }

    /// A fresh, fully free chunk for bucket `order`: a cached one-page block
    /// if there is one, otherwise a new record over a new page.
    fn refill<M: PageMapper>(
        order: u8,
        pool: &mut ChunguousPool,
        big: &mut BigBlockAllocator,
        src: &mut PageSource<'_, M>,
    ) -> Result<ChunkHandle, HeapError> {
        if let Some(chunk) = big.take_exact(1) {
            chunk.init_small(chunk.base(), order);
            trace!("heap: recycled page {} as a {}-byte chunk", chunk.base(), block_size(order));
            return Ok(chunk);
        }

        let chunk = pool.claim(src)?;
        match big.fresh_pages(1, pool, src) {
            Ok(base) => {
                chunk.init_small(base, order);
                trace!("heap: new {}-byte chunk at {base}", block_size(order));
                Ok(chunk)
            }
            Err(e) => {
                pool.release(chunk, src)?;
                Err(e)
            }
        }
    }
}
