//! # Chungus pool
//!
//! `ChunkInfo` records cannot come from the heap they describe, so they are
//! carved out of dedicated pages. Each such page is a [`Chungus`]: a small
//! header with a free-slot bitmap followed by as many records as fit.
//!
//! ```text
//! ┌──────────── one page ────────────────────────────────────┐
//! │ free[2] │ prev │ next │ live │ list │ slot 0 │ … │ slot 83 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Chunguses with a free slot sit on the partial list, exhausted ones on the
//! full list. A Chungus whose slots are all free again goes back to the PMM,
//! unless it is the only one left with free slots.

use super::chunk::{ChunkHandle, ChunkInfo, ChunkKind};
use super::list::{Linked, List, ListId};
use super::page_source::PageSource;
use crate::PageMapper;
use crate::config::PAGE_SIZE;
use crate::error::HeapError;
use core::mem::{MaybeUninit, offset_of};
use core::ptr::NonNull;
use kernel_memory_addresses::{Size4K, VirtualAddress};
use log::debug;

#[repr(C)]
struct ChungusHeader {
    /// One bit per slot, set = free.
    free: [u64; 2],
    prev: Option<ChungusHandle>,
    next: Option<ChungusHandle>,
    live: u32,
    list: ListId,
}

/// Records per Chungus.
pub const SLOTS: usize = (PAGE_SIZE - size_of::<ChungusHeader>()) / size_of::<ChunkInfo>();

#[repr(C)]
pub struct Chungus {
    header: ChungusHeader,
    slots: [MaybeUninit<ChunkInfo>; SLOTS],
}

const _: () = {
    assert!(SLOTS <= 2 * u64::BITS as usize);
    assert!(size_of::<Chungus>() <= PAGE_SIZE);
    assert!(align_of::<Chungus>() <= PAGE_SIZE);
    assert!(SLOTS == 84);
};

/// Free-slot bitmap of a fresh Chungus.
const ALL_FREE: [u64; 2] = [u64::MAX, (1u64 << (SLOTS - 64)) - 1];

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct ChungusHandle(NonNull<Chungus>);

impl ChungusHandle {
    fn header(self) -> *mut ChungusHeader {
        // SAFETY: handles point at live Chungus pages.
        unsafe { &raw mut (*self.0.as_ptr()).header }
    }

    fn base(self) -> VirtualAddress {
        VirtualAddress::from_nonnull(self.0)
    }

    fn free_bits(self) -> [u64; 2] {
        // SAFETY: see `header`.
        unsafe { (*self.header()).free }
    }

    fn set_free_bits(self, free: [u64; 2]) {
        // SAFETY: see `header`.
        unsafe { (*self.header()).free = free }
    }

    fn live(self) -> u32 {
        // SAFETY: see `header`.
        unsafe { (*self.header()).live }
    }

    fn set_live(self, live: u32) {
        // SAFETY: see `header`.
        unsafe { (*self.header()).live = live }
    }

    fn slot(self, index: usize) -> NonNull<ChunkInfo> {
        debug_assert!(index < SLOTS);
        // SAFETY: in bounds of the page.
        let slot = unsafe { &raw mut (*self.0.as_ptr()).slots[index] };
        // SAFETY: derived from a non-null page pointer.
        unsafe { NonNull::new_unchecked(slot.cast::<ChunkInfo>()) }
    }

    /// The Chungus holding `info` and the slot index inside it.
    #[allow(clippy::cast_possible_truncation)]
    fn of(info: ChunkHandle) -> (Self, usize) {
        let addr = VirtualAddress::from_ptr(info.as_ptr());
        let page = addr.align_down::<Size4K>();
        let offset = (addr - page) as usize - offset_of!(Chungus, slots);
        debug_assert!(offset.is_multiple_of(size_of::<ChunkInfo>()));
        // SAFETY: records only ever live inside Chungus pages.
        let chungus = unsafe { NonNull::new_unchecked(page.as_mut_ptr::<Chungus>()) };
        (Self(chungus), offset / size_of::<ChunkInfo>())
    }
}

impl Linked for ChungusHandle {
    fn prev(self) -> Option<Self> {
        // SAFETY: see `header`.
        unsafe { (*self.header()).prev }
    }

    fn next(self) -> Option<Self> {
        // SAFETY: see `header`.
        unsafe { (*self.header()).next }
    }

    fn set_prev(self, prev: Option<Self>) {
        // SAFETY: see `header`.
        unsafe { (*self.header()).prev = prev }
    }

    fn set_next(self, next: Option<Self>) {
        // SAFETY: see `header`.
        unsafe { (*self.header()).next = next }
    }

    fn owner(self) -> ListId {
        // SAFETY: see `header`.
        unsafe { (*self.header()).list }
    }

    fn set_owner(self, owner: ListId) {
        // SAFETY: see `header`.
        unsafe { (*self.header()).list = owner }
    }
}

/// Source of `ChunkInfo` records.
pub(crate) struct ChunguousPool {
    partial: List<ChungusHandle>,
    full: List<ChungusHandle>,
    live: usize,
}

impl ChunguousPool {
    pub const fn new() -> Self {
        Self {
            partial: List::new(ListId::Partial),
            full: List::new(ListId::Full),
            live: 0,
        }
    }

    /// Chunguses currently backed by a page.
    pub const fn chunguses(&self) -> usize {
        self.partial.len() + self.full.len()
    }

    /// Claimed records.
    pub const fn live_records(&self) -> usize {
        self.live
    }

    /// Claim a vacant, unlinked record.
    pub fn claim<M: PageMapper>(
        &mut self,
        pages: &mut PageSource<'_, M>,
    ) -> Result<ChunkHandle, HeapError> {
        let chungus = match self.partial.front() {
            Some(chungus) => chungus,
            None => self.grow(pages)?,
        };

        let mut free = chungus.free_bits();
        let word = usize::from(free[0] == 0);
        let bit = free[word].trailing_zeros() as usize;
        free[word] &= !(1u64 << bit);
        chungus.set_free_bits(free);
        chungus.set_live(chungus.live() + 1);
        self.live += 1;

        if free == [0, 0] {
            self.partial.remove(chungus);
            self.full.push_front(chungus);
        }

        let slot = chungus.slot(word * 64 + bit);
        // SAFETY: the slot lies inside the Chungus page and was free.
        unsafe { slot.write(ChunkInfo::VACANT) };
        // SAFETY: just claimed and initialized.
        Ok(unsafe { ChunkHandle::from_raw(slot) })
    }

    /// Return a record. The handle must not be used afterwards.
    ///
    /// # Errors
    /// Only if reaping an empty Chungus fails to return its page.
    ///
    /// # Panics
    /// If the record is still linked or its slot is already free.
    pub fn release<M: PageMapper>(
        &mut self,
        info: ChunkHandle,
        pages: &mut PageSource<'_, M>,
    ) -> Result<(), HeapError> {
        assert_eq!(info.owner(), ListId::Unlinked, "releasing a linked ChunkInfo");
        let (chungus, index) = ChungusHandle::of(info);

        let mut free = chungus.free_bits();
        let (word, bit) = (index / 64, index % 64);
        assert!(free[word] & (1u64 << bit) == 0, "ChunkInfo slot released twice");
        let was_full = free == [0, 0];
        free[word] |= 1u64 << bit;
        chungus.set_free_bits(free);
        chungus.set_live(chungus.live() - 1);
        self.live -= 1;

        info.set_tag(info.tag().with_kind(ChunkKind::Vacant));

        if was_full {
            self.full.remove(chungus);
            self.partial.push_front(chungus);
        }

        if chungus.live() == 0 && self.partial.len() > 1 {
            self.partial.remove(chungus);
            pages.release(chungus.base(), 1)?;
            debug!("heap: returned empty Chungus at {}", chungus.base());
        }
        Ok(())
    }

    fn grow<M: PageMapper>(
        &mut self,
        pages: &mut PageSource<'_, M>,
    ) -> Result<ChungusHandle, HeapError> {
        let base = pages.allocate_zeroed(1)?;
        // SAFETY: a zeroed, exclusively owned, page-aligned page.
        let chungus =
            ChungusHandle(unsafe { NonNull::new_unchecked(base.as_mut_ptr::<Chungus>()) });
        chungus.set_free_bits(ALL_FREE);
        self.partial.push_front(chungus);
        debug!(
            "heap: new Chungus at {base} ({SLOTS} slots, {} in use)",
            self.chunguses()
        );
        Ok(chungus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimMemory;

    #[test]
    fn claims_lowest_slot_first() {
        let mem = SimMemory::new(16);
        let mut pmm = mem.pmm();
        let mut src = PageSource { pmm: &mut pmm, mapper: mem.mapper() };
        let mut pool = ChunguousPool::new();

        let a = pool.claim(&mut src).unwrap();
        let b = pool.claim(&mut src).unwrap();
        let (ca, ia) = ChungusHandle::of(a);
        let (cb, ib) = ChungusHandle::of(b);
        assert!(ca == cb);
        assert_eq!((ia, ib), (0, 1));
        assert_eq!(a.kind(), ChunkKind::Vacant);
        assert_eq!(pool.chunguses(), 1);
        assert_eq!(pool.live_records(), 2);

        pool.release(a, &mut src).unwrap();
        let c = pool.claim(&mut src).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn full_chungus_moves_and_new_one_grows() {
        let mem = SimMemory::new(16);
        let mut pmm = mem.pmm();
        let mut src = PageSource { pmm: &mut pmm, mapper: mem.mapper() };
        let mut pool = ChunguousPool::new();

        let first: Vec<_> = (0..SLOTS).map(|_| pool.claim(&mut src).unwrap()).collect();
        assert_eq!(pool.full.len(), 1);
        assert!(pool.partial.is_empty());

        let extra = pool.claim(&mut src).unwrap();
        assert_eq!(pool.chunguses(), 2);
        assert!(ChungusHandle::of(extra).0 != ChungusHandle::of(first[0]).0);

        // Releasing one record from the full Chungus makes it partial again.
        pool.release(first[5], &mut src).unwrap();
        assert_eq!(pool.full.len(), 0);
        assert_eq!(pool.partial.len(), 2);
    }

    #[test]
    fn empty_chungus_is_reaped_unless_last() {
        let mem = SimMemory::new(16);
        let mut pmm = mem.pmm();
        let free_at_start = pmm.free_blocks();
        let mut src = PageSource { pmm: &mut pmm, mapper: mem.mapper() };
        let mut pool = ChunguousPool::new();

        let records: Vec<_> = (0..=SLOTS).map(|_| pool.claim(&mut src).unwrap()).collect();
        assert_eq!(src.free_pages(), free_at_start - 2);

        // Empty the first (full) Chungus; the second still has free slots.
        for &r in &records[..SLOTS] {
            pool.release(r, &mut src).unwrap();
        }
        assert_eq!(pool.chunguses(), 1);
        assert_eq!(src.free_pages(), free_at_start - 1);

        // The last Chungus with free slots stays even when empty.
        pool.release(records[SLOTS], &mut src).unwrap();
        assert_eq!(pool.chunguses(), 1);
        assert_eq!(pool.live_records(), 0);
        assert_eq!(src.free_pages(), free_at_start - 1);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_release_panics() {
        let mem = SimMemory::new(16);
        let mut pmm = mem.pmm();
        let mut src = PageSource { pmm: &mut pmm, mapper: mem.mapper() };
        let mut pool = ChunguousPool::new();
        let a = pool.claim(&mut src).unwrap();
        let _keep = pool.claim(&mut src).unwrap();
        pool.release(a, &mut src).unwrap();
        pool.release(a, &mut src).unwrap();
    }
}
