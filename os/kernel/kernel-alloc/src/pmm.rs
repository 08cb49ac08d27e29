//! # Bitmap physical memory manager
//!
//! One bit per 4 KiB frame, relative to the first allocatable frame of the
//! boot memory map. A set bit means the frame is allocated (or is a hole in
//! the map and therefore never allocatable).
//!
//! The bitmap itself lives in the first allocatable region large enough to
//! hold it and is accessed through the direct map. Its own frames are marked
//! allocated during construction.
//!
//! ```text
//!  start                                                       end
//!    │ bitmap │    free    │ hole (reserved) │   free   │ pad (0) │
//!    ├────────┼────────────┼─────────────────┼──────────┼─────────┤
//!    │ 1 1    │ 0 0 0 0 0  │ 1 1 1 1         │ 0 0 0 0  │ 0 0     │
//! ```
//!
//! Padding bits past the last frame stay zero, so `allocated_blocks` is
//! always the popcount of the whole bitmap.

use crate::PageMapper;
use crate::error::PmmError;
use core::fmt;
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE, PAGE_SIZE_USIZE};
use kernel_memory_addresses::{PhysicalAddress, Size4K};
use kernel_mmap::MemoryMap;
use log::{debug, info, trace};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Frame accounting snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmmStats {
    /// Frames spanned by the bitmap (holes included).
    pub total_blocks: usize,
    /// Frames inside allocatable regions.
    pub allocatable_blocks: usize,
    /// Set bits: allocated frames, holes and the bitmap itself.
    pub allocated_blocks: usize,
    pub free_blocks: usize,
}

impl fmt::Display for PmmStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} frames used ({} free, {} allocatable)",
            self.allocated_blocks, self.total_blocks, self.free_blocks, self.allocatable_blocks
        )
    }
}

/// Iterate the `(word index, mask)` pairs covering frames `first..first + count`.
fn word_masks(first: usize, count: usize) -> impl Iterator<Item = (usize, u64)> {
    let end = first + count;
    let mut frame = first;
    core::iter::from_fn(move || {
        if frame >= end {
            return None;
        }
        let word = frame / BITS_PER_WORD;
        let bit = frame % BITS_PER_WORD;
        let n = (BITS_PER_WORD - bit).min(end - frame);
        let mask = if n == BITS_PER_WORD {
            u64::MAX
        } else {
            ((1u64 << n) - 1) << bit
        };
        frame += n;
        Some((word, mask))
    })
}

#[allow(clippy::cast_possible_truncation)]
const fn frames_between(start: PhysicalAddress, end: PhysicalAddress) -> usize {
    start.frames_until::<Size4K>(end) as usize
}

/// The physical frame allocator.
///
/// All mutation goes through `&mut self`; the kernel keeps the single
/// instance inside the heap context, behind the heap lock.
pub struct BitmapPmm {
    bitmap: &'static mut [u64],
    start: PhysicalAddress,
    total_blocks: usize,
    allocatable_blocks: usize,
    allocated_blocks: usize,
    bitmap_base: PhysicalAddress,
    bitmap_frames: usize,
}

impl BitmapPmm {
    /// Build the bitmap over the allocatable regions of `map`.
    ///
    /// # Errors
    /// * [`PmmError::NoUsableMemory`] if the map has no allocatable frame.
    /// * [`PmmError::NoBitmapRegion`] if no allocatable region fits the bitmap.
    ///
    /// # Safety
    /// * `mapper` must map every allocatable frame of `map` read-write.
    /// * Nothing else may use the allocatable memory of `map` while the
    ///   returned PMM is alive, except through allocations made from it.
    pub unsafe fn new<M: PageMapper>(map: &MemoryMap, mapper: &M) -> Result<Self, PmmError> {
        let (start, end) = map.allocatable_span().ok_or(PmmError::NoUsableMemory)?;
        let total_blocks = frames_between(start, end);
        let words = total_blocks.div_ceil(BITS_PER_WORD);
        let bytes = words * size_of::<u64>();
        let bitmap_frames = bytes.div_ceil(PAGE_SIZE_USIZE);

        let home = map
            .allocatable()
            .find(|r| r.frames >= bitmap_frames as u64)
            .ok_or(PmmError::NoBitmapRegion { bytes })?;

        // SAFETY: the caller guarantees `home` is mapped and unused; it is
        // page aligned and large enough for `words` entries.
        let bitmap = unsafe {
            let ptr = mapper.phys_to_virt(home.start).as_mut_ptr::<u64>();
            core::slice::from_raw_parts_mut(ptr, words)
        };
        bitmap.fill(0);

        let mut pmm = Self {
            bitmap,
            start,
            total_blocks,
            allocatable_blocks: 0,
            allocated_blocks: 0,
            bitmap_base: home.start,
            bitmap_frames,
        };

        // Every frame between two allocatable ranges is a hole.
        let mut cursor = start;
        for range in map.allocatable() {
            if range.start > cursor {
                let first = pmm.index_unchecked(cursor);
                pmm.set_bits(first, frames_between(cursor, range.start));
            }
            pmm.allocatable_blocks += frames_between(range.start, range.end());
            cursor = range.end();
        }

        let first = pmm.index_unchecked(home.start);
        pmm.set_bits(first, bitmap_frames);

        info!(
            "PMM: {} frames from {start}, {} allocatable, {} free, bitmap {words} words at {}",
            pmm.total_blocks,
            pmm.allocatable_blocks,
            pmm.free_blocks(),
            pmm.bitmap_base
        );
        Ok(pmm)
    }

    /// First-fit: claim the lowest run of `n` free frames.
    ///
    /// # Errors
    /// * [`PmmError::EmptyRequest`] for `n == 0`.
    /// * [`PmmError::OutOfMemory`] if no run of `n` frames exists; the bitmap
    ///   is left untouched.
    pub fn allocate_pages(&mut self, n: usize) -> Result<PhysicalAddress, PmmError> {
        if n == 0 {
            return Err(PmmError::EmptyRequest);
        }

        let free = self.free_blocks();
        let run = if n <= free { self.find_run(n) } else { None };
        let Some(first) = run else {
            trace!("PMM: no run of {n} frames ({free} free)");
            return Err(PmmError::OutOfMemory { requested: n, free });
        };

        let newly = self.set_bits(first, n);
        debug_assert_eq!(newly, n);

        let addr = self.address_of(first);
        trace!("PMM: allocated {n} frames at {addr}");
        Ok(addr)
    }

    /// Return `n` frames starting at `addr`.
    ///
    /// Every frame must currently be allocated; on any failure the bitmap is
    /// left untouched.
    ///
    /// # Errors
    /// * [`PmmError::EmptyRequest`] for `n == 0`.
    /// * [`PmmError::InvalidFrame`] if `addr` is misaligned or the range leaves
    ///   the managed span.
    /// * [`PmmError::DoubleFree`] naming the first frame that is already free.
    pub fn free_pages(&mut self, addr: PhysicalAddress, n: usize) -> Result<(), PmmError> {
        if n == 0 {
            return Err(PmmError::EmptyRequest);
        }

        let first = self
            .index_of(addr)
            .filter(|&first| n <= self.total_blocks - first)
            .ok_or(PmmError::InvalidFrame { addr, pages: n })?;

        if let Some(frame) = self.first_clear(first, n) {
            return Err(PmmError::DoubleFree {
                addr: self.address_of(frame),
            });
        }

        for (word, mask) in word_masks(first, n) {
            self.bitmap[word] &= !mask;
        }
        self.allocated_blocks -= n;

        trace!("PMM: freed {n} frames at {addr}");
        Ok(())
    }

    /// Mark frames overlapping `[addr, addr + n pages)` as allocated.
    ///
    /// Used for boot structures the loader left in usable memory. Frames
    /// outside the managed span are ignored, already allocated frames are
    /// skipped. Returns how many frames changed state.
    pub fn reserve(&mut self, addr: PhysicalAddress, n: usize) -> usize {
        let end = addr
            .as_u64()
            .saturating_add((n as u64).saturating_mul(PAGE_SIZE))
            .min(self.end().as_u64());
        let lo = addr.align_down::<Size4K>().max(self.start);
        let hi = PhysicalAddress::new(end).align_up::<Size4K>();
        if hi <= lo {
            return 0;
        }

        let first = self.index_unchecked(lo);
        let newly = self.set_bits(first, frames_between(lo, hi));
        debug!("PMM: reserved {newly} frames in {lo}..{hi}");
        newly
    }

    /// Recount the bitmap and compare it with the frame counter.
    ///
    /// # Errors
    /// [`PmmError::CorruptBitmap`] if the counts disagree or padding bits past
    /// the last frame are set.
    pub fn verify(&self) -> Result<(), PmmError> {
        let actual: usize = self.bitmap.iter().map(|w| w.count_ones() as usize).sum();
        let tail = self.total_blocks % BITS_PER_WORD;
        let padding_dirty = tail != 0
            && self
                .bitmap
                .last()
                .is_some_and(|&w| w & !((1u64 << tail) - 1) != 0);

        if actual != self.allocated_blocks || actual > self.total_blocks || padding_dirty {
            return Err(PmmError::CorruptBitmap {
                counted: self.allocated_blocks,
                actual,
            });
        }
        Ok(())
    }

    /// Whether the frame at `addr` is allocated; `None` outside the span.
    #[must_use]
    pub fn is_allocated(&self, addr: PhysicalAddress) -> Option<bool> {
        let idx = self.index_of(addr.align_down::<Size4K>())?;
        Some(self.bitmap[idx / BITS_PER_WORD] & (1u64 << (idx % BITS_PER_WORD)) != 0)
    }

    #[must_use]
    pub fn stats(&self) -> PmmStats {
        PmmStats {
            total_blocks: self.total_blocks,
            allocatable_blocks: self.allocatable_blocks,
            allocated_blocks: self.allocated_blocks,
            free_blocks: self.free_blocks(),
        }
    }

    /// First managed frame.
    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.start
    }

    /// One past the last managed byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + (self.total_blocks as u64) * PAGE_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    #[inline]
    #[must_use]
    pub const fn allocatable_blocks(&self) -> usize {
        self.allocatable_blocks
    }

    #[inline]
    #[must_use]
    pub const fn allocated_blocks(&self) -> usize {
        self.allocated_blocks
    }

    #[inline]
    #[must_use]
    pub const fn free_blocks(&self) -> usize {
        self.total_blocks - self.allocated_blocks
    }

    /// Physical location and size (in frames) of the bitmap itself.
    #[inline]
    #[must_use]
    pub const fn bitmap_location(&self) -> (PhysicalAddress, usize) {
        (self.bitmap_base, self.bitmap_frames)
    }

    /// The raw bitmap words.
    #[inline]
    #[must_use]
    pub fn bitmap(&self) -> &[u64] {
        self.bitmap
    }

    fn index_of(&self, addr: PhysicalAddress) -> Option<usize> {
        if !addr.is_aligned::<Size4K>() || addr < self.start {
            return None;
        }
        let idx = frames_between(self.start, addr);
        (idx < self.total_blocks).then_some(idx)
    }

    /// Index of an aligned address already known to be inside the span.
    fn index_unchecked(&self, addr: PhysicalAddress) -> usize {
        debug_assert!(addr >= self.start && addr.is_aligned::<Size4K>());
        frames_between(self.start, addr)
    }

    fn address_of(&self, idx: usize) -> PhysicalAddress {
        self.start + ((idx as u64) << PAGE_SHIFT)
    }

    /// Set the bits of `first..first + count`, returning how many were clear.
    fn set_bits(&mut self, first: usize, count: usize) -> usize {
        let mut newly = 0;
        for (word, mask) in word_masks(first, count) {
            newly += (mask & !self.bitmap[word]).count_ones() as usize;
            self.bitmap[word] |= mask;
        }
        self.allocated_blocks += newly;
        newly
    }

    fn first_clear(&self, first: usize, count: usize) -> Option<usize> {
        word_masks(first, count).find_map(|(word, mask)| {
            let missing = mask & !self.bitmap[word];
            (missing != 0).then(|| word * BITS_PER_WORD + missing.trailing_zeros() as usize)
        })
    }

    /// Lowest index starting `count` consecutive clear bits.
    ///
    /// Fully used and fully free words are handled whole; only mixed words
    /// are walked bit by bit.
    fn find_run(&self, count: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        let mut frame = 0;

        while frame < self.total_blocks {
            let word_idx = frame / BITS_PER_WORD;
            let word = self.bitmap[word_idx];
            let word_end = ((word_idx + 1) * BITS_PER_WORD).min(self.total_blocks);

            if frame % BITS_PER_WORD == 0 && word == u64::MAX {
                run_len = 0;
                frame = word_end;
                continue;
            }

            if frame % BITS_PER_WORD == 0 && word == 0 {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += word_end - frame;
                if run_len >= count {
                    return Some(run_start);
                }
                frame = word_end;
                continue;
            }

            if word & (1u64 << (frame % BITS_PER_WORD)) == 0 {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len >= count {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
            frame += 1;
        }

        None
    }
}

impl fmt::Debug for BitmapPmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapPmm")
            .field("start", &self.start)
            .field("total_blocks", &self.total_blocks)
            .field("allocatable_blocks", &self.allocatable_blocks)
            .field("allocated_blocks", &self.allocated_blocks)
            .field("bitmap_base", &self.bitmap_base)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimMemory;
    use kernel_mmap::{MemoryKind, MemoryRegion};

    #[test]
    fn word_masks_split_at_word_boundaries() {
        let masks: Vec<_> = word_masks(62, 68).collect();
        assert_eq!(masks, [(0, 0b11 << 62), (1, u64::MAX), (2, 0b11)]);
        assert_eq!(word_masks(5, 0).count(), 0);
    }

    #[test]
    fn clean_bitmap_layout() {
        let mem = SimMemory::new(11);
        let pmm = mem.pmm();
        assert_eq!(pmm.start(), mem.phys_base());
        assert_eq!(pmm.total_blocks(), 11);
        assert_eq!(pmm.allocatable_blocks(), 11);
        // Frame 0 holds the bitmap.
        assert_eq!(pmm.bitmap(), &[0b1]);
        assert_eq!(pmm.bitmap_location(), (mem.phys_base(), 1));
        assert_eq!(pmm.free_blocks(), 10);
        pmm.verify().unwrap();
    }

    #[test]
    fn holes_are_marked_allocated() {
        let mem = SimMemory::new(10);
        let base = mem.phys_base().as_u64();
        let page = PAGE_SIZE;
        let map = MemoryMap::new(&[
            MemoryRegion::new(PhysicalAddress::new(base), 4 * page, MemoryKind::Usable),
            MemoryRegion::new(
                PhysicalAddress::new(base + 4 * page),
                2 * page,
                MemoryKind::Reserved,
            ),
            MemoryRegion::new(PhysicalAddress::new(base + 6 * page), 4 * page, MemoryKind::Usable),
        ])
        .unwrap();
        let mut pmm = unsafe { BitmapPmm::new(&map, mem.mapper()) }.unwrap();

        assert_eq!(pmm.total_blocks(), 10);
        assert_eq!(pmm.allocatable_blocks(), 8);
        assert_eq!(pmm.bitmap(), &[0b11_0001]);
        assert_eq!(pmm.allocated_blocks(), 3);

        // A run of four must skip the hole.
        let run = pmm.allocate_pages(4).unwrap();
        assert_eq!(run.as_u64(), base + 6 * page);
        assert_eq!(pmm.allocate_pages(3).unwrap().as_u64(), base + page);
        assert_eq!(
            pmm.allocate_pages(1),
            Err(PmmError::OutOfMemory {
                requested: 1,
                free: 0
            })
        );
        pmm.verify().unwrap();
    }

    #[test]
    fn skips_whole_words() {
        let mem = SimMemory::new(200);
        let mut pmm = mem.pmm();
        // Fill the first two words completely.
        let a = pmm.allocate_pages(127).unwrap();
        assert_eq!(pmm.bitmap()[..2], [u64::MAX, u64::MAX]);
        let b = pmm.allocate_pages(70).unwrap();
        assert_eq!(b - a, 127 * PAGE_SIZE);
        assert_eq!(pmm.free_blocks(), 2);
        pmm.free_pages(a, 127).unwrap();
        // Freed run in the first words is preferred again.
        assert_eq!(pmm.allocate_pages(64).unwrap(), a);
        pmm.verify().unwrap();
    }

    #[test]
    fn partial_double_free_is_rejected_whole() {
        let mem = SimMemory::new(16);
        let mut pmm = mem.pmm();
        let a = pmm.allocate_pages(4).unwrap();
        pmm.free_pages(a + 2 * PAGE_SIZE, 1).unwrap();

        let before = pmm.bitmap().to_vec();
        let err = pmm.free_pages(a, 4).unwrap_err();
        assert_eq!(err, PmmError::DoubleFree { addr: a + 2 * PAGE_SIZE });
        assert_eq!(pmm.bitmap(), before.as_slice());
    }

    #[test]
    fn rejects_foreign_frames() {
        let mem = SimMemory::new(8);
        let mut pmm = mem.pmm();
        let start = pmm.start();
        assert_eq!(pmm.allocate_pages(0), Err(PmmError::EmptyRequest));
        assert_eq!(pmm.free_pages(start, 0), Err(PmmError::EmptyRequest));
        assert!(matches!(
            pmm.free_pages(start + 0x10, 1),
            Err(PmmError::InvalidFrame { .. })
        ));
        assert!(matches!(
            pmm.free_pages(start + 7 * PAGE_SIZE, 2),
            Err(PmmError::InvalidFrame { pages: 2, .. })
        ));
        assert!(matches!(
            pmm.free_pages(PhysicalAddress::new(0x1000), 1),
            Err(PmmError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn reserve_clips_and_skips() {
        let mem = SimMemory::new(8);
        let mut pmm = mem.pmm();
        let start = pmm.start();

        // Straddles the start of the span and the bitmap frame.
        let below = PhysicalAddress::new(start.as_u64() - 2 * PAGE_SIZE);
        assert_eq!(pmm.reserve(below, 4), 1);
        assert_eq!(pmm.is_allocated(start + PAGE_SIZE), Some(true));

        // Unaligned tail rounds out to whole frames.
        assert_eq!(pmm.reserve(start + 5 * PAGE_SIZE + 8, 1), 2);
        assert_eq!(pmm.reserve(start + 100 * PAGE_SIZE, 4), 0);
        assert_eq!(pmm.allocated_blocks(), 4);
        pmm.verify().unwrap();
    }

    #[test]
    fn verify_detects_tampering() {
        let mem = SimMemory::new(8);
        let mut pmm = mem.pmm();
        pmm.bitmap[0] |= 1 << 5;
        assert_eq!(
            pmm.verify(),
            Err(PmmError::CorruptBitmap { counted: 1, actual: 2 })
        );
        pmm.bitmap[0] = 1 | (1 << 40);
        assert!(pmm.verify().is_err());
    }

    #[test]
    fn empty_map_is_rejected() {
        let mem = SimMemory::new(1);
        let map = MemoryMap::new(&[MemoryRegion::new(
            mem.phys_base(),
            PAGE_SIZE,
            MemoryKind::Reserved,
        )])
        .unwrap();
        let err = unsafe { BitmapPmm::new(&map, mem.mapper()) }.unwrap_err();
        assert_eq!(err, PmmError::NoUsableMemory);
    }
}
