//! `ChunkInfo` records and their handles.
//!
//! A record describes either one page carved into equally sized small blocks
//! or one run of pages backing a single big allocation. Records live in
//! Chungus slots, never next to the memory they describe.

use super::list::{Linked, ListId};
use crate::config::{MIN_BLOCK_SIZE, PAGE_SIZE};
use bitfield_struct::bitfield;
use core::fmt;
use core::ptr::NonNull;
use kernel_memory_addresses::VirtualAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Slot claimed but not yet describing memory (or released).
    Vacant,
    /// One page split into `64 << order` byte blocks.
    Small,
    /// A whole-page allocation or a cached run of pages.
    Big,
}

impl ChunkKind {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::Small,
            2 => Self::Big,
            _ => Self::Vacant,
        }
    }
}

/// Packed bookkeeping word of a [`ChunkInfo`].
#[bitfield(u64)]
pub struct ChunkTag {
    #[bits(2)]
    pub kind: ChunkKind,

    /// Small bucket order; block size is `64 << order`.
    #[bits(3)]
    pub order: u8,

    /// The list currently holding the record.
    #[bits(3)]
    pub list: ListId,

    #[bits(56)]
    __: u64,
}

/// Metadata for one chunk or big block.
#[repr(C)]
pub struct ChunkInfo {
    base: VirtualAddress,
    /// Bytes covered by the backing page range.
    size: usize,
    /// Small chunks: one bit per block, set = free.
    bitmap: u64,
    tag: ChunkTag,
    prev: Option<ChunkHandle>,
    next: Option<ChunkHandle>,
}

const _: () = assert!(size_of::<ChunkInfo>() == 48);

impl ChunkInfo {
    pub(crate) const VACANT: Self = Self {
        base: VirtualAddress::zero(),
        size: 0,
        bitmap: 0,
        tag: ChunkTag::new(),
        prev: None,
        next: None,
    };
}

/// Block size of small bucket `order`.
#[inline]
pub const fn block_size(order: u8) -> usize {
    MIN_BLOCK_SIZE << order
}

/// Blocks per one-page chunk of bucket `order`.
#[inline]
pub const fn blocks_per_chunk(order: u8) -> usize {
    PAGE_SIZE / block_size(order)
}

/// Bitmap of a chunk with every block free.
#[inline]
pub const fn full_mask(order: u8) -> u64 {
    let blocks = blocks_per_chunk(order);
    if blocks == u64::BITS as usize {
        u64::MAX
    } else {
        (1u64 << blocks) - 1
    }
}

/// Pointer to a claimed [`ChunkInfo`] slot.
///
/// Handles are only minted by the Chungus pool for slots it has just
/// claimed, and every access happens under the heap's `&mut self`. A handle
/// must not be used after its slot is released.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ChunkHandle(NonNull<ChunkInfo>);

const _: () = assert!(size_of::<Option<ChunkHandle>>() == size_of::<usize>());

macro_rules! field {
    ($get:ident, $set:ident, $ty:ty) => {
        #[inline]
        pub fn $get(self) -> $ty {
            // SAFETY: the handle points at a live, claimed slot.
            unsafe { (*self.0.as_ptr()).$get }
        }

        #[inline]
        pub fn $set(self, value: $ty) {
            // SAFETY: the handle points at a live, claimed slot.
            unsafe { (*self.0.as_ptr()).$get = value }
        }
    };
}

impl ChunkHandle {
    /// # Safety
    /// `ptr` must point at a claimed, initialized slot.
    pub(crate) const unsafe fn from_raw(ptr: NonNull<ChunkInfo>) -> Self {
        Self(ptr)
    }

    #[inline]
    pub const fn as_ptr(self) -> *mut ChunkInfo {
        self.0.as_ptr()
    }

    field!(base, set_base, VirtualAddress);
    field!(size, set_size, usize);
    field!(bitmap, set_bitmap, u64);
    field!(tag, set_tag, ChunkTag);

    #[inline]
    pub fn kind(self) -> ChunkKind {
        self.tag().kind()
    }

    #[inline]
    pub fn order(self) -> u8 {
        self.tag().order()
    }

    /// Pages backing this record.
    #[inline]
    pub fn pages(self) -> usize {
        self.size() / PAGE_SIZE
    }

    /// Turn the record into a fully free small chunk over one page.
    pub fn init_small(self, base: VirtualAddress, order: u8) {
        self.set_base(base);
        self.set_size(PAGE_SIZE);
        self.set_bitmap(full_mask(order));
        self.set_tag(self.tag().with_kind(ChunkKind::Small).with_order(order));
    }

    /// Turn the record into a big block of `pages` pages.
    pub fn init_big(self, base: VirtualAddress, pages: usize) {
        self.set_base(base);
        self.set_size(pages * PAGE_SIZE);
        self.set_bitmap(0);
        self.set_tag(self.tag().with_kind(ChunkKind::Big).with_order(0));
    }

    /// Whether `addr` lies inside the backing range.
    #[inline]
    pub fn contains(self, addr: VirtualAddress) -> bool {
        addr >= self.base() && addr.as_u64() - self.base().as_u64() < self.size() as u64
    }
}

impl Linked for ChunkHandle {
    #[inline]
    fn prev(self) -> Option<Self> {
        // SAFETY: the handle points at a live, claimed slot.
        unsafe { (*self.0.as_ptr()).prev }
    }

    #[inline]
    fn next(self) -> Option<Self> {
        // SAFETY: see above.
        unsafe { (*self.0.as_ptr()).next }
    }

    #[inline]
    fn set_prev(self, prev: Option<Self>) {
        // SAFETY: see above.
        unsafe { (*self.0.as_ptr()).prev = prev }
    }

    #[inline]
    fn set_next(self, next: Option<Self>) {
        // SAFETY: see above.
        unsafe { (*self.0.as_ptr()).next = next }
    }

    #[inline]
    fn owner(self) -> ListId {
        self.tag().list()
    }

    #[inline]
    fn set_owner(self, owner: ListId) {
        self.set_tag(self.tag().with_list(owner));
    }

    #[inline]
    fn class(self) -> u8 {
        self.order()
    }
}

impl fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        f.debug_struct("Chunk")
            .field("at", &self.0)
            .field("base", &self.base())
            .field("size", &self.size())
            .field("bitmap", &format_args!("{:#018x}", self.bitmap()))
            .field("kind", &tag.kind())
            .field("order", &tag.order())
            .field("list", &tag.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes() {
        assert_eq!(block_size(0), 64);
        assert_eq!(block_size(5), 2048);
        assert_eq!(blocks_per_chunk(0), 64);
        assert_eq!(blocks_per_chunk(5), 2);
        assert_eq!(full_mask(0), u64::MAX);
        assert_eq!(full_mask(1), u64::from(u32::MAX));
        assert_eq!(full_mask(5), 0b11);
    }

    #[test]
    fn tag_fields_do_not_bleed() {
        let tag = ChunkTag::new()
            .with_kind(ChunkKind::Big)
            .with_order(7)
            .with_list(ListId::Cached);
        assert_eq!(tag.kind(), ChunkKind::Big);
        assert_eq!(tag.order(), 7);
        assert_eq!(tag.list(), ListId::Cached);
        assert_eq!(tag.into_bits(), 0b011_111_10);
        assert_eq!(ChunkTag::new().kind(), ChunkKind::Vacant);
    }

    #[test]
    fn handle_accessors() {
        let slot = Box::leak(Box::new(ChunkInfo::VACANT));
        let h = unsafe { ChunkHandle::from_raw(NonNull::from(slot)) };
        h.init_small(VirtualAddress::new(0x4000), 1);
        assert_eq!(h.kind(), ChunkKind::Small);
        assert_eq!(h.order(), 1);
        assert_eq!(h.bitmap(), full_mask(1));
        assert!(h.contains(VirtualAddress::new(0x4FFF)));
        assert!(!h.contains(VirtualAddress::new(0x5000)));
        assert!(!h.contains(VirtualAddress::new(0x3FFF)));

        h.init_big(VirtualAddress::new(0x8000), 3);
        assert_eq!(h.kind(), ChunkKind::Big);
        assert_eq!(h.pages(), 3);
        assert_eq!(h.bitmap(), 0);
        assert_eq!(h.owner(), ListId::Unlinked);
    }
}
