//! # Physical and Virtual Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses handed around by the
//! physical memory manager and the kernel heap.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`MemoryAddress`] | A raw 64-bit address without a space attached. |
//! | [`PhysicalAddress`] | Physical memory (frames handed out by the PMM). |
//! | [`VirtualAddress`] | Kernel-addressable memory (direct map, heap blocks). |
//!
//! The PMM only ever deals in [`PhysicalAddress`]es; the heap only in
//! [`VirtualAddress`]es. The page mapper is the single place where one turns
//! into the other, and these types keep the two from being mixed up by
//! accident.
//!
//! ## Page Sizes
//!
//! Frames are 4 KiB ([`Size4K`]). The [`PageSize`] trait carries the
//! [`SIZE`](PageSize::SIZE) and [`SHIFT`](PageSize::SHIFT) constants used by
//! the alignment helpers.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_2042);
//! assert_eq!(pa.align_down::<Size4K>().as_u64(), 0x0010_2000);
//! assert_eq!(pa.align_up::<Size4K>().as_u64(), 0x0010_3000);
//! assert!(pa.align_down::<Size4K>().is_aligned::<Size4K>());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_address;
mod page_size;
mod physical_address;
mod virtual_address;

pub use memory_address::MemoryAddress;
pub use page_size::{PageSize, Size4K};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Round `value` up to the next multiple of `align` (a power of two).
///
/// Returns `None` if the result does not fit into a `u64`.
#[inline]
#[must_use]
pub const fn checked_align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to the previous multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(checked_align_up(0x1001, 0x1000), Some(0x2000));
        assert_eq!(checked_align_up(0x1000, 0x1000), Some(0x1000));
        assert_eq!(checked_align_up(u64::MAX - 10, 0x1000), None);
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(align_down(0x40, 64), 0x40);
    }

    #[test]
    fn physical_alignment() {
        let a = PhysicalAddress::new(0x12345);
        assert_eq!(a.align_down::<Size4K>().as_u64(), 0x12000);
        assert_eq!(a.align_up::<Size4K>().as_u64(), 0x13000);
        assert!(!a.is_aligned::<Size4K>());
        assert!(a.align_down::<Size4K>().is_aligned::<Size4K>());
    }

    #[test]
    fn frame_distance() {
        let start = PhysicalAddress::new(0x10_0000);
        let frame = PhysicalAddress::new(0x10_3000);
        assert_eq!(frame - start, 0x3000);
        assert_eq!(start.frames_until::<Size4K>(frame), 3);
        assert_eq!((start + 0x3000), frame);
    }

    #[test]
    fn virtual_pointers_round_trip() {
        let mut word = 0u64;
        let va = VirtualAddress::from_ptr(&raw mut word);
        assert_eq!(va.as_mut_ptr::<u64>(), &raw mut word);
        assert_eq!(va.as_usize(), (&raw const word) as usize);
    }

    #[test]
    fn virtual_alignment() {
        let va = VirtualAddress::new(0xFFFF_8880_0010_2FC0);
        let base = va.align_down::<Size4K>();
        assert_eq!(base.as_u64(), 0xFFFF_8880_0010_2000);
        assert_eq!(va - base, 0xFC0);
    }
}
