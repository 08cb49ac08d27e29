//! # Memory Layout

use kernel_memory_addresses::{PageSize, Size4K};

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Size of one physical frame in bytes.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// [`PAGE_SIZE`] as `usize`, for slice and layout arithmetic.
#[allow(clippy::cast_possible_truncation)]
pub const PAGE_SIZE_USIZE: usize = PAGE_SIZE as usize;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = Size4K::SHIFT;

const _: () = {
    assert!(HHDM_BASE >= 0xffff_8000_0000_0000);
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(HHDM_BASE.is_multiple_of(PAGE_SIZE));
};
