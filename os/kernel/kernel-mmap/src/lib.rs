//! # Boot Memory Map
//!
//! The loader hands the kernel an ordered list of physical [`MemoryRegion`]s.
//! This crate validates that list once, keeps it in a process-wide singleton
//! and derives the page-aligned [`FrameRange`]s the physical memory manager is
//! allowed to hand out.
//!
//! Decoding the firmware's own descriptor format is the loader's job; by the
//! time a [`MemoryMap`] is built every entry is already a plain
//! `{address, length, kind}` triple.
//!
//! ## Allocatable memory
//!
//! | Kind | Allocatable |
//! |------|-------------|
//! | [`Usable`](MemoryKind::Usable) | yes, clipped so it never runs into the next entry |
//! | [`AcpiReclaimable`](MemoryKind::AcpiReclaimable), [`BootloaderReclaimable`](MemoryKind::BootloaderReclaimable) | only if it does not overlap the next entry |
//! | everything else | no |
//!
//! ```rust
//! # use kernel_mmap::*;
//! # use kernel_memory_addresses::PhysicalAddress;
//! let map = MemoryMap::new(&[
//!     MemoryRegion::new(PhysicalAddress::new(0x0), 0x9F000, MemoryKind::Usable),
//!     MemoryRegion::new(PhysicalAddress::new(0x10_0000), 0x10_0000, MemoryKind::Kernel),
//!     MemoryRegion::new(PhysicalAddress::new(0x20_0000), 0x40_0000, MemoryKind::Usable),
//! ])?;
//! let frames: u64 = map.allocatable().map(|r| r.frames).sum();
//! assert_eq!(frames, 0x9F + 0x400);
//! # Ok::<(), MemoryMapError>(())
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

mod map;
mod region;

use kernel_sync::SyncOnceCell;
use log::info;

pub use map::{FrameRange, MAX_REGIONS, MemoryMap};
pub use region::{MemoryKind, MemoryRegion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryMapError {
    #[error("memory map holds {count} regions, capacity is {capacity}")]
    TooManyRegions { count: usize, capacity: usize },
    #[error("memory map entry {index} starts below its predecessor")]
    Unsorted { index: usize },
    #[error("memory map entry {index} wraps the physical address space")]
    AddressOverflow { index: usize },
    #[error("the memory map was already initialized")]
    AlreadyInitialized,
}

static MEMORY_MAP: SyncOnceCell<MemoryMap> = SyncOnceCell::new();

/// Install the boot memory map. Call exactly once, before the PMM is built.
///
/// # Errors
/// [`MemoryMapError::AlreadyInitialized`] if a map was installed before.
pub fn init(map: MemoryMap) -> Result<&'static MemoryMap, MemoryMapError> {
    let map = MEMORY_MAP
        .set(map)
        .map_err(|_| MemoryMapError::AlreadyInitialized)?;

    let frames: u64 = map.allocatable().map(|r| r.frames).sum();
    info!(
        "Memory map: {} regions, {frames} allocatable frames ({} KiB)",
        map.len(),
        frames * kernel_info::memory::PAGE_SIZE / 1024
    );
    Ok(map)
}

/// The installed memory map, if [`init`] ran.
#[inline]
pub fn get() -> Option<&'static MemoryMap> {
    MEMORY_MAP.get()
}
