//! # The kernel heap instance
//!
//! One [`Heap`] over the boot memory map, installed once by [`init`] and
//! reached through free functions from then on. Every call takes the heap
//! lock with interrupts masked, so an interrupt handler that allocates can
//! never spin on a lock its own CPU holds.
//!
//! Out-of-memory is reported as a null pointer (or `None`). Misuse, such as
//! a double free or freeing a foreign pointer, panics: a corrupted heap
//! cannot be recovered from.
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL_ALLOCATOR: kernel_alloc::global::KernelAllocator =
//!     kernel_alloc::global::KernelAllocator;
//!
//! let map = kernel_mmap::init(boot_map)?;
//! unsafe { kernel_alloc::global::init(map, HeapConfig::DEFAULT) }?;
//! kernel_alloc::global::reserve(boot_info_addr, boot_info_pages);
//! ```

use crate::config::PAGE_SIZE;
use crate::error::{HeapError, InitError};
use crate::{BitmapPmm, DirectMapper, Heap, HeapConfig, HeapStats};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_memory_addresses::PhysicalAddress;
use kernel_mmap::MemoryMap;
use kernel_sync::{SpinLock, SyncOnceCell};
use log::{error, info, warn};

static HEAP: SyncOnceCell<SpinLock<Heap<DirectMapper>>> = SyncOnceCell::new();

/// Build the PMM over `map` and install the heap, using the kernel's
/// direct map.
///
/// # Errors
/// As for [`init_with_mapper`].
///
/// # Safety
/// As for [`init_with_mapper`].
pub unsafe fn init(map: &MemoryMap, config: HeapConfig) -> Result<(), InitError> {
    // SAFETY: forwarded to the caller.
    unsafe { init_with_mapper(map, DirectMapper::hhdm(), config) }
}

/// Like [`init`], with an explicit direct-map offset.
///
/// # Errors
/// * [`InitError::AlreadyInitialized`] on every call after the first.
/// * [`InitError::Pmm`] if the map has no usable memory.
///
/// # Safety
/// * `mapper` must map every allocatable frame of `map` read-write.
/// * The allocatable memory of `map` must be unused; from now on it belongs
///   to the heap.
/// * Must not race with another call.
pub unsafe fn init_with_mapper(
    map: &MemoryMap,
    mapper: DirectMapper,
    config: HeapConfig,
) -> Result<(), InitError> {
    if HEAP.is_initialized() {
        return Err(InitError::AlreadyInitialized);
    }

    // SAFETY: forwarded to the caller.
    let pmm = unsafe { BitmapPmm::new(map, &mapper)? };
    let stats = pmm.stats();
    HEAP.set(SpinLock::new(Heap::new(pmm, mapper, config)))
        .map_err(|_| InitError::AlreadyInitialized)?;

    info!(
        "heap: ready; {stats}; caching up to {} blocks of at most {} pages",
        config.cache_entries, config.cache_max_pages
    );
    Ok(())
}

#[must_use]
pub fn is_initialized() -> bool {
    HEAP.is_initialized()
}

fn heap() -> &'static SpinLock<Heap<DirectMapper>> {
    let Some(heap) = HEAP.get() else {
        panic!("kernel heap used before global::init");
    };
    heap
}

fn block_or_null(result: Result<NonNull<u8>, HeapError>, op: &str, size: usize) -> *mut u8 {
    match result {
        Ok(ptr) => ptr.as_ptr(),
        Err(e) if e.is_recoverable() => {
            warn!("heap: {op}({size}) failed: {e}");
            ptr::null_mut()
        }
        Err(e) => panic!("heap: {op}({size}): {e}"),
    }
}

/// Allocate `size` bytes; null when out of memory.
///
/// # Panics
/// If the heap is not initialized or its metadata is corrupt.
#[must_use]
pub fn malloc(size: usize) -> *mut u8 {
    let result = heap().lock_irq().malloc(size);
    block_or_null(result, "malloc", size)
}

/// Allocate `size` zeroed bytes; null when out of memory.
///
/// # Panics
/// As for [`malloc`].
#[must_use]
pub fn calloc(size: usize) -> *mut u8 {
    let result = heap().lock_irq().calloc(size);
    block_or_null(result, "calloc", size)
}

/// Release a block returned by [`malloc`], [`calloc`] or [`realloc`].
/// Null is ignored.
///
/// # Panics
/// On a double free or a pointer the heap never handed out.
pub fn free(ptr: *mut u8) {
    let result = heap().lock_irq().free(ptr);
    if let Err(e) = result {
        panic!("heap: free({ptr:p}): {e}");
    }
}

/// Resize a block. Returns null both when `new_size` is zero (the block is
/// freed) and when out of memory (the block is untouched).
///
/// # Panics
/// As for [`free`].
#[must_use]
pub fn realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    let result = heap().lock_irq().realloc(ptr, new_size);
    match result {
        Ok(Some(ptr)) => ptr.as_ptr(),
        Ok(None) => ptr::null_mut(),
        Err(e) if e.is_recoverable() => {
            warn!("heap: realloc({ptr:p}, {new_size}) failed: {e}");
            ptr::null_mut()
        }
        Err(e) => panic!("heap: realloc({ptr:p}, {new_size}): {e}"),
    }
}

/// `n` contiguous raw frames; `None` when out of memory.
///
/// # Panics
/// For `n == 0`.
#[must_use]
pub fn allocate_pages(n: usize) -> Option<PhysicalAddress> {
    let result = heap().lock_irq().allocate_pages(n);
    match result {
        Ok(pa) => Some(pa),
        Err(e) if e.is_recoverable() => {
            warn!("heap: allocate_pages({n}) failed: {e}");
            None
        }
        Err(e) => panic!("heap: allocate_pages({n}): {e}"),
    }
}

/// `n` contiguous raw frames, for callers that cannot continue without them.
///
/// # Panics
/// When the frames cannot be provided, after logging the heap state.
#[must_use]
pub fn allocate_pages_or_halt(n: usize) -> PhysicalAddress {
    heap().with_lock_irq(|heap| match heap.allocate_pages(n) {
        Ok(pa) => pa,
        Err(e) => {
            error!("heap: fatal allocation of {n} frames: {e}; {}", heap.stats());
            panic!("out of physical memory: {e}");
        }
    })
}

/// Return frames from [`allocate_pages`].
///
/// # Panics
/// If any frame is not allocated or lies outside managed memory.
pub fn free_pages(addr: PhysicalAddress, n: usize) {
    let result = heap().lock_irq().free_pages(addr, n);
    if let Err(e) = result {
        panic!("heap: free_pages({addr}, {n}): {e}");
    }
}

/// Keep frames overlapping `[addr, addr + n pages)` out of the allocator,
/// for boot structures that still live in usable memory. Call it right
/// after [`init`], before anything allocates. Returns how many frames
/// changed state.
///
/// # Panics
/// If the heap is not initialized.
pub fn reserve(addr: PhysicalAddress, n: usize) -> usize {
    heap().lock_irq().reserve(addr, n)
}

/// Flush the big-block cache back to the PMM. Returns the pages released.
///
/// # Panics
/// If releasing a cached block fails.
pub fn trim() -> usize {
    let result = heap().lock_irq().trim();
    match result {
        Ok(pages) => pages,
        Err(e) => panic!("heap: trim: {e}"),
    }
}

/// `None` before [`init`].
#[must_use]
pub fn stats() -> Option<HeapStats> {
    HEAP.get().map(|heap| heap.lock_irq().stats())
}

/// [`GlobalAlloc`] over the kernel heap.
///
/// Alignments up to a page are honored by rounding the size up to the
/// alignment: small blocks are aligned to their power-of-two size and big
/// blocks to a page.
pub struct KernelAllocator;

const fn request_size(layout: Layout) -> Option<usize> {
    if layout.align() > PAGE_SIZE {
        None
    } else if layout.size() > layout.align() {
        Some(layout.size())
    } else {
        Some(layout.align())
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        request_size(layout).map_or(ptr::null_mut(), malloc)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        request_size(layout).map_or(ptr::null_mut(), calloc)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > PAGE_SIZE {
            return ptr::null_mut();
        }
        realloc(ptr, new_size.max(layout.align()))
    }
}
