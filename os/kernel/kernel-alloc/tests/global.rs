//! The global heap is process-wide, so everything runs in one test.

mod common;

use common::SimMemory;
use core::alloc::{GlobalAlloc, Layout};
use kernel_alloc::global::{self, KernelAllocator};
use kernel_alloc::{HeapConfig, InitError};
use kernel_info::memory::PAGE_SIZE_USIZE as PAGE_SIZE;
use std::panic::{AssertUnwindSafe, catch_unwind};

#[test]
fn global_heap_surface() {
    assert!(!global::is_initialized());
    assert!(global::stats().is_none());

    let mem = SimMemory::new(64);
    let map = mem.map();
    unsafe { global::init_with_mapper(&map, mem.mapper, HeapConfig::DEFAULT) }.unwrap();
    assert_eq!(
        unsafe { global::init_with_mapper(&map, mem.mapper, HeapConfig::DEFAULT) },
        Err(InitError::AlreadyInitialized)
    );
    assert!(global::is_initialized());

    // Boot structures in usable memory stay out of the allocator.
    let free = global::stats().unwrap().pmm.free_blocks;
    assert_eq!(global::reserve(mem.frame(60), 4), 4);
    assert_eq!(global::reserve(mem.frame(62), 1), 0);
    assert_eq!(global::stats().unwrap().pmm.free_blocks, free - 4);
    assert!(global::allocate_pages(free - 3).is_none());
    let below = global::allocate_pages(free - 4).unwrap();
    assert_eq!(below, mem.frame(1));
    global::free_pages(below, free - 4);

    // malloc / calloc / realloc / free
    let p = global::malloc(100);
    assert!(!p.is_null());
    global::free(p);
    global::free(core::ptr::null_mut());

    let z = global::calloc(300);
    let bytes = unsafe { core::slice::from_raw_parts(z, 300) };
    assert!(bytes.iter().all(|&b| b == 0));
    unsafe { z.write(7) };
    let r = global::realloc(z, 5000);
    assert!(!r.is_null());
    assert_eq!(unsafe { r.read() }, 7);
    assert!(global::realloc(r, 0).is_null());

    // Out of memory yields null instead of a panic.
    assert!(global::malloc(1 << 40).is_null());
    let allocatable = global::stats().unwrap().pmm.allocatable_blocks;
    assert!(global::malloc(allocatable * PAGE_SIZE).is_null());
    assert!(global::allocate_pages(1000).is_none());

    // Raw pages
    let pa = global::allocate_pages(2).unwrap();
    global::free_pages(pa, 2);
    let pa = global::allocate_pages_or_halt(1);
    global::free_pages(pa, 1);

    // GlobalAlloc
    let alloc = KernelAllocator;
    let layout = Layout::from_size_align(24, 256).unwrap();
    let a = unsafe { alloc.alloc(layout) };
    assert!(!a.is_null());
    assert!(a.addr().is_multiple_of(256));
    let a = unsafe { alloc.realloc(a, layout, 1000) };
    assert!(a.addr().is_multiple_of(256));
    unsafe { alloc.dealloc(a, Layout::from_size_align(1000, 256).unwrap()) };

    let words = Layout::array::<u64>(600).unwrap();
    let w = unsafe { alloc.alloc_zeroed(words) }.cast::<u64>();
    assert!(w.addr().is_multiple_of(PAGE_SIZE));
    assert!(unsafe { core::slice::from_raw_parts(w, 600) }.iter().all(|&x| x == 0));
    unsafe { alloc.dealloc(w.cast(), words) };

    let over_aligned = Layout::from_size_align(8, 2 * PAGE_SIZE).unwrap();
    assert!(unsafe { alloc.alloc(over_aligned) }.is_null());

    // Misuse panics, and the heap stays usable afterwards.
    let p = global::malloc(8);
    global::free(p);
    assert!(catch_unwind(AssertUnwindSafe(|| global::free(p))).is_err());
    let mut local = 0u8;
    let foreign: *mut u8 = &raw mut local;
    assert!(catch_unwind(AssertUnwindSafe(|| global::free(foreign))).is_err());

    let stats = global::stats().unwrap();
    assert_eq!(stats.live_allocations, 0);
    assert!(global::trim() > 0);
    assert_eq!(global::stats().unwrap().cached_blocks, 0);
}
