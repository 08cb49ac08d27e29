//! # Kernel Memory Allocation
//!
//! Physical frame management and the kernel heap built on top of it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 global / KernelAllocator            │
//! │    • one heap instance behind an IRQ-safe lock      │
//! │    • null on out-of-memory, panic on misuse         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                      Heap                           │
//! │    • power-of-two small buckets, 64 B to 2 KiB      │
//! │    • page-granular big blocks with a reuse cache    │
//! │    • header-free: an address registry finds records │
//! └─────────────────┬───────────────────────────────────┘
//!                   │  PageMapper (direct map)
//! ┌─────────────────▼───────────────────────────────────┐
//! │                   BitmapPmm                         │
//! │    • one bit per 4 KiB frame, set = allocated       │
//! │    • first-fit contiguous runs                      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kernel_alloc::{HeapConfig, global};
//!
//! let map = kernel_mmap::init(boot_map)?;
//! unsafe { global::init(map, HeapConfig::DEFAULT) }?;
//!
//! let p = global::malloc(100);
//! global::free(p);
//! ```
//!
//! [`Heap`] is an ordinary value as well; tests build one over a host buffer
//! with a [`DirectMapper`] whose offset points into it.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod config;
pub mod error;
pub mod global;
mod heap;
mod page_mapper;
mod pmm;

#[cfg(test)]
mod testing;

pub use config::HeapConfig;
pub use error::{HeapError, InitError, PmmError};
pub use heap::{CHUNK_INFOS_PER_PAGE, Heap, HeapStats};
pub use page_mapper::{DirectMapper, PageMapper};
pub use pmm::{BitmapPmm, PmmStats};
