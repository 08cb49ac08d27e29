//! # Kernel Memory Layout
//!
//! Compile-time constants shared by the physical memory manager and the kernel
//! heap. The crate is the single source of truth for where physical memory
//! appears in the kernel's address space and how large a frame is.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//!                       ├─────────────────────────────────┤ 0xffff_0000_0000_0000
//!                       │        Guard Region             │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//!                       │   (all physical memory)         │
//!                       ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The heap never maps pages itself: every frame handed out by the PMM is
//! reachable at `HHDM_BASE + physical address`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
