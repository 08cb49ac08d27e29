//! # Kernel synchronization primitives
//!
//! The memory stack runs before any scheduler exists and may be entered from
//! interrupt context, so everything here spins and nothing blocks:
//!
//! * [`SpinLock`] is a test-and-test-and-set lock. [`SpinLock::lock_irq`]
//!   additionally masks interrupts for as long as the guard lives.
//! * [`IrqGuard`] saves and clears the interrupt flag on bare-metal x86-64;
//!   on hosted targets it does nothing, which keeps the crate testable.
//! * [`SyncOnceCell`] holds process-wide singletons that are installed once
//!   during boot and read afterwards.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::{IrqGuard, IrqSpinLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
