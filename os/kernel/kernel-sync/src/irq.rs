//! Interrupt masking.
//!
//! On `x86_64` bare metal (`target_os = "none"`) the guard uses
//! `pushfq`/`cli`/`sti`. Everywhere else (host builds, unit tests) there are
//! no interrupts to mask and the guard is inert.

use crate::SpinLockGuard;
use core::ops::{Deref, DerefMut};

/// Bit 9 of `RFLAGS`: interrupts enabled.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const RFLAGS_IF: u64 = 1 << 9;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    /// Disables hardware interrupts (`cli`).
    ///
    /// Must only run where `cli` is permitted (ring 0).
    #[inline]
    pub fn cli() {
        // Safety: privileged kernel context.
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    /// Enables hardware interrupts (`sti`).
    #[inline]
    pub fn sti() {
        // Safety: privileged kernel context.
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    /// Returns the current `RFLAGS` value (via `pushfq/pop`).
    #[inline]
    pub fn rflags() -> u64 {
        let r: u64;
        // Safety: reading flags has no side effects.
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags)) }
        r
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`; on drop it executes `sti` **only** if they were enabled
/// before, so guards nest correctly.
///
/// # Examples
///
/// ```
/// use kernel_sync::IrqGuard;
///
/// {
///     let _g = IrqGuard::new(); // interrupts masked here (bare metal only)
///     // critical section
/// }
/// // previous interrupt state restored
/// ```
#[derive(Debug)]
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn new() -> Self {
        let enabled = (arch::rflags() & RFLAGS_IF) != 0;
        if enabled {
            arch::cli();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Hosted build: nothing to mask.
    #[inline]
    #[must_use]
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    pub const fn new() -> Self {
        Self {
            were_enabled: false,
        }
    }

    /// Whether interrupts will be re-enabled when this guard drops.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        if self.were_enabled {
            arch::sti();
        }
    }
}

/// A [`SpinLockGuard`] that also keeps interrupts masked while held.
///
/// Created by [`SpinLock::lock_irq`](crate::SpinLock::lock_irq). Field order
/// matters: the lock is released first, then interrupts are restored.
pub struct IrqSpinLockGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<'a, T> IrqSpinLockGuard<'a, T> {
    pub(crate) const fn new(guard: SpinLockGuard<'a, T>, irq: IrqGuard) -> Self {
        Self { guard, _irq: irq }
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
