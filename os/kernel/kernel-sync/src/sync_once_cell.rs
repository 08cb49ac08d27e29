use core::{
    cell::UnsafeCell,
    fmt,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const UNINIT: u8 = 0;
const INITING: u8 = 1;
const READY: u8 = 2;

/// A write-once cell usable from `static` items.
///
/// Boot code installs the value with [`set`](Self::set); everyone else
/// reads it with [`get`](Self::get).
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns `Some(&T)` if already initialized.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.is_initialized() {
            // SAFETY: READY guarantees the write is done
            Some(unsafe { self.get_unchecked() })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    /// # Safety
    /// The state must be `READY`.
    #[inline]
    unsafe fn get_unchecked(&self) -> &T {
        unsafe { &*(*self.value.get()).as_ptr() }
    }

    /// Claim the initializer role.
    #[inline]
    fn begin_init(&self) -> bool {
        self.state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// # Safety
    /// Only the thread that won [`begin_init`](Self::begin_init) may call this.
    #[inline]
    unsafe fn finish_init(&self, value: T) -> &T {
        unsafe {
            (*self.value.get()).write(value);
        }
        // Publish value before marking READY
        self.state.store(READY, Ordering::Release);
        // SAFETY: just wrote it
        unsafe { self.get_unchecked() }
    }

    /// Install `value` if the cell is empty.
    ///
    /// # Errors
    /// Gives `value` back if the cell was already set (or is being set).
    pub fn set(&self, value: T) -> Result<&T, T> {
        if self.begin_init() {
            // SAFETY: we won the race
            Ok(unsafe { self.finish_init(value) })
        } else {
            Err(value)
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SyncOnceCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(v) => f.debug_tuple("SyncOnceCell").field(v).finish(),
            None => f.write_str("SyncOnceCell(<uninit>)"),
        }
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY and we have exclusive access
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

// Safety: shared after READY; initialization is single-writer.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_once_then_reject() {
        let cell = SyncOnceCell::new();
        assert!(cell.get().is_none());
        assert_eq!(cell.set(7u32), Ok(&7));
        assert_eq!(cell.set(8u32), Err(8));
        assert_eq!(cell.get(), Some(&7));
    }

    #[test]
    fn drops_value() {
        use std::rc::Rc;
        let rc = Rc::new(());
        {
            let cell = SyncOnceCell::new();
            assert!(cell.set(Rc::clone(&rc)).is_ok());
            assert_eq!(Rc::strong_count(&rc), 2);
        }
        assert_eq!(Rc::strong_count(&rc), 1);
    }
}
