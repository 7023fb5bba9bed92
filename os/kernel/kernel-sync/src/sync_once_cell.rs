use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITING: u8 = 1;
const READY: u8 = 2;

/// A spin-based once-cell for lazily initialized globals.
///
/// The first caller to observe the uninitialized state runs the initializer;
/// racers spin until the value is published. A panicking initializer leaves
/// the cell stuck in the initializing state — don't panic in initializers.
///
/// ```
/// use kernel_sync::SyncOnceCell;
///
/// static CELL: SyncOnceCell<u32> = SyncOnceCell::new();
/// assert_eq!(*CELL.get_or_init(|| 7), 7);
/// assert_eq!(CELL.get(), Some(&7));
/// ```
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: a published value is only handed out by shared reference, and
// publication is ordered by the state word.
unsafe impl<T: Send + Sync> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    /// An empty cell.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// The value, if it has been initialized.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY is only published after the value is written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Returns the value, initializing it with `init` if the cell was empty.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        match self
            .state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => {
                // This caller won the race and runs the initializer.
                // SAFETY: exclusive access while in INITING.
                unsafe { (*self.value.get()).write(init()) };
                self.state.store(READY, Ordering::Release);
            }
            Err(READY) => {}
            Err(_) => {
                while self.state.load(Ordering::Acquire) != READY {
                    spin_loop();
                }
            }
        }
        // SAFETY: state is READY here.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializes_exactly_once() {
        let cell = SyncOnceCell::new();
        assert!(cell.get().is_none());
        assert_eq!(*cell.get_or_init(|| 1), 1);
        assert_eq!(*cell.get_or_init(|| 2), 1);
        assert_eq!(cell.get(), Some(&1));
    }
}
