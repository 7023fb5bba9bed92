use crate::{RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// A mutex that delegates locking to a raw lock primitive.
///
/// Pairs a value of type `T` with a raw lock `R` and hands out RAII guards.
/// There is no poisoning and no ownership tracking; mutual exclusion and
/// memory ordering are whatever `R` provides.
///
/// ```
/// use kernel_sync::SpinMutex;
///
/// static COUNTER: SpinMutex<u32> = SpinMutex::new(0);
/// *COUNTER.lock() += 1;
/// assert_eq!(*COUNTER.lock(), 1);
/// ```
pub struct Mutex<T, R> {
    raw: R,
    cell: UnsafeCell<T>,
    // !Send/!Sync by default; re-added with the right bounds below.
    _no_send_sync: PhantomData<*mut ()>,
}

// SAFETY: mutual exclusion is delegated to `R`; data crosses threads only if
// `T: Send`.
unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}
unsafe impl<T: Send, R: Send> Send for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    /// Pairs `value` with the raw lock `raw`; does not acquire anything.
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            cell: UnsafeCell::new(value),
            _no_send_sync: PhantomData,
        }
    }

    /// Direct access through `&mut self`; no locking needed.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }
}

impl<T, R> Mutex<T, R>
where
    R: RawLock + RawUnlock,
{
    /// Acquires the lock, spinning as the raw primitive dictates.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.raw_lock();
        MutexGuard { m: self }
    }

    /// Acquires the lock only if it is immediately available.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        if self.raw.raw_try_lock() {
            Some(MutexGuard { m: self })
        } else {
            None
        }
    }
}

/// RAII guard released on drop; derefs to the protected value.
pub struct MutexGuard<'a, T, R>
where
    R: RawUnlock,
{
    m: &'a Mutex<T, R>,
}

impl<T, R> Deref for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.m.cell.get() }
    }
}

impl<T, R> DerefMut for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T, R> Drop for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn drop(&mut self) {
        // SAFETY: the guard was created by a successful acquisition.
        unsafe { self.m.raw.raw_unlock() }
    }
}

#[cfg(test)]
mod tests {
    use crate::SpinMutex;

    #[test]
    fn guard_gives_exclusive_access() {
        let m = SpinMutex::new(41);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.try_lock().is_none());
        }
        assert_eq!(*m.lock(), 42);
    }
}
