//! # Interrupt-State Guards
//!
//! Critical sections that are entered from below dispatch level must also
//! keep local interrupt handlers out. [`IrqGuard`] snapshots `RFLAGS.IF`,
//! executes `cli`, and restores the prior state on drop;
//! [`Mutex::lock_irq`] pairs that with lock acquisition in the right order
//! (interrupts off first, lock second; released in reverse).

use crate::{Mutex, MutexGuard, RawLock, RawUnlock};

/// Current `RFLAGS` (via `pushfq`/`pop`). Bit 9 is `IF`.
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    let r: u64;
    unsafe { core::arch::asm!("pushfq", "pop {}", out(reg) r, options(nomem, preserves_flags)) }
    r
}

/// RAII guard that disables interrupts on creation and restores the prior
/// state on drop.
///
/// Only issues `sti` on drop if interrupts were enabled when the guard was
/// created, so nesting is safe.
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = (rflags() & (1 << 9)) != 0;
        if enabled {
            unsafe {
                core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
            }
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            unsafe {
                core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
            }
        }
    }
}

/// A mutex guard that also holds interrupts disabled.
pub struct IrqMutexGuard<'a, T, R: RawLock + RawUnlock> {
    // Field order matters: the mutex releases before interrupts return.
    _guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Disables interrupts, then acquires the mutex; both are undone in
    /// reverse order when the guard drops.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutexGuard<'_, T, R> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqMutexGuard {
            _guard: guard,
            _irq: irq,
        }
    }
}

impl<T, R: RawLock + RawUnlock> core::ops::Deref for IrqMutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self._guard
    }
}

impl<T, R: RawLock + RawUnlock> core::ops::DerefMut for IrqMutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self._guard
    }
}
