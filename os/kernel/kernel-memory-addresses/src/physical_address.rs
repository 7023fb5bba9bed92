use crate::{PAGE_SIZE, align_down};
use core::fmt;
use core::ops::{Add, AddAssign};
use core::ptr::NonNull;

/// Physical memory address (machine bus address).
///
/// Carries intent only; there are no alignment guarantees. Page-table entries
/// store a page-aligned base — use [`PhysicalAddress::page_base`] when an
/// aligned value is required.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Captures the address of an identity-mapped pointer.
    ///
    /// Only meaningful in contexts (the boot loader, the HHDM window) where
    /// the pointer's virtual address equals its physical address.
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    /// Like [`PhysicalAddress::from_ptr`] for non-null pointers.
    #[inline]
    #[must_use]
    pub fn from_nonnull<T>(ptr: NonNull<T>) -> Self {
        Self::from_ptr(ptr.as_ptr())
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// This address rounded down to its page base.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress({:#018x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
