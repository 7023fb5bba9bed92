//! # Physical Page Accounting and Bootstrap Allocation
//!
//! What the memory manager knows about physical memory before (and while)
//! the real virtual-memory manager comes up:
//!
//! * [`scan`] — classify the loader's memory descriptors, find the extent of
//!   physical memory and the largest free region.
//! * [`bootstrap`] — carve early pages out of that free region, page by
//!   page, before any allocator structure exists.
//! * [`pfn`] — the PFN database: one record per physical page between the
//!   lowest and highest page observed, threaded onto the canonical lists
//!   (zeroed / free / standby / modified / modified-read-only / bad) with
//!   per-color free lists to spread cache conflicts.
//! * [`hardware`] — the hardware pool: physical carving plus a reserved
//!   virtual window for device mappings, with optional write-through
//!   attributes.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod bootstrap;
pub mod hardware;
pub mod pfn;
pub mod scan;

pub use bootstrap::BootstrapAllocator;
pub use hardware::HardwarePool;
pub use pfn::{MmPfn, PfnDatabase, PfnListId};
pub use scan::{MemoryLayout, scan_descriptor_slice};

/// Fewest physical pages the kernel will boot with (64-bit threshold).
#[cfg(target_pointer_width = "64")]
pub const MINIMUM_PHYSICAL_PAGES: u64 = 2048;

/// Fewest physical pages the kernel will boot with (32-bit threshold).
#[cfg(target_pointer_width = "32")]
pub const MINIMUM_PHYSICAL_PAGES: u64 = 1100;

/// Number of secondary (cache-color) free lists.
pub const SECONDARY_COLORS: usize = 64;
