//! # Loader → Kernel Hand-Off Contract
//!
//! Everything the boot loader constructs for the kernel and the kernel then
//! indexes into for the rest of bring-up: the initialization block, the
//! memory-descriptor list, the system-resource records, and the wide-string
//! helpers both sides use to pick apart the kernel command line.
//!
//! The layouts here are an ABI. The loader writes them into its own memory
//! before the hand-off; the kernel never mutates the block itself (it only
//! unlinks resource nodes onto its private lists). Keep every struct
//! `#[repr(C)]` and prefer fixed-width integers at the boundary.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod boot;
pub mod list;
pub mod memory;
pub mod resources;
pub mod widestr;
