//! # Dispatcher Objects
//!
//! The waitable-object layer: dispatcher headers, semaphores, timers, DPCs,
//! APCs and the thread control block they all hang off. Everything here is
//! queueable without allocation — objects embed `intrusive-collections`
//! links and the queues splice them in place.
//!
//! The scheduler proper sits above this crate and is out of scope; what
//! lives here is the object state machines: signal counts, FIFO wait lists,
//! the time-ordered timer list, per-CPU DPC queues and per-thread APC
//! queues, plus thread initialization up to the point where a scheduler
//! could take over.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod apc;
pub mod dpc;
pub mod object;
pub mod semaphore;
pub mod thread;
pub mod timer;

pub use apc::{Apc, ApcEnvironment, ApcMode, ApcState};
pub use dpc::{Dpc, DpcImportance, DpcQueue};
pub use object::{DispatcherHeader, ObjectType, WaitBlock};
pub use semaphore::Semaphore;
pub use thread::{KThread, ThreadState};
pub use timer::{Timer, TimerList, TimerType};
