//! # UEFI Boot Loader
//!
//! The firmware hands control here; the loader prepares the machine and
//! hands off to the kernel. The sequence is fixed:
//!
//! 1. Console and loader-state initialization (Secure Boot status, the
//!    loaded-image extent, the protocol registry).
//! 2. Command line from the loaded image's load options, then the
//!    configuration file; the debug console comes up as early as the
//!    configuration allows.
//! 3. Watchdog off, the loader protocol installed, modules loaded, block
//!    devices enumerated.
//! 4. The boot menu, looping into the shell when nothing boots.
//!
//! The selected boot protocol (XTOS) does the heavy lifting: kernel image,
//! page map, initialization block, exit-boot-services, jump.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![no_main]
#![allow(unsafe_code)]
extern crate alloc;

mod config;
mod console;
mod loader;
mod memory;
mod menu;
mod modules;
mod pagemap;
mod protocol;
mod rng;
mod volume;
mod xtos;

use log::{LevelFilter, info};
use uefi::prelude::*;

#[entry]
fn efi_main() -> Status {
    // Logging and the boot-services allocator.
    if uefi::helpers::init().is_err() {
        return Status::UNSUPPORTED;
    }

    // Reset the text console before anything prints.
    console::initialize();

    let logger = loader::LoaderLogger::new(LevelFilter::Debug);
    if logger.init().is_err() {
        return Status::UNSUPPORTED;
    }

    // Loader state: image extent, Secure Boot, protocol registry.
    if let Err(status) = loader::initialize() {
        return status;
    }
    info!("Boot loader initializing");

    // Command line first: it can ask for the debug console immediately.
    let command_line = loader::command_line();
    if config::early_debug_requested(&command_line) {
        loader::initialize_debug_console(&command_line);
    }

    // Configuration file, then the debug console if it waited.
    let configuration = config::load_and_parse(&command_line);
    if !config::early_debug_requested(&command_line) {
        if let Some(debug) = configuration.value("DEBUG") {
            loader::initialize_debug_console_from_value(debug);
        }
    }

    // The firmware watchdog would reset us mid-menu.
    let _ = uefi::boot::set_watchdog_timer(0, 0x10000, None);

    // Publish the loader protocol, then whatever the configuration loads.
    protocol::install_loader_protocol();
    xtos::register();
    if let Some(module_list) = configuration.value("MODULES") {
        modules::load_modules(module_list);
    }

    // Know the disks before the menu offers to boot from them.
    volume::enumerate_block_devices();

    // Menu, falling through to the shell, forever.
    loop {
        menu::run(&configuration);
        menu::shell(&configuration);
    }
}
