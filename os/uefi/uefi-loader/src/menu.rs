//! # Boot Menu and Shell
//!
//! A plain text menu over the firmware console: one line per registered
//! boot protocol, arrow keys to move, Enter to boot, Escape into the
//! shell. A successful boot never returns; failures surface as an error
//! line and drop back to the menu loop.
//!
//! The shell is the fallback when nothing boots: a few commands for poking
//! at the loader state.

use alloc::string::String;
use log::error;
use uefi::proto::console::text::{Key, ScanCode};

use crate::config::Configuration;
use crate::{console, loader, modules, protocol, rng, volume};

/// Runs the menu once; returns when the user escapes to the shell or a
/// boot attempt fails.
pub fn run(configuration: &Configuration) {
    let entries = protocol::boot_protocol_names();
    if entries.is_empty() {
        error!("No boot protocols registered");
        return;
    }

    let mut selected = 0usize;
    loop {
        console::clear();
        uefi::println!("=== Boot Menu ===");
        uefi::println!();
        for (index, name) in entries.iter().enumerate() {
            let marker = if index == selected { ">" } else { " " };
            uefi::println!(" {marker} {name}");
        }
        uefi::println!();
        uefi::println!("Enter boots, Escape drops to the shell.");

        match console::wait_for_key() {
            Some(Key::Special(ScanCode::UP)) => {
                selected = selected.saturating_sub(1);
            }
            Some(Key::Special(ScanCode::DOWN)) => {
                selected = (selected + 1).min(entries.len() - 1);
            }
            Some(Key::Special(ScanCode::ESCAPE)) => return,
            Some(Key::Printable(c)) if u16::from(c) == u16::from(b'\r') => {
                let status = protocol::invoke_boot_protocol(&entries[selected], configuration);
                // Only failures come back.
                error!("Boot protocol {} returned: {status}", entries[selected]);
                uefi::println!("Press any key to continue");
                console::wait_for_key();
            }
            _ => {}
        }
    }
}

/// The fallback shell; returns when the user asks for the menu again.
pub fn shell(configuration: &Configuration) {
    console::clear();
    uefi::println!("Loader shell. 'help' lists commands.");

    loop {
        uefi::print!("> ");
        let line = read_line();
        let mut words = line.split_whitespace();
        match words.next() {
            Some("help") => {
                uefi::println!("boot <name>   invoke a boot protocol");
                uefi::println!("load <list>   load modules");
                uefi::println!("disks         enumerate block devices");
                uefi::println!("random        print a random value");
                uefi::println!("secureboot    print the Secure Boot status");
                uefi::println!("menu          back to the boot menu");
            }
            Some("boot") => {
                if let Some(name) = words.next() {
                    let status = protocol::invoke_boot_protocol(name, configuration);
                    uefi::println!("{name} returned: {status}");
                } else {
                    uefi::println!("boot what?");
                }
            }
            Some("load") => {
                for name in words {
                    for module in modules::module_names(name) {
                        let _ = modules::load_module(module);
                    }
                }
            }
            Some("disks") => volume::enumerate_block_devices(),
            Some("random") => uefi::println!("{:#018x}", rng::get_random_value()),
            Some("secureboot") => uefi::println!("{}", loader::secure_boot_status()),
            Some("menu") => return,
            Some(other) => uefi::println!("unknown command: {other}"),
            None => {}
        }
    }
}

/// Reads one line of console input, echoing as it goes.
fn read_line() -> String {
    let mut line = String::new();
    loop {
        let Some(key) = console::wait_for_key() else {
            continue;
        };
        match key {
            Key::Printable(c) => {
                let c = char::from(c);
                match c {
                    '\r' | '\n' => {
                        uefi::println!();
                        return line;
                    }
                    '\u{8}' => {
                        if line.pop().is_some() {
                            uefi::print!("\u{8} \u{8}");
                        }
                    }
                    _ => {
                        line.push(c);
                        uefi::print!("{c}");
                    }
                }
            }
            Key::Special(ScanCode::ESCAPE) => {
                uefi::println!();
                return String::new();
            }
            Key::Special(_) => {}
        }
    }
}
