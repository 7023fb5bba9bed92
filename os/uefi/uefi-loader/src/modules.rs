//! # Module Loading
//!
//! Loader modules are PE/COFF images on the boot volume, each exposing a
//! module-information section and an entry symbol. The relocating loader
//! is itself a protocol (an external collaborator); the core's job is the
//! orchestration: resolve the file, have the image loader place it, record
//! the module, call its entry.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use log::{error, info};
use uefi::{CString16, Status};

use crate::protocol::{
    IMAGE_LOADER_PROTOCOL_GUID, ImageLoaderProtocol, ModuleInfo, close_protocol, open_protocol,
    register_module,
};
use crate::volume::load_boot_file;

/// Directory the modules live in on the boot volume.
const MODULES_DIRECTORY: &str = "\\EFI\\Boot\\Modules\\";

/// A module's entry point, invoked once after linking.
type ModuleEntryFn = extern "C" fn() -> Status;

/// Loads every module named in the space/semicolon-separated `list`.
///
/// Failures are surfaced and skipped; the boot continues with whatever
/// loaded.
pub fn load_modules(list: &str) {
    for name in list
        .split([' ', ';'])
        .map(str::trim)
        .filter(|name| !name.is_empty())
    {
        match load_module(name) {
            Ok(()) => info!("Module {name} loaded"),
            Err(status) => error!("Module {name} failed to load: {status}"),
        }
    }
}

/// Loads, links and starts one module.
///
/// # Errors
/// [`Status::NOT_FOUND`] when no image loader is registered or the file is
/// absent; otherwise the failing step's status.
pub fn load_module(name: &str) -> Result<(), Status> {
    // The PE/COFF loader must have been registered (it is itself the one
    // module that cannot be loaded this way).
    let Some(interface) = open_protocol(&IMAGE_LOADER_PROTOCOL_GUID) else {
        error!("No image-loader protocol; cannot load {name}");
        return Err(Status::NOT_FOUND);
    };
    let result = load_module_with(interface.cast(), name);
    close_protocol(&IMAGE_LOADER_PROTOCOL_GUID);
    result
}

fn load_module_with(loader: *const ImageLoaderProtocol, name: &str) -> Result<(), Status> {
    // SAFETY: interfaces under the image-loader GUID are image-loader
    // vtables by construction.
    let loader = unsafe { &*loader };

    let path = module_path(name)?;
    let image = load_boot_file(&path)?;

    let placed = (loader.load_image)(&image)?;
    register_module(ModuleInfo {
        name: String::from(name),
        base: usize::try_from(placed.physical_base).map_err(|_| Status::UNSUPPORTED)?,
        size: usize::try_from(placed.size).map_err(|_| Status::UNSUPPORTED)?,
    });

    // The entry point runs in the loader's environment and registers
    // whatever protocols the module provides.
    // SAFETY: the image loader resolved and relocated the entry symbol.
    let entry: ModuleEntryFn = unsafe { core::mem::transmute(placed.entry_point as usize) };
    let status = entry();
    if status != Status::SUCCESS {
        return Err(status);
    }
    Ok(())
}

/// Builds `\EFI\Boot\Modules\NAME.EFI` as a UCS-2 path.
fn module_path(name: &str) -> Result<CString16, Status> {
    let path = format!("{MODULES_DIRECTORY}{name}.EFI");
    CString16::try_from(path.as_str()).map_err(|_| Status::INVALID_PARAMETER)
}

/// Splits a module list the way [`load_modules`] does (shared with the
/// shell's `load` command).
pub fn module_names(list: &str) -> Vec<&str> {
    list.split([' ', ';'])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect()
}
