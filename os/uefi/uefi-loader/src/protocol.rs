//! # Protocol Registry
//!
//! The loader is modular: every service it offers — and every service a
//! module offers back — is a protocol identified by GUID. Installation
//! publishes the interface through the firmware's protocol database so
//! modules loaded later can find it; a process-local registry mirrors the
//! associations so lookups work without handle plumbing.
//!
//! Boot protocols additionally register a short name ("XTOS") so the menu
//! can invoke them by configuration value.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::ffi::c_void;
use kernel_sync::SpinMutex;
use log::{error, info};
use uefi::{Guid, Status, boot, guid};

/// GUID of the loader's own protocol.
pub const LOADER_PROTOCOL_GUID: Guid = guid!("9f4f3f2a-71a1-4d7a-8e2e-2f0d5a9b1c01");

/// GUID of the PE/COFF image-loader protocol an external module provides.
pub const IMAGE_LOADER_PROTOCOL_GUID: Guid = guid!("9f4f3f2a-71a1-4d7a-8e2e-2f0d5a9b1c02");

/// One registered protocol: GUID plus an interface pointer.
#[derive(Copy, Clone, Debug)]
struct ProtocolEntry {
    guid: Guid,
    interface: *mut c_void,
    open_count: u32,
}

// SAFETY: interface pointers are 'static vtables owned by their providers.
unsafe impl Send for ProtocolEntry {}

/// One registered boot protocol: short name to GUID.
#[derive(Clone, Debug)]
struct BootProtocolEntry {
    name: String,
    guid: Guid,
}

/// A module the loader has linked in.
#[derive(Clone, Debug)]
pub struct ModuleInfo {
    pub name: String,
    pub base: usize,
    pub size: usize,
}

static PROTOCOLS: SpinMutex<Vec<ProtocolEntry>> = SpinMutex::new(Vec::new());
static BOOT_PROTOCOLS: SpinMutex<Vec<BootProtocolEntry>> = SpinMutex::new(Vec::new());
static MODULES: SpinMutex<Vec<ModuleInfo>> = SpinMutex::new(Vec::new());

/// Installs a protocol interface, publishing it to the firmware as well.
///
/// # Safety
/// `interface` must point at a vtable that stays valid for the lifetime of
/// the boot services environment.
pub unsafe fn install_protocol(guid: Guid, interface: *mut c_void) -> Status {
    // Firmware first: modules find interfaces through the handle database.
    // SAFETY: per this function's contract.
    let status = unsafe { boot::install_protocol_interface(None, &guid, interface) };
    if let Err(error) = status {
        error!("InstallProtocolInterface({guid}) failed: {}", error.status());
        return error.status();
    }

    PROTOCOLS.lock().push(ProtocolEntry {
        guid,
        interface,
        open_count: 0,
    });
    Status::SUCCESS
}

/// Opens a protocol by GUID, bumping its open count.
///
/// Every successful open must be balanced by [`close_protocol`].
pub fn open_protocol(guid: &Guid) -> Option<*mut c_void> {
    let mut protocols = PROTOCOLS.lock();
    let entry = protocols.iter_mut().find(|entry| entry.guid == *guid)?;
    entry.open_count += 1;
    Some(entry.interface)
}

/// Closes a protocol opened with [`open_protocol`].
pub fn close_protocol(guid: &Guid) {
    let mut protocols = PROTOCOLS.lock();
    if let Some(entry) = protocols.iter_mut().find(|entry| entry.guid == *guid)
        && entry.open_count > 0
    {
        entry.open_count -= 1;
    }
}

/// Registers a boot protocol under its menu-visible short name.
pub fn register_boot_protocol(name: &str, guid: Guid) {
    info!("Boot protocol {name} registered");
    BOOT_PROTOCOLS.lock().push(BootProtocolEntry {
        name: name.to_string(),
        guid,
    });
}

/// The GUID behind a boot-protocol short name.
pub fn boot_protocol_guid(name: &str) -> Option<Guid> {
    BOOT_PROTOCOLS
        .lock()
        .iter()
        .find(|entry| entry.name.eq_ignore_ascii_case(name))
        .map(|entry| entry.guid)
}

/// Names of every registered boot protocol, in registration order.
pub fn boot_protocol_names() -> Vec<String> {
    BOOT_PROTOCOLS
        .lock()
        .iter()
        .map(|entry| entry.name.clone())
        .collect()
}

/// Looks up and invokes a boot protocol by short name.
///
/// # Errors
/// [`Status::NOT_FOUND`] for an unknown name; otherwise whatever the
/// protocol's boot entry returns (success means it never returned).
pub fn invoke_boot_protocol(name: &str, options: &crate::config::Configuration) -> Status {
    let Some(guid) = boot_protocol_guid(name) else {
        error!("No boot protocol named {name:?}");
        return Status::NOT_FOUND;
    };
    let Some(interface) = open_protocol(&guid) else {
        return Status::NOT_FOUND;
    };
    // SAFETY: boot-protocol interfaces are BootProtocol vtables by
    // construction (register_boot_protocol callers install them).
    let protocol = unsafe { &*interface.cast::<BootProtocol>() };
    let status = (protocol.boot_system)(options);
    close_protocol(&guid);
    status
}

/// The vtable a boot protocol installs.
#[repr(C)]
pub struct BootProtocol {
    /// Boots the system; only returns on failure.
    pub boot_system: fn(&crate::config::Configuration) -> Status,
}

/// The vtable of the external PE/COFF image loader.
///
/// The relocating loader itself is an external collaborator; the loader
/// core only consumes this interface.
#[repr(C)]
pub struct ImageLoaderProtocol {
    /// Relocates and links `image`, returning its placement.
    pub load_image: fn(image: &[u8]) -> Result<LoadedImageInfo, Status>,
}

/// Placement of an image the PE/COFF loader produced.
#[derive(Copy, Clone, Debug)]
pub struct LoadedImageInfo {
    /// Physical base the image was placed at.
    pub physical_base: u64,
    /// Virtual base the image was linked for.
    pub virtual_base: u64,
    /// Image size in bytes.
    pub size: u64,
    /// Virtual address of the entry point.
    pub entry_point: u64,
}

/// Records a loaded module in the module list.
pub fn register_module(info: ModuleInfo) {
    MODULES.lock().push(info);
}

/// Snapshot of the module list (for the page-map builder).
pub fn module_list() -> Vec<ModuleInfo> {
    MODULES.lock().clone()
}

/// The loader's public services, published as one vtable.
///
/// Modules link against this instead of importing loader symbols.
#[repr(C)]
pub struct LoaderProtocol {
    pub open_protocol: fn(&Guid) -> Option<*mut c_void>,
    pub close_protocol: fn(&Guid),
    pub register_boot_protocol: fn(&str, Guid),
    pub register_module: fn(ModuleInfo),
    pub debug_print: fn(&str),
    pub get_random_value: fn() -> u64,
    pub secure_boot_status: fn() -> i64,
}

/// The single loader-protocol instance.
static LOADER_PROTOCOL: LoaderProtocol = LoaderProtocol {
    open_protocol,
    close_protocol,
    register_boot_protocol,
    register_module,
    debug_print: crate::loader::debug_console_write,
    get_random_value: crate::rng::get_random_value,
    secure_boot_status: crate::loader::secure_boot_status,
};

/// Publishes the loader protocol.
pub fn install_loader_protocol() {
    // SAFETY: the vtable is a static.
    let status = unsafe {
        install_protocol(
            LOADER_PROTOCOL_GUID,
            core::ptr::from_ref(&LOADER_PROTOCOL).cast_mut().cast(),
        )
    };
    if status != Status::SUCCESS {
        error!("Loader protocol installation failed: {status}");
    }
}
