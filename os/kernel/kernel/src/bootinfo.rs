//! # Boot-Information Consumer
//!
//! Read-only access to the initialization block the loader handed over:
//! the kernel command line, the hand-off lists, the firmware facts and the
//! loader's early debug-print callback.

use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::boot::{FirmwareType, KernelInitBlock};
use kernel_info::list::ListEntry;
use kernel_info::widestr;
use kernel_vmem::PageMapLevel;

/// The block's address; set exactly once at entry.
static INIT_BLOCK: AtomicUsize = AtomicUsize::new(0);

/// Publishes the initialization block.
///
/// # Safety
/// `block` must point at a mapped, fully constructed block that stays
/// immutable for the kernel's lifetime. Call once, before anything reads it.
pub unsafe fn set_init_block(block: *const KernelInitBlock) {
    INIT_BLOCK.store(block as usize, Ordering::Release);
}

/// The initialization block.
///
/// # Panics
/// Before [`set_init_block`] ran.
#[must_use]
pub fn init_block() -> &'static KernelInitBlock {
    let block = INIT_BLOCK.load(Ordering::Acquire);
    assert_ne!(block, 0, "initialization block not published yet");
    // SAFETY: published per set_init_block's contract.
    unsafe { &*(block as *const KernelInitBlock) }
}

/// The kernel command line as a wide slice, if one was passed.
#[must_use]
pub fn kernel_parameters() -> Option<&'static [u16]> {
    let parameters = init_block().kernel_parameters;
    if parameters.is_null() {
        return None;
    }
    // SAFETY: the loader null-terminates the command line.
    Some(unsafe { widestr::wide_slice(parameters) })
}

/// Locates `name` as a whole token of the command line (see
/// [`widestr::find_parameter`] for the matching rules).
#[must_use]
pub fn get_kernel_parameter(name: &str) -> Option<&'static [u16]> {
    let command_line = kernel_parameters()?;
    let start = widestr::find_parameter(command_line, name).ok()?;
    Some(&command_line[start..])
}

/// Whether a boolean parameter is enabled on the command line.
#[must_use]
pub fn get_boolean_parameter(name: &str) -> bool {
    kernel_parameters().is_some_and(|command_line| widestr::boolean_parameter(command_line, name))
}

/// Head of the hand-off system-resources list.
#[must_use]
pub fn get_system_resources() -> *mut ListEntry {
    core::ptr::from_ref(&init_block().system_resources_list_head).cast_mut()
}

/// Head of the hand-off memory-descriptor list.
#[must_use]
pub fn get_memory_descriptors() -> *mut ListEntry {
    core::ptr::from_ref(&init_block().memory_descriptor_list_head).cast_mut()
}

/// Firmware that booted the machine.
#[must_use]
pub fn get_firmware_type() -> FirmwareType {
    init_block().firmware_information.firmware_type
}

/// Paging depth the loader built the address space with.
#[must_use]
pub fn page_map_level() -> PageMapLevel {
    match init_block().loader_information.page_map_level {
        2 => PageMapLevel::Pml2,
        3 => PageMapLevel::Pml3,
        5 => PageMapLevel::Pml5,
        _ => PageMapLevel::Pml4,
    }
}

/// Prints through the loader's debug callback, while it is still usable.
///
/// The one output path that exists before the kernel's own sink dispatcher;
/// silently does nothing once the loader pointer is gone.
pub fn loader_debug_print(text: &str) {
    if INIT_BLOCK.load(Ordering::Acquire) == 0 {
        return;
    }
    let Some(debug_print) = init_block().loader_information.debug_print else {
        return;
    };

    // Re-encode into a bounded wide buffer, chunk by chunk.
    let mut buffer = [0u16; 128];
    let mut used = 0usize;
    for unit in text.encode_utf16() {
        buffer[used] = unit;
        used += 1;
        if used == buffer.len() - 1 {
            buffer[used] = 0;
            // SAFETY: null-terminated buffer; callback provided by loader.
            unsafe { debug_print(buffer.as_ptr()) };
            used = 0;
        }
    }
    if used > 0 {
        buffer[used] = 0;
        // SAFETY: as above.
        unsafe { debug_print(buffer.as_ptr()) };
    }
}
