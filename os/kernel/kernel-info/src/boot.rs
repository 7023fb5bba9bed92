//! # The Initialization Block
//!
//! The single record the loader hands to the kernel entry point. It is built
//! in loader-owned memory, mapped into the kernel's address space, and stays
//! immutable for the lifetime of the system; the kernel indexes into it
//! throughout bring-up.

use crate::list::ListEntry;

/// Current layout version of [`KernelInitBlock`].
pub const INIT_BLOCK_VERSION: u32 = 1;

/// Version of the boot protocol between loader and kernel.
pub const BOOT_PROTOCOL_VERSION: u32 = 1;

/// Signature of the kernel entry point the loader jumps to.
///
/// The System V ABI applies: the loader's hand-off trampoline moves the block
/// pointer into `RDI` before the jump.
pub type KernelEntryFn = extern "C" fn(*const KernelInitBlock) -> !;

/// Signature of the loader-provided debug-print callback.
///
/// Takes a null-terminated wide string. Usable by the kernel until its own
/// debug sink dispatcher is initialized.
pub type LoaderDebugPrintFn = unsafe extern "C" fn(*const u16);

/// Which firmware booted the machine.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FirmwareType {
    Invalid = 0,
    Unknown,
    Efi,
    Pcat,
}

/// Loader-internal facts the kernel may use during bring-up.
#[repr(C)]
#[derive(Debug)]
pub struct LoaderInformation {
    /// Debug-print callback, or null once boot services are gone and the
    /// loader console with them.
    pub debug_print: Option<LoaderDebugPrintFn>,
    /// Paging depth the loader built the address space with (2, 3, 4 or 5).
    pub page_map_level: u32,
}

/// EFI-specific firmware facts.
#[repr(C)]
#[derive(Debug)]
pub struct EfiFirmwareInformation {
    /// Firmware revision from the system table.
    pub version: u32,
    /// Physical address of the EFI runtime services table.
    pub runtime_services: u64,
}

/// PC/AT BIOS firmware facts (placeholder; PCAT boot is not implemented).
#[repr(C)]
#[derive(Debug)]
pub struct PcatFirmwareInformation {
    pub reserved: u64,
}

/// Firmware-specific payload, discriminated by
/// [`FirmwareInformation::firmware_type`].
#[repr(C)]
pub union FirmwarePayload {
    pub efi: core::mem::ManuallyDrop<EfiFirmwareInformation>,
    pub pcat: core::mem::ManuallyDrop<PcatFirmwareInformation>,
}

/// Firmware identification for the kernel.
#[repr(C)]
pub struct FirmwareInformation {
    pub firmware_type: FirmwareType,
    pub payload: FirmwarePayload,
}

impl core::fmt::Debug for FirmwareInformation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FirmwareInformation")
            .field("firmware_type", &self.firmware_type)
            .finish_non_exhaustive()
    }
}

/// The loader → kernel hand-off record.
///
/// Field order and widths are ABI. List heads are circular
/// [`ListEntry`]-style lists whose nodes live in loader-owned memory.
#[repr(C)]
#[derive(Debug)]
pub struct KernelInitBlock {
    /// Total size of this record in bytes.
    pub size: u32,
    /// Layout version; see [`INIT_BLOCK_VERSION`].
    pub version: u32,
    /// Boot-protocol version; see [`BOOT_PROTOCOL_VERSION`].
    pub protocol_version: u32,
    /// Null-terminated wide kernel command line.
    pub kernel_parameters: *const u16,
    /// Load-order list of boot images.
    pub load_order_list_head: ListEntry,
    /// Memory descriptors ([`crate::memory::MemoryDescriptor`]).
    pub memory_descriptor_list_head: ListEntry,
    /// Boot drivers to hand to the I/O layer.
    pub boot_driver_list_head: ListEntry,
    /// System resources ([`crate::resources::SystemResourceHeader`]).
    pub system_resources_list_head: ListEntry,
    /// Loader-internal facts.
    pub loader_information: LoaderInformation,
    /// Firmware identification.
    pub firmware_information: FirmwareInformation,
}

impl KernelInitBlock {
    /// A block with empty (self-linked) lists and no command line.
    ///
    /// The loader fills the lists and pointers in place after construction;
    /// call [`KernelInitBlock::initialize_lists`] once the block has its
    /// final address.
    #[must_use]
    pub fn new() -> Self {
        Self {
            size: u32::try_from(core::mem::size_of::<Self>()).expect("block fits u32"),
            version: INIT_BLOCK_VERSION,
            protocol_version: BOOT_PROTOCOL_VERSION,
            kernel_parameters: core::ptr::null(),
            load_order_list_head: ListEntry::new(),
            memory_descriptor_list_head: ListEntry::new(),
            boot_driver_list_head: ListEntry::new(),
            system_resources_list_head: ListEntry::new(),
            loader_information: LoaderInformation {
                debug_print: None,
                page_map_level: 4,
            },
            firmware_information: FirmwareInformation {
                firmware_type: FirmwareType::Unknown,
                payload: FirmwarePayload {
                    pcat: core::mem::ManuallyDrop::new(PcatFirmwareInformation { reserved: 0 }),
                },
            },
        }
    }

    /// Self-links all four list heads.
    ///
    /// # Safety
    /// Must be called exactly once, after the block has reached the memory
    /// it will live at; list heads hold absolute pointers.
    pub unsafe fn initialize_lists(block: *mut Self) {
        unsafe {
            ListEntry::initialize_head(&raw mut (*block).load_order_list_head);
            ListEntry::initialize_head(&raw mut (*block).memory_descriptor_list_head);
            ListEntry::initialize_head(&raw mut (*block).boot_driver_list_head);
            ListEntry::initialize_head(&raw mut (*block).system_resources_list_head);
        }
    }
}

impl Default for KernelInitBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::ListEntry;

    #[test]
    fn block_reports_its_own_size() {
        let block = KernelInitBlock::new();
        assert_eq!(block.size as usize, core::mem::size_of::<KernelInitBlock>());
        assert_eq!(block.version, INIT_BLOCK_VERSION);
    }

    #[test]
    fn lists_initialize_empty() {
        let mut block = KernelInitBlock::new();
        let ptr = &raw mut block;
        unsafe {
            KernelInitBlock::initialize_lists(ptr);
            assert!(ListEntry::is_empty(
                &raw const (*ptr).memory_descriptor_list_head
            ));
            assert!(ListEntry::is_empty(
                &raw const (*ptr).system_resources_list_head
            ));
        }
    }
}
