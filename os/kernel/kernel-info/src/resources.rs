//! # System Resource Records
//!
//! Firmware-discovered hardware the loader describes for the kernel: the
//! framebuffer and the ACPI root pointer. Every record starts with a
//! [`SystemResourceHeader`]; the `resource_type` discriminates which concrete
//! record follows. The kernel validates `resource_size` against the expected
//! layout before trusting a record (see the boot-info consumer).

use crate::list::ListEntry;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Discriminator for the concrete resource layout following the header.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum SystemResourceType {
    /// Unused slot.
    Invalid = 0,
    /// ACPI root pointer ([`AcpiResource`]).
    Acpi,
    /// Boot framebuffer ([`FramebufferResource`]).
    Framebuffer,
}

/// Common prefix of every system-resource record.
#[repr(C)]
#[derive(Debug)]
pub struct SystemResourceHeader {
    /// Link in the hand-off (later: kernel-private) resource list.
    pub list_entry: ListEntry,
    /// Concrete record kind.
    pub resource_type: SystemResourceType,
    /// Total record size in bytes, header included.
    pub resource_size: u32,
    /// Whether some component has acquired exclusive ownership.
    pub resource_locked: bool,
}

impl SystemResourceHeader {
    /// A detached header for a record of `resource_size` bytes.
    #[must_use]
    pub const fn new(resource_type: SystemResourceType, resource_size: u32) -> Self {
        Self {
            list_entry: ListEntry::new(),
            resource_type,
            resource_size,
            resource_locked: false,
        }
    }
}

/// ACPI root-pointer resource.
#[repr(C)]
#[derive(Debug)]
pub struct AcpiResource {
    pub header: SystemResourceHeader,
    /// Physical address of the RSDP.
    pub rsdp_physical: PhysicalAddress,
    /// Virtual address of the RSDP once mapped, or null.
    pub rsdp_virtual: VirtualAddress,
    /// Whether the pointer is the extended (ACPI 2.0+, XSDT) form.
    pub extended: bool,
}

/// Channel layout of a framebuffer pixel: bit offset and width per channel.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct PixelFormat {
    pub red_shift: u8,
    pub red_size: u8,
    pub green_shift: u8,
    pub green_size: u8,
    pub blue_shift: u8,
    pub blue_size: u8,
    pub reserved_shift: u8,
    pub reserved_size: u8,
}

/// Boot framebuffer resource.
///
/// Describes the linear framebuffer the firmware's graphics output protocol
/// left behind. `font` optionally points at an SSFN font blob the console
/// renders glyphs from.
#[repr(C)]
#[derive(Debug)]
pub struct FramebufferResource {
    pub header: SystemResourceHeader,
    /// Physical base of the linear framebuffer.
    pub base: PhysicalAddress,
    /// Total framebuffer aperture in bytes.
    pub buffer_size: u64,
    /// Visible width in pixels.
    pub width: u32,
    /// Visible height in pixels.
    pub height: u32,
    /// Bits per pixel.
    pub bits_per_pixel: u32,
    /// Bytes per scanline (may exceed `width * bytes_per_pixel`).
    pub pitch: u32,
    /// Pixels per scanline as reported by the firmware.
    pub pixels_per_scanline: u32,
    /// Channel layout within a pixel.
    pub format: PixelFormat,
    /// SSFN font blob, or null if no font was provided.
    pub font: *const u8,
}
