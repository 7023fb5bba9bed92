//! # The XTOS Boot Protocol
//!
//! Boots the native kernel: load the image through the PE/COFF loader
//! protocol, decide the paging depth, describe the machine in the
//! initialization block, build the address space, leave the firmware, and
//! jump.
//!
//! The hand-off sequencing is strict: page map first, hardware window
//! second, the LA57 trampoline staged third, boot services exited fourth,
//! CR3 written last (through the trampoline when five-level paging was
//! chosen).

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem::ManuallyDrop;
use kernel_hal::apic::APIC_BASE;
use kernel_info::boot::{
    EfiFirmwareInformation, FirmwarePayload, FirmwareType, KernelInitBlock,
};
use kernel_info::list::ListEntry;
use kernel_info::memory::{MemoryDescriptor, MemoryKind};
use kernel_info::resources::{
    AcpiResource, FramebufferResource, PixelFormat, SystemResourceHeader, SystemResourceType,
};
use kernel_memory_addresses::{
    PAGE_SHIFT, PageFrameNumber, PhysicalAddress, VirtualAddress, size_to_pages,
};
use kernel_vmem::PageMapLevel;
use log::{error, info};
use uefi::mem::memory_map::MemoryMap;
use uefi::proto::console::gop::GraphicsOutput;
use uefi::{Status, boot, guid, system};

use crate::config::Configuration;
use crate::memory::{MappingList, memory_kind_from_efi};
use crate::protocol::{
    self, BootProtocol, IMAGE_LOADER_PROTOCOL_GUID, ImageLoaderProtocol, LoadedImageInfo,
};
use crate::{loader, pagemap, volume};

/// GUID of the XTOS boot protocol.
pub const XTOS_PROTOCOL_GUID: uefi::Guid = guid!("9f4f3f2a-71a1-4d7a-8e2e-2f0d5a9b1c03");

/// Physical base of the local APIC's MMIO page.
const APIC_PHYSICAL_BASE: u64 = 0xFEE0_0000;

/// Kernel image path on the boot volume when the configuration is silent.
const DEFAULT_KERNEL_PATH: &str = "\\EFI\\Boot\\kernel.exe";

/// Pages of identity-mapped stack handed to the kernel entry.
const HANDOFF_STACK_PAGES: usize = 4;

/// Ceiling on hand-off memory descriptors (fixed before exit-boot-services,
/// since nothing may allocate afterwards).
const MAX_MEMORY_DESCRIPTORS: usize = 512;

static XTOS_PROTOCOL: BootProtocol = BootProtocol {
    boot_system,
};

/// Registers the protocol under its menu name.
pub fn register() {
    // SAFETY: the vtable is a static.
    let status = unsafe {
        protocol::install_protocol(
            XTOS_PROTOCOL_GUID,
            core::ptr::from_ref(&XTOS_PROTOCOL).cast_mut().cast(),
        )
    };
    if status == Status::SUCCESS {
        protocol::register_boot_protocol("XTOS", XTOS_PROTOCOL_GUID);
    }
}

/// Boots the system; returns only on failure.
fn boot_system(configuration: &Configuration) -> Status {
    match try_boot(configuration) {
        Ok(never) => match never {},
        Err(status) => {
            error!("XTOS boot failed: {status}");
            status
        }
    }
}

fn try_boot(configuration: &Configuration) -> Result<core::convert::Infallible, Status> {
    let kernel_parameters = configuration.value("PARAMETERS").unwrap_or("");
    let level = pagemap::determine_paging_level(kernel_parameters);
    info!("Booting XTOS with {level:?} paging");

    // The kernel image, through the external PE/COFF loader.
    let image = load_kernel_image(configuration)?;
    info!(
        "Kernel at {:#x} ({} bytes), entry {:#x}",
        image.physical_base, image.size, image.entry_point
    );

    let mut mappings = MappingList::new();

    // Kernel image at its linked virtual base.
    mappings.map_virtual_memory(
        VirtualAddress::new(image.virtual_base),
        PhysicalAddress::new(image.physical_base),
        size_to_pages(image.size),
        MemoryKind::LoadedProgram,
    );

    // Identity-mapped hand-off stack.
    let stack = boot::allocate_pages(
        boot::AllocateType::MaxAddress(0x1_0000_0000),
        boot::MemoryType::LOADER_DATA,
        HANDOFF_STACK_PAGES,
    )
    .map_err(|error| error.status())?;
    let stack_base = PhysicalAddress::from_nonnull(stack);
    mappings.map_virtual_memory(
        VirtualAddress::new(stack_base.as_u64()),
        stack_base,
        HANDOFF_STACK_PAGES as u64,
        MemoryKind::StartupKernelStack,
    );
    let stack_top =
        VirtualAddress::new(stack_base.as_u64() + ((HANDOFF_STACK_PAGES as u64) << PAGE_SHIFT) - 8);

    // The hardware window: the APIC register page at its architectural
    // home, plus an anchor page at the window base so the window's page
    // tables exist before the kernel's hardware pool first writes them.
    mappings.map_virtual_memory(
        VirtualAddress::new(APIC_BASE),
        PhysicalAddress::new(APIC_PHYSICAL_BASE),
        1,
        MemoryKind::HardwareCachedMemory,
    );
    mappings.map_virtual_memory(
        VirtualAddress::new(kernel_alloc_window_base()),
        PhysicalAddress::new(pagemap::TRAMPOLINE_ADDRESS),
        1,
        MemoryKind::HardwareCachedMemory,
    );

    // Loader-owned memory the kernel will index into: identity-map the
    // loader code/data regions (the block, lists and strings live there).
    map_loader_regions(&mut mappings)?;

    // The initialization block and everything it points at.
    let mut handoff = build_handoff(kernel_parameters, level)?;

    // Framebuffer: described as a resource and identity-mapped.
    describe_framebuffer(&mut handoff, &mut mappings);
    describe_acpi(&mut handoff);

    // Build the address space; then nothing may allocate.
    let page_map = pagemap::build_page_map(level, &mut mappings)?;

    if level == PageMapLevel::Pml5 {
        pagemap::stage_trampoline()?;
    }

    // Point of no return: leave the firmware.
    info!("Exiting boot services");
    loader::disable_boot_services();
    // SAFETY: no boot-services use after this call.
    let final_map = unsafe { boot::exit_boot_services(None) };

    // Translate the final memory map into hand-off descriptors (the
    // storage was preallocated; no allocation happens here).
    let block = handoff.block;
    // SAFETY: preallocated storage, sized for the firmware map.
    unsafe {
        fill_memory_descriptors(&mut handoff, &final_map);
        ListEntry::initialize_head(&raw mut (*block).load_order_list_head);
    }

    // SAFETY: the page map identity-maps this code, the stack and the
    // block; the kernel entry is mapped at its virtual base.
    unsafe {
        match level {
            PageMapLevel::Pml5 => pagemap::enter_kernel_pml5(
                page_map.root(),
                VirtualAddress::new(image.entry_point),
                VirtualAddress::from_ptr(block),
                stack_top,
            ),
            _ => pagemap::enter_kernel_pml4(
                page_map.root(),
                VirtualAddress::new(image.entry_point),
                VirtualAddress::from_ptr(block),
                stack_top,
            ),
        }
    }
}

/// First virtual page of the kernel's hardware window.
const fn kernel_alloc_window_base() -> u64 {
    0xFFFF_FFFF_FFC0_0000
}

/// Loads the kernel image through the image-loader protocol.
fn load_kernel_image(configuration: &Configuration) -> Result<LoadedImageInfo, Status> {
    let Some(interface) = protocol::open_protocol(&IMAGE_LOADER_PROTOCOL_GUID) else {
        error!("No image-loader protocol registered; load the loader modules first");
        return Err(Status::NOT_FOUND);
    };
    // SAFETY: interfaces under this GUID are image-loader vtables.
    let image_loader = unsafe { &*interface.cast::<ImageLoaderProtocol>() };

    let path = configuration.value("KERNEL").unwrap_or(DEFAULT_KERNEL_PATH);
    let path16 =
        uefi::CString16::try_from(path).map_err(|_| Status::INVALID_PARAMETER)?;
    let bytes = volume::load_boot_file(&path16)?;

    let result = (image_loader.load_image)(&bytes);
    protocol::close_protocol(&IMAGE_LOADER_PROTOCOL_GUID);
    result
}

/// Identity-maps the loader's own code and data regions.
fn map_loader_regions(mappings: &mut MappingList) -> Result<(), Status> {
    let map = boot::memory_map(boot::MemoryType::LOADER_DATA)
        .map_err(|error| error.status())?;
    for descriptor in map.entries() {
        if descriptor.ty == boot::MemoryType::LOADER_CODE
            || descriptor.ty == boot::MemoryType::LOADER_DATA
        {
            mappings.map_virtual_memory(
                VirtualAddress::new(descriptor.phys_start),
                PhysicalAddress::new(descriptor.phys_start),
                descriptor.page_count,
                memory_kind_from_efi(descriptor),
            );
        }
    }
    Ok(())
}

/// Everything hand-off owned: the block plus the storage its lists point
/// into. All of it leaks into loader-data memory the kernel inherits.
struct Handoff {
    block: *mut KernelInitBlock,
    descriptors: &'static mut Vec<MemoryDescriptor>,
}

/// Builds the initialization block with its command line and (empty)
/// descriptor storage.
fn build_handoff(kernel_parameters: &str, level: PageMapLevel) -> Result<Handoff, Status> {
    // The wide command line, null-terminated, leaked into loader data.
    let mut parameters: Vec<u16> = kernel_parameters.encode_utf16().collect();
    parameters.push(0);
    let parameters: &'static [u16] = Vec::leak(parameters);

    let mut block = Box::new(KernelInitBlock::new());
    block.kernel_parameters = parameters.as_ptr();
    block.loader_information.debug_print = Some(loader::handoff_debug_print);
    block.loader_information.page_map_level = level as u32;
    block.firmware_information.firmware_type = FirmwareType::Efi;
    block.firmware_information.payload = FirmwarePayload {
        efi: ManuallyDrop::new(EfiFirmwareInformation {
            version: u32::from(system::uefi_revision().major()),
            runtime_services: 0,
        }),
    };

    let block = Box::leak(block);
    let block: *mut KernelInitBlock = core::ptr::from_mut(block);
    // SAFETY: the block has reached its final address.
    unsafe { KernelInitBlock::initialize_lists(block) };

    // Descriptor storage, fixed capacity, filled after exit-boot-services.
    let descriptors = Box::leak(Box::new(Vec::with_capacity(MAX_MEMORY_DESCRIPTORS)));

    Ok(Handoff { block, descriptors })
}

/// Converts the final firmware memory map into hand-off descriptors and
/// links them into the block. Runs after exit-boot-services: no
/// allocation, the storage is preallocated.
unsafe fn fill_memory_descriptors(
    handoff: &mut Handoff,
    final_map: &impl MemoryMap,
) {
    let list_head = unsafe { &raw mut (*handoff.block).memory_descriptor_list_head };
    for descriptor in final_map.entries() {
        if handoff.descriptors.len() == handoff.descriptors.capacity() {
            break;
        }
        handoff.descriptors.push(MemoryDescriptor::new(
            memory_kind_from_efi(descriptor),
            PageFrameNumber::from_address(PhysicalAddress::new(descriptor.phys_start)).as_u64(),
            descriptor.page_count,
        ));
        let node = handoff.descriptors.last_mut().expect("just pushed");
        // SAFETY: the node has reached its final (leaked) address.
        unsafe { ListEntry::insert_tail(list_head, &raw mut node.list_entry) };
    }
}

/// Queries the graphics output protocol and describes the framebuffer as a
/// hand-off resource; identity-maps the aperture.
fn describe_framebuffer(handoff: &mut Handoff, mappings: &mut MappingList) {
    let Ok(gop_handle) = boot::get_handle_for_protocol::<GraphicsOutput>() else {
        info!("No graphics output protocol; booting headless");
        return;
    };
    let Ok(mut gop) = boot::open_protocol_exclusive::<GraphicsOutput>(gop_handle) else {
        return;
    };

    let mode = gop.current_mode_info();
    let (width, height) = mode.resolution();
    let mut framebuffer = gop.frame_buffer();
    let base = PhysicalAddress::from_ptr(framebuffer.as_mut_ptr());
    let size = framebuffer.size() as u64;

    let format = match mode.pixel_format() {
        uefi::proto::console::gop::PixelFormat::Rgb => PixelFormat {
            red_shift: 0,
            red_size: 8,
            green_shift: 8,
            green_size: 8,
            blue_shift: 16,
            blue_size: 8,
            reserved_shift: 24,
            reserved_size: 8,
        },
        uefi::proto::console::gop::PixelFormat::Bgr => PixelFormat {
            blue_shift: 0,
            blue_size: 8,
            green_shift: 8,
            green_size: 8,
            red_shift: 16,
            red_size: 8,
            reserved_shift: 24,
            reserved_size: 8,
        },
        _ => {
            info!("Framebuffer pixel format unsupported; booting headless");
            return;
        }
    };

    let resource = Box::leak(Box::new(FramebufferResource {
        header: SystemResourceHeader::new(
            SystemResourceType::Framebuffer,
            core::mem::size_of::<FramebufferResource>() as u32,
        ),
        base,
        buffer_size: size,
        width: width as u32,
        height: height as u32,
        bits_per_pixel: 32,
        pitch: mode.stride() as u32 * 4,
        pixels_per_scanline: mode.stride() as u32,
        format,
        font: core::ptr::null(),
    }));

    mappings.map_virtual_memory(
        VirtualAddress::new(base.as_u64()),
        base,
        size_to_pages(size),
        MemoryKind::HardwareCachedMemory,
    );

    // SAFETY: block and resource have stable (leaked) addresses.
    unsafe {
        ListEntry::insert_tail(
            &raw mut (*handoff.block).system_resources_list_head,
            &raw mut resource.header.list_entry,
        );
    }
}

/// Locates the ACPI root pointer and describes it as a hand-off resource.
fn describe_acpi(handoff: &mut Handoff) {
    use uefi::table::cfg::{ACPI_GUID, ACPI2_GUID};

    let (rsdp, extended) = system::with_config_table(|entries| {
        let mut legacy = None;
        for entry in entries {
            if entry.guid == ACPI2_GUID {
                return (entry.address as u64, true);
            }
            if entry.guid == ACPI_GUID {
                legacy = Some(entry.address as u64);
            }
        }
        (legacy.unwrap_or(0), false)
    });
    if rsdp == 0 {
        info!("No ACPI tables advertised by the firmware");
        return;
    }

    let resource = Box::leak(Box::new(AcpiResource {
        header: SystemResourceHeader::new(
            SystemResourceType::Acpi,
            core::mem::size_of::<AcpiResource>() as u32,
        ),
        rsdp_physical: PhysicalAddress::new(rsdp),
        rsdp_virtual: VirtualAddress::zero(),
        extended,
    }));

    // SAFETY: block and resource have stable (leaked) addresses.
    unsafe {
        ListEntry::insert_tail(
            &raw mut (*handoff.block).system_resources_list_head,
            &raw mut resource.header.list_entry,
        );
    }
}
