//! # System Resources
//!
//! The loader describes firmware-discovered hardware as typed records on
//! the hand-off list. Bring-up validates each record against the expected
//! size for its type and moves the good ones onto the kernel's private
//! list; afterwards components acquire and release them under the resource
//! lock with interrupts disabled.
//!
//! The debug sinks live here too, because both of them are backed by
//! resources: the framebuffer sink by the framebuffer record, the serial
//! sink by the probed COM port.

use crate::bootinfo;
use kernel_hal::framebuffer::FrameBuffer;
use kernel_hal::serial::ComPort;
use kernel_hal::{dbgout, debug_print};
use kernel_info::containing_record;
use kernel_info::list::ListEntry;
use kernel_info::resources::{
    AcpiResource, FramebufferResource, SystemResourceHeader, SystemResourceType,
};
use kernel_ports::HardwarePorts;
use kernel_status::Status;
use kernel_sync::{RawSpin, SpinMutex};

/// The kernel-private resource list and its lock.
static RESOURCES_LOCK: RawSpin = RawSpin::new();
static mut RESOURCES_LIST: ListEntry = ListEntry::new();

/// Adopts valid resources from the hand-off list.
///
/// A record is valid when its declared size matches the layout its type
/// implies; anything else stays on the loader list and is ignored.
///
/// # Safety
/// Once, during single-processor bring-up, with the hand-off lists mapped.
pub unsafe fn initialize_system_resources() {
    let kernel_list = &raw mut RESOURCES_LIST;
    // SAFETY: bring-up is single-threaded; the list head is unshared.
    unsafe {
        ListEntry::initialize_head(kernel_list);

        let loader_list = bootinfo::get_system_resources();
        let mut entry = (*loader_list).flink;
        while entry != loader_list {
            let next = (*entry).flink;
            let header = containing_record!(entry, SystemResourceHeader, list_entry);

            let expected = match (*header).resource_type {
                SystemResourceType::Acpi => core::mem::size_of::<AcpiResource>() as u32,
                SystemResourceType::Framebuffer => {
                    core::mem::size_of::<FramebufferResource>() as u32
                }
                SystemResourceType::Invalid => 0,
            };

            if expected != 0 && expected == (*header).resource_size {
                ListEntry::remove(entry);
                ListEntry::insert_tail(kernel_list, entry);
            }

            entry = next;
        }
    }
}

/// Common lookup under the lock; optionally takes ownership.
fn get_system_resource(
    resource_type: SystemResourceType,
    acquire: bool,
) -> Result<*mut SystemResourceHeader, Status> {
    let interrupts = kernel_ports::interrupts_enabled();
    // The list is touched from interrupt paths; fence them out.
    // SAFETY: immediately re-enabled below when they were on.
    unsafe { kernel_ports::clear_interrupt_flag() };
    RESOURCES_LOCK.lock();

    let mut result = Err(Status::NotFound);
    // SAFETY: the lock serializes list access; nodes stay mapped.
    unsafe {
        for entry in ListEntry::iter(&raw mut RESOURCES_LIST) {
            let header = containing_record!(entry, SystemResourceHeader, list_entry);
            if (*header).resource_type != resource_type {
                continue;
            }
            if (*header).resource_locked {
                result = Err(Status::ResourceLocked);
                continue;
            }
            if acquire {
                (*header).resource_locked = true;
            }
            result = Ok(header);
            break;
        }

        RESOURCES_LOCK.unlock();
        if interrupts {
            kernel_ports::set_interrupt_flag();
        }
    }
    result
}

/// Finds and takes exclusive ownership of a resource.
///
/// # Errors
/// [`Status::ResourceLocked`] when every matching resource is owned,
/// [`Status::NotFound`] when none exists.
pub fn acquire_resource(
    resource_type: SystemResourceType,
) -> Result<*mut SystemResourceHeader, Status> {
    get_system_resource(resource_type, true)
}

/// Finds a resource without taking ownership.
///
/// # Errors
/// Same as [`acquire_resource`].
pub fn get_resource(
    resource_type: SystemResourceType,
) -> Result<*mut SystemResourceHeader, Status> {
    get_system_resource(resource_type, false)
}

/// Releases ownership taken with [`acquire_resource`].
///
/// # Safety
/// `header` must be a resource previously acquired by the caller.
pub unsafe fn release_resource(header: *mut SystemResourceHeader) {
    let interrupts = kernel_ports::interrupts_enabled();
    // SAFETY: same discipline as acquisition.
    unsafe {
        kernel_ports::clear_interrupt_flag();
        RESOURCES_LOCK.lock();
        (*header).resource_locked = false;
        RESOURCES_LOCK.unlock();
        if interrupts {
            kernel_ports::set_interrupt_flag();
        }
    }
}

/// The serial debug port behind the serial sink.
static SERIAL_PORT: SpinMutex<ComPort> = SpinMutex::new(ComPort::new());

fn serial_sink(text: &str) {
    let mut port = SERIAL_PORT.lock();
    let mut ports = HardwarePorts;
    for byte in text.bytes() {
        if byte == b'\n' {
            let _ = port.put_byte(&mut ports, b'\r');
        }
        let _ = port.put_byte(&mut ports, byte);
    }
}

/// Probes the COM port and registers the serial sink if it is present.
pub fn register_serial_sink(address: u16, baud: u32) {
    let mut port = SERIAL_PORT.lock();
    if port.initialized() {
        drop(port);
        let _ = dbgout::register_sink(serial_sink);
        return;
    }
    match port.initialize(&mut HardwarePorts, address, baud) {
        Ok(()) => {
            drop(port);
            let _ = dbgout::register_sink(serial_sink);
            debug_print!("Serial debug sink on port {:#x}\n", address);
        }
        Err(status) => {
            bootinfo::loader_debug_print("Serial debug port not found\n");
            let _ = status;
        }
    }
}

/// The framebuffer console behind the screen sink.
static CONSOLE: SpinMutex<Console> = SpinMutex::new(Console::new());

/// A trivial text console over the framebuffer device.
struct Console {
    device: FrameBuffer,
    column: u32,
    row: u32,
    glyph_width: u32,
    glyph_height: u32,
}

impl Console {
    const fn new() -> Self {
        Self {
            device: FrameBuffer::new(),
            column: 0,
            row: 0,
            glyph_width: 8,
            glyph_height: 16,
        }
    }

    fn write(&mut self, text: &str) {
        if !self.device.initialized() {
            return;
        }
        let columns = self.device.width() / self.glyph_width;
        let rows = self.device.height() / self.glyph_height;
        for character in text.chars() {
            match character {
                '\n' => {
                    self.column = 0;
                    self.row += 1;
                }
                '\r' => self.column = 0,
                _ => {
                    let mut encoded = [0u16; 2];
                    let units = character.encode_utf16(&mut encoded);
                    self.device.put_character(
                        self.column * self.glyph_width,
                        self.row * self.glyph_height,
                        0x00FF_FFFF,
                        units[0],
                    );
                    self.column += 1;
                    if self.column >= columns {
                        self.column = 0;
                        self.row += 1;
                    }
                }
            }
            if self.row >= rows {
                // No scrollback; wrap to the top.
                self.row = 0;
            }
        }
    }
}

fn framebuffer_sink(text: &str) {
    CONSOLE.lock().write(text);
}

/// Binds the framebuffer resource and registers the screen sink.
pub fn register_framebuffer_sink() {
    let Ok(header) = get_resource(SystemResourceType::Framebuffer) else {
        bootinfo::loader_debug_print("No framebuffer resource for the screen sink\n");
        return;
    };
    let resource = header.cast::<FramebufferResource>();

    let mut console = CONSOLE.lock();
    // SAFETY: the loader maps the aperture and the record outlives us.
    let status = unsafe { console.device.initialize(&*resource) };
    if status.is_ok() {
        // Take the glyph cell from the font header when one is attached.
        if console.device.font_valid() {
            // SAFETY: font_valid read the same header.
            unsafe {
                let font = (*resource).font;
                console.glyph_width = u32::from(*font.add(10)).max(1);
                console.glyph_height = u32::from(*font.add(11)).max(1);
            }
        }
        drop(console);
        let _ = dbgout::register_sink(framebuffer_sink);
    }
}
