//! # Loader State
//!
//! Process-global facts gathered at initialization: whether boot services
//! are still available, the loader image's own base and size, the Secure
//! Boot status, and the debug console. Also home of the loader's `log`
//! backend, which mirrors records to the firmware console while it exists
//! and to the serial debug port once one is configured.

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use kernel_hal::dbgout::{SinkSelector, com_port_address, parse_debug_selectors};
use kernel_hal::serial::ComPort;
use kernel_ports::HardwarePorts;
use kernel_sync::SpinMutex;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use uefi::proto::loaded_image::LoadedImage;
use uefi::{Status, boot, cstr16, runtime};

/// Cleared immediately before `ExitBootServices`.
static BOOT_SERVICES_AVAILABLE: AtomicBool = AtomicBool::new(true);

/// Loader image extent, captured from the loaded-image protocol.
static LOADER_BASE: AtomicUsize = AtomicUsize::new(0);
static LOADER_SIZE: AtomicU64 = AtomicU64::new(0);

/// Secure Boot status: −1 setup mode, 0 disabled, 1 enabled.
static SECURE_BOOT: AtomicI64 = AtomicI64::new(0);

/// The serial debug console, once `DEBUG=` selects one.
static DEBUG_PORT: SpinMutex<ComPort> = SpinMutex::new(ComPort::new());

/// Whether EFI boot services may still be called.
pub fn boot_services_available() -> bool {
    BOOT_SERVICES_AVAILABLE.load(Ordering::Acquire)
}

/// Marks boot services gone; console output stops using them.
pub fn disable_boot_services() {
    BOOT_SERVICES_AVAILABLE.store(false, Ordering::Release);
}

/// The loader image's base address and size.
pub fn loader_image_information() -> (usize, u64) {
    (
        LOADER_BASE.load(Ordering::Acquire),
        LOADER_SIZE.load(Ordering::Acquire),
    )
}

/// The Secure Boot status recorded at initialization.
pub fn secure_boot_status() -> i64 {
    SECURE_BOOT.load(Ordering::Acquire)
}

/// Captures loader state: image extent and Secure Boot.
///
/// # Errors
/// The firmware status when the loaded-image protocol is unreachable.
pub fn initialize() -> Result<(), Status> {
    // Our own image: base and size.
    let image = boot::image_handle();
    match boot::open_protocol_exclusive::<LoadedImage>(image) {
        Ok(loaded_image) => {
            let (base, size) = loaded_image.info();
            LOADER_BASE.store(base as usize, Ordering::Release);
            LOADER_SIZE.store(size, Ordering::Release);
        }
        Err(error) => return Err(error.status()),
    }

    // Secure Boot, cross-checked against setup mode.
    let secure_boot = read_global_variable_byte(cstr16!("SecureBoot")).unwrap_or(0);
    let setup_mode = read_global_variable_byte(cstr16!("SetupMode")).unwrap_or(0);
    let status = if setup_mode != 0 {
        -1
    } else {
        i64::from(secure_boot != 0)
    };
    SECURE_BOOT.store(status, Ordering::Release);

    Ok(())
}

/// One byte of an EFI global variable.
fn read_global_variable_byte(name: &uefi::CStr16) -> Option<u8> {
    let mut buffer = [0u8; 1];
    let (data, _) = runtime::get_variable(
        name,
        &runtime::VariableVendor::GLOBAL_VARIABLE,
        &mut buffer,
    )
    .ok()?;
    data.first().copied()
}

/// The command line from the loaded image's load options.
#[must_use]
pub fn command_line() -> String {
    let image = boot::image_handle();
    let Ok(loaded_image) = boot::open_protocol_exclusive::<LoadedImage>(image) else {
        return String::new();
    };
    let Some(bytes) = loaded_image.load_options_as_bytes() else {
        return String::new();
    };

    // Load options are UCS-2; decode leniently and drop the terminator.
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Brings up the serial debug console from a full command line
/// (`DEBUG=...` somewhere in it).
pub fn initialize_debug_console(command_line: &str) {
    if let Some(value) = crate::config::value_of(command_line, "DEBUG") {
        initialize_debug_console_from_value(value);
    }
}

/// Brings up the serial debug console from the `DEBUG=` value itself.
pub fn initialize_debug_console_from_value(value: &str) {
    let wide: Vec<u16> = value.encode_utf16().collect();
    let (selectors, count) = parse_debug_selectors(&wide);
    for selector in selectors.iter().take(count).flatten() {
        if let SinkSelector::Com {
            number,
            address,
            baud,
        } = *selector
        {
            let address = if number == 0 {
                Some(address)
            } else {
                com_port_address(number)
            };
            if let Some(address) = address {
                let mut port = DEBUG_PORT.lock();
                match port.initialize(&mut HardwarePorts, address, baud) {
                    Ok(()) => log::info!("Debug console on COM port {address:#x}"),
                    // Loader diagnostics stay in the firmware status space.
                    Err(status) => {
                        log::warn!("COM port {address:#x}: {}", status.into_firmware());
                    }
                }
            }
        }
        // The SCREEN sink means the firmware console here, which the
        // logger already mirrors to.
    }
}

/// Writes to the serial debug console, if one is up.
pub fn debug_console_write(text: &str) {
    let mut port = DEBUG_PORT.lock();
    if !port.initialized() {
        return;
    }
    let mut ports = HardwarePorts;
    for byte in text.bytes() {
        if byte == b'\n' {
            let _ = port.put_byte(&mut ports, b'\r');
        }
        let _ = port.put_byte(&mut ports, byte);
    }
}

/// The loader's `log` backend.
pub struct LoaderLogger {
    max_level: LevelFilter,
}

impl LoaderLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Installs the logger; call once during early initialization.
    ///
    /// # Errors
    /// Propagates `log`'s error when a logger is already set.
    pub fn init(self) -> Result<(), SetLoggerError> {
        static LOGGER: SpinMutex<Option<LoaderLogger>> = SpinMutex::new(None);
        let mut slot = LOGGER.lock();
        *slot = Some(self);
        // SAFETY: the static never drops its contents after this point.
        let logger: &'static LoaderLogger =
            unsafe { &*core::ptr::from_ref(slot.as_ref().expect("just stored")) };
        drop(slot);
        log::set_logger(logger)?;
        log::set_max_level(LevelFilter::Trace);
        Ok(())
    }
}

impl Log for LoaderLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Serial first: it outlives boot services.
        debug_console_write_fmt(format_args!(
            "[{}] {}\n",
            record.level(),
            record.args()
        ));

        if boot_services_available() {
            uefi::println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

fn debug_console_write_fmt(args: core::fmt::Arguments<'_>) {
    struct SerialWriter;
    impl core::fmt::Write for SerialWriter {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            debug_console_write(s);
            Ok(())
        }
    }
    let _ = core::fmt::write(&mut SerialWriter, args);
}

/// The debug-print callback handed to the kernel in the initialization
/// block: wide string in, serial console out.
pub unsafe extern "C" fn handoff_debug_print(text: *const u16) {
    if text.is_null() {
        return;
    }
    // SAFETY: the caller passes a null-terminated wide string.
    let wide = unsafe { kernel_info::widestr::wide_slice(text) };
    let mut buffer = [0u8; 128];
    let mut used = 0usize;
    for &unit in wide {
        let byte = if unit < 0x80 { unit as u8 } else { b'?' };
        buffer[used] = byte;
        used += 1;
        if used == buffer.len() {
            if let Ok(text) = core::str::from_utf8(&buffer[..used]) {
                debug_console_write(text);
            }
            used = 0;
        }
    }
    if used > 0
        && let Ok(text) = core::str::from_utf8(&buffer[..used])
    {
        debug_console_write(text);
    }
}
