//! # Debug Print Dispatcher
//!
//! Formatted kernel output fans out to every registered sink — the serial
//! port, the framebuffer console, or anything else that can take
//! characters. Sinks register a writer callback; registration inserts at
//! the head, and [`debug_print!`] formats once per sink through a
//! `core::fmt` adapter.
//!
//! Which sinks come up is decided by the `DEBUG=` kernel parameter:
//! `;`-separated specifiers of the form `COMn[,baud]`, `COM0:0xADDR[,baud]`
//! or `SCREEN`. The serial sink only registers if its probe succeeded; the
//! screen sink only if the framebuffer initialized.
//!
//! The dispatcher doubles as the `log` facade's backend, so `log::info!`
//! and friends land on the same sinks.

use kernel_info::widestr::{wide_eq_ascii, wide_tokenize};
use kernel_sync::SpinMutex;
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Upper bound on registered sinks.
pub const MAX_SINKS: usize = 4;

/// Upper bound on `DEBUG=` specifiers honored.
pub const MAX_SELECTORS: usize = 4;

/// A sink's writer callback: receives fully formatted text.
pub type SinkWriter = fn(&str);

/// The global sink registry.
static SINKS: SpinMutex<[Option<SinkWriter>; MAX_SINKS]> = SpinMutex::new([None; MAX_SINKS]);

/// Registers a sink, newest first.
///
/// Returns false when the registry is full.
pub fn register_sink(writer: SinkWriter) -> bool {
    let mut sinks = SINKS.lock();
    if sinks[MAX_SINKS - 1].is_some() {
        return false;
    }
    // Insert at the head; existing sinks shift toward the tail.
    for slot in (1..MAX_SINKS).rev() {
        sinks[slot] = sinks[slot - 1];
    }
    sinks[0] = Some(writer);
    true
}

/// Drops every registered sink (tests and kernel re-initialization).
pub fn reset_sinks() {
    *SINKS.lock() = [None; MAX_SINKS];
}

/// Sends already formatted text to every sink.
pub fn broadcast(text: &str) {
    let sinks = *SINKS.lock();
    for writer in sinks.into_iter().flatten() {
        writer(text);
    }
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments<'_>) {
    struct Broadcast;
    impl core::fmt::Write for Broadcast {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            broadcast(s);
            Ok(())
        }
    }
    let _ = core::fmt::write(&mut Broadcast, args);
}

/// Formats once and fans out to every registered debug sink.
#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        $crate::dbgout::_print(core::format_args!($($arg)*))
    };
}

/// The `log` facade backend over the sink registry.
pub struct DebugLogger {
    max_level: LevelFilter,
}

impl DebugLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Installs this logger as the global `log` backend.
    ///
    /// # Errors
    /// Propagates `log`'s error when a logger is already installed.
    pub fn install(&'static self) -> Result<(), log::SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

impl Log for DebugLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            let level = match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN",
                Level::Info => "INFO",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            };
            debug_print!("[{}] {}\n", level, record.args());
        }
    }

    fn flush(&self) {}
}

/// One parsed `DEBUG=` specifier.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SinkSelector {
    /// A serial port: by number, or by explicit address when `number` is 0.
    Com { number: u32, address: u16, baud: u32 },
    /// The framebuffer console.
    Screen,
}

/// Parses the `;`-separated `DEBUG=` value.
///
/// Unparseable specifiers are skipped; at most [`MAX_SELECTORS`] survive.
#[must_use]
pub fn parse_debug_selectors(value: &[u16]) -> ([Option<SinkSelector>; MAX_SELECTORS], usize) {
    let mut selectors = [None; MAX_SELECTORS];
    let mut count = 0usize;

    for token in wide_tokenize(value, b";") {
        if count == MAX_SELECTORS {
            break;
        }
        if wide_eq_ascii(token, "SCREEN") {
            selectors[count] = Some(SinkSelector::Screen);
            count += 1;
        } else if let Some(com) = parse_com(token) {
            selectors[count] = Some(com);
            count += 1;
        }
    }

    (selectors, count)
}

/// Parses `COMn[,baud]` or `COM0:0xADDR[,baud]`.
fn parse_com(token: &[u16]) -> Option<SinkSelector> {
    if token.len() < 4 || !wide_eq_ascii(&token[..3], "COM") {
        return None;
    }
    let mut rest = &token[3..];

    // Port number, possibly zero.
    let mut number: u32 = 0;
    let mut digits = 0usize;
    while let Some(&c) = rest.first() {
        let Some(digit) = char_digit(c, 10) else { break };
        number = number * 10 + digit;
        digits += 1;
        rest = &rest[1..];
    }
    if digits == 0 {
        return None;
    }

    // COM0 takes an explicit port address.
    let mut address: u16 = 0;
    if number == 0 {
        if rest.len() < 3 || !wide_eq_ascii(&rest[..3], ":0x") {
            return None;
        }
        rest = &rest[3..];
        let mut value: u32 = 0;
        let mut hex_digits = 0usize;
        while let Some(&c) = rest.first() {
            let Some(digit) = char_digit(c, 16) else { break };
            value = value * 16 + digit;
            hex_digits += 1;
            rest = &rest[1..];
        }
        if hex_digits == 0 {
            return None;
        }
        address = u16::try_from(value).ok()?;
    }

    // Optional baud rate.
    let mut baud: u32 = 0;
    if rest.first() == Some(&u16::from(b',')) {
        rest = &rest[1..];
        while let Some(&c) = rest.first() {
            let Some(digit) = char_digit(c, 10) else { break };
            baud = baud * 10 + digit;
            rest = &rest[1..];
        }
    }

    if !rest.is_empty() {
        return None;
    }

    Some(SinkSelector::Com {
        number,
        address,
        baud,
    })
}

fn char_digit(c: u16, radix: u32) -> Option<u32> {
    char::from_u32(u32::from(c))?.to_digit(radix)
}

/// Standard COM port addresses by number (1-based).
#[must_use]
pub const fn com_port_address(number: u32) -> Option<u16> {
    match number {
        1 => Some(0x3F8),
        2 => Some(0x2F8),
        3 => Some(0x3E8),
        4 => Some(0x2E8),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn w(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn selector_grammar() {
        let (selectors, count) = parse_debug_selectors(&w("COM1,115200;SCREEN"));
        assert_eq!(count, 2);
        assert_eq!(
            selectors[0],
            Some(SinkSelector::Com {
                number: 1,
                address: 0,
                baud: 115_200
            })
        );
        assert_eq!(selectors[1], Some(SinkSelector::Screen));

        let (selectors, count) = parse_debug_selectors(&w("COM0:0x3E8,9600"));
        assert_eq!(count, 1);
        assert_eq!(
            selectors[0],
            Some(SinkSelector::Com {
                number: 0,
                address: 0x3E8,
                baud: 9600
            })
        );

        // Bare COMn without baud; case-insensitive SCREEN.
        let (selectors, count) = parse_debug_selectors(&w("com2;screen"));
        assert_eq!(count, 2);
        assert_eq!(
            selectors[0],
            Some(SinkSelector::Com {
                number: 2,
                address: 0,
                baud: 0
            })
        );

        // Garbage specifiers are skipped, not fatal.
        let (_, count) = parse_debug_selectors(&w("LPT1;COM0:zzz;SCREEN"));
        assert_eq!(count, 1);
    }

    #[test]
    fn com_addresses() {
        assert_eq!(com_port_address(1), Some(0x3F8));
        assert_eq!(com_port_address(4), Some(0x2E8));
        assert_eq!(com_port_address(9), None);
    }

    static CAPTURED: StdMutex<String> = StdMutex::new(String::new());

    fn capture_sink(text: &str) {
        CAPTURED.lock().unwrap().push_str(text);
    }

    fn tag_sink(_text: &str) {
        CAPTURED.lock().unwrap().push('|');
    }

    #[test]
    fn broadcast_reaches_sinks_newest_first() {
        reset_sinks();
        CAPTURED.lock().unwrap().clear();

        assert!(register_sink(capture_sink));
        assert!(register_sink(tag_sink));

        debug_print!("x={}", 7);
        let captured = CAPTURED.lock().unwrap().clone();
        // Both sinks saw the output; the tag sink (registered last) runs
        // first for every formatted piece.
        assert_eq!(captured.replace('|', ""), "x=7");
        assert!(captured.starts_with('|'));

        reset_sinks();
        debug_print!("dropped");
        assert_eq!(*CAPTURED.lock().unwrap(), captured, "no sinks, no output");
    }
}
