//! # Loader Configuration
//!
//! Line-oriented `KEY=VALUE` configuration, `#` starting a comment. Two
//! sources merge: the configuration file on the boot volume and the
//! command line from the load options, with the command line winning.
//!
//! Well-known keys: `MODULES=` (space-separated module names), `DEBUG=`
//! (`;`-separated sink specifiers), `TUNE=` (space-separated tempo/pitch/
//! duration triplets for the optional beep module), plus whatever the boot
//! protocols consume (`KERNEL=`, `PARAMETERS=`).

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::warn;
use uefi::cstr16;

/// Path of the configuration file on the boot volume.
const CONFIG_FILE: &uefi::CStr16 = cstr16!("\\EFI\\Boot\\argon.ini");

/// Parsed configuration: ordered key/value pairs, last writer wins.
#[derive(Debug, Default)]
pub struct Configuration {
    entries: Vec<(String, String)>,
}

impl Configuration {
    /// The value for `key`, case-insensitively.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Stores `key=value`, shadowing earlier values.
    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.push((key.to_string(), value.to_string()));
    }
}

/// Parses configuration text into pairs.
///
/// Unparseable lines are reported and skipped; the boot continues with
/// whatever was valid.
#[must_use]
pub fn parse(text: &str) -> Configuration {
    let mut configuration = Configuration::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("Configuration line without '=': {line:?}");
            continue;
        };
        configuration.set(key.trim(), value.trim());
    }
    configuration
}

/// Loads the configuration file and merges the command line over it.
#[must_use]
pub fn load_and_parse(command_line: &str) -> Configuration {
    let mut configuration = match crate::volume::load_boot_file(CONFIG_FILE) {
        Ok(bytes) => parse(&String::from_utf8_lossy(&bytes)),
        Err(status) => {
            warn!("No configuration file ({status}); using defaults");
            Configuration::default()
        }
    };

    // Command-line tokens override file values.
    for token in command_line.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            configuration.set(key, value);
        } else {
            configuration.set(token, "");
        }
    }

    configuration
}

/// The value of `KEY=` inside a whitespace-tokenized command line.
#[must_use]
pub fn value_of<'a>(command_line: &'a str, key: &str) -> Option<&'a str> {
    command_line.split_whitespace().find_map(|token| {
        let (k, v) = token.split_once('=')?;
        k.eq_ignore_ascii_case(key).then_some(v)
    })
}

/// Whether the command line asks for the debug console before the
/// configuration file is read.
#[must_use]
pub fn early_debug_requested(command_line: &str) -> bool {
    value_of(command_line, "DEBUG").is_some()
}

/// One validated `TUNE=` triplet: tempo, pitch in Hz, duration in ms.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TuneNote {
    pub tempo: u32,
    pub pitch_hz: u32,
    pub duration_ms: u32,
}

/// Parses the `TUNE=` triplet list for the optional beep module.
///
/// The grammar is a flat space-separated number list whose length must be
/// a multiple of three; anything else yields an empty tune.
#[must_use]
pub fn parse_tune(value: &str) -> Vec<TuneNote> {
    let numbers: Option<Vec<u32>> = value
        .split_whitespace()
        .map(|token| token.parse().ok())
        .collect();
    let Some(numbers) = numbers else {
        warn!("TUNE= contains non-numeric data");
        return Vec::new();
    };
    if numbers.len() % 3 != 0 {
        warn!("TUNE= length is not a multiple of three");
        return Vec::new();
    }
    numbers
        .chunks_exact(3)
        .map(|triplet| TuneNote {
            tempo: triplet[0],
            pitch_hz: triplet[1],
            duration_ms: triplet[2],
        })
        .collect()
}
