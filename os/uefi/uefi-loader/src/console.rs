//! # Loader Text Console
//!
//! Thin wrappers over the firmware's simple-text protocols: reset input
//! and output, force the base text mode, clear, and cursor control. The
//! loader's UI (menu and shell) draws through these.

use uefi::proto::console::text::Key;

/// Resets both text protocols, forces text mode 0, clears the screen and
/// enables the cursor.
pub fn initialize() {
    let _ = uefi::system::with_stdout(|stdout| {
        let _ = stdout.reset(false);
        if let Some(mode) = stdout.modes().next() {
            let _ = stdout.set_mode(mode);
        }
        let _ = stdout.clear();
        let _ = stdout.enable_cursor(true);
    });
    let _ = uefi::system::with_stdin(|stdin| {
        let _ = stdin.reset(false);
    });
}

/// Clears the screen.
pub fn clear() {
    let _ = uefi::system::with_stdout(|stdout| {
        let _ = stdout.clear();
    });
}

/// Blocks until a key arrives and returns it.
pub fn wait_for_key() -> Option<Key> {
    loop {
        let key = uefi::system::with_stdin(|stdin| {
            let mut events = [stdin.wait_for_key_event()?];
            uefi::boot::wait_for_event(&mut events).ok()?;
            stdin.read_key().ok().flatten()
        });
        if key.is_some() {
            return key;
        }
    }
}

/// Polls for a key without blocking.
pub fn read_key() -> Option<Key> {
    uefi::system::with_stdin(|stdin| stdin.read_key().ok().flatten())
}
