//! # Volumes and Boot Files
//!
//! Block-device enumeration and file access on the boot volume. File
//! loading goes through the simple-file-system protocol of the volume the
//! loader itself was started from.

use alloc::vec;
use alloc::vec::Vec;
use log::{info, warn};
use uefi::proto::media::block::BlockIO;
use uefi::proto::media::file::{File, FileAttribute, FileMode, RegularFile};
use uefi::{CStr16, Status, boot};

/// Enumerates the block devices the firmware knows about.
///
/// The device handles end up in the log; the boot menu's volume listing
/// builds on the same enumeration.
pub fn enumerate_block_devices() {
    match boot::find_handles::<BlockIO>() {
        Ok(handles) => {
            info!("{} block device(s) present", handles.len());
            for (index, handle) in handles.iter().enumerate() {
                match boot::open_protocol_exclusive::<BlockIO>(*handle) {
                    Ok(block_io) => {
                        let media = block_io.media();
                        info!(
                            "  disk {index}: {} blocks of {} bytes{}",
                            media.last_block() + 1,
                            media.block_size(),
                            if media.is_removable_media() {
                                ", removable"
                            } else {
                                ""
                            }
                        );
                    }
                    Err(error) => warn!("  disk {index}: unreadable ({})", error.status()),
                }
            }
        }
        Err(error) => warn!("Block-device enumeration failed: {}", error.status()),
    }
}

/// Loads a whole file from the boot volume.
///
/// # Errors
/// The firmware status of whichever step failed.
pub fn load_boot_file(path: &CStr16) -> Result<Vec<u8>, Status> {
    let image = boot::image_handle();
    let mut file_system =
        boot::get_image_file_system(image).map_err(|error| error.status())?;
    let mut root = file_system
        .open_volume()
        .map_err(|error| error.status())?;

    let handle = root
        .open(path, FileMode::Read, FileAttribute::empty())
        .map_err(|error| error.status())?;
    let mut file = handle.into_regular_file().ok_or(Status::UNSUPPORTED)?;

    // Size via seek-to-end, then rewind and read in one go.
    file.set_position(RegularFile::END_OF_FILE)
        .map_err(|error| error.status())?;
    let size = file.get_position().map_err(|error| error.status())?;
    file.set_position(0).map_err(|error| error.status())?;

    let size = usize::try_from(size).map_err(|_| Status::UNSUPPORTED)?;
    let mut buffer = vec![0u8; size];
    let read = file
        .read(&mut buffer)
        .map_err(|error| error.status())?;
    if read != size {
        warn!("Short read: {read} of {size} bytes");
        return Err(Status::DEVICE_ERROR);
    }

    Ok(buffer)
}
