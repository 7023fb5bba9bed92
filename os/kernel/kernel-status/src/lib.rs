//! # Kernel Status Codes
//!
//! The platform carries two independent status namespaces: the firmware's
//! (`EFI_STATUS`, high bit set on errors) and the kernel's own. They are never
//! interchangeable as integers; code that crosses the loader/kernel boundary
//! converts explicitly through [`Status::from_firmware`] /
//! [`Status::into_firmware`].
//!
//! Kernel-band codes are deliberately few: they cover the conditions the
//! platform core actually reports. Everything fatal goes through `panic`
//! instead of a status code.

#![cfg_attr(not(any(test, doctest)), no_std)]

use thiserror::Error;

/// A kernel-band status code.
///
/// Fallible platform-core operations return `Result<T, Status>`; `Ok` is the
/// moral equivalent of the original `STATUS_SUCCESS`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Error)]
#[non_exhaustive]
pub enum Status {
    /// The requested object (parameter, device, resource) does not exist.
    #[error("not found")]
    NotFound,

    /// A fixed-size table or bootstrap pool is exhausted.
    #[error("insufficient resources")]
    InsufficientResources,

    /// The device has not been initialized yet.
    #[error("device not ready")]
    DeviceNotReady,

    /// The device reported a hard error (framing/parity/overrun on a UART).
    #[error("I/O device error")]
    IoDeviceError,

    /// A caller-supplied argument is malformed or out of range.
    #[error("invalid parameter")]
    InvalidParameter,

    /// The supplied buffer is too small; retry with the reported size.
    #[error("buffer too small")]
    BufferTooSmall,

    /// A matching system resource exists but is currently acquired.
    #[error("resource locked")]
    ResourceLocked,

    /// Releasing the semaphore would push its count above the limit.
    #[error("semaphore limit exceeded")]
    SemaphoreLimitExceeded,

    /// The operation is recognized but not provided by this build.
    #[error("not implemented")]
    NotImplemented,

    /// The firmware returned an error that has no kernel-band equivalent.
    #[error("firmware error")]
    FirmwareError,
}

/// Shorthand for platform-core results.
pub type Result<T> = core::result::Result<T, Status>;

#[cfg(feature = "firmware")]
impl Status {
    /// Translates a firmware status into the kernel band.
    ///
    /// Only the codes the loader actually branches on get a dedicated kernel
    /// code; everything else collapses into [`Status::FirmwareError`] so that
    /// no firmware integer ever leaks into kernel-band comparisons.
    #[must_use]
    pub fn from_firmware(status: uefi::Status) -> Self {
        match status {
            uefi::Status::NOT_FOUND => Self::NotFound,
            uefi::Status::OUT_OF_RESOURCES => Self::InsufficientResources,
            uefi::Status::BUFFER_TOO_SMALL => Self::BufferTooSmall,
            uefi::Status::INVALID_PARAMETER => Self::InvalidParameter,
            uefi::Status::UNSUPPORTED => Self::NotImplemented,
            uefi::Status::DEVICE_ERROR => Self::IoDeviceError,
            uefi::Status::NOT_READY => Self::DeviceNotReady,
            _ => Self::FirmwareError,
        }
    }

    /// Translates a kernel-band status into the closest firmware status.
    ///
    /// Used when the loader must report a kernel-band failure back to the
    /// firmware (for example from the EFI entry point).
    #[must_use]
    pub const fn into_firmware(self) -> uefi::Status {
        match self {
            Self::NotFound => uefi::Status::NOT_FOUND,
            Self::InsufficientResources => uefi::Status::OUT_OF_RESOURCES,
            Self::BufferTooSmall => uefi::Status::BUFFER_TOO_SMALL,
            Self::InvalidParameter => uefi::Status::INVALID_PARAMETER,
            Self::NotImplemented => uefi::Status::UNSUPPORTED,
            Self::IoDeviceError | Self::FirmwareError => uefi::Status::DEVICE_ERROR,
            Self::DeviceNotReady => uefi::Status::NOT_READY,
            Self::ResourceLocked => uefi::Status::ACCESS_DENIED,
            Self::SemaphoreLimitExceeded => uefi::Status::INVALID_PARAMETER,
        }
    }
}

#[cfg(all(test, feature = "firmware"))]
mod tests {
    use super::*;

    #[test]
    fn firmware_round_trips_for_shared_codes() {
        for status in [
            Status::NotFound,
            Status::InsufficientResources,
            Status::BufferTooSmall,
            Status::InvalidParameter,
            Status::NotImplemented,
            Status::DeviceNotReady,
        ] {
            assert_eq!(Status::from_firmware(status.into_firmware()), status);
        }
    }

    #[test]
    fn unknown_firmware_codes_collapse() {
        assert_eq!(
            Status::from_firmware(uefi::Status::COMPROMISED_DATA),
            Status::FirmwareError
        );
    }
}
