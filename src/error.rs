use crate::device::Subsystem;
use thiserror::Error;

/// Errors that can occur when opening or talking to a device.
///
/// Synchronous operations return these directly. Failures of a running
/// read loop never show up here; they reach the read callback as a call
/// without a buffer.
#[derive(Error, Debug)]
pub enum Error {
    /// Error from the underlying HID API layer.
    #[error("HID API error: {0}")]
    Hid(#[from] hidapi::HidError),
    /// Error from libusb.
    #[error("libusb error: {0}")]
    Usb(#[from] rusb::Error),
    /// General I/O error (e.g. while reading sysfs attributes).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A backend library or the mainloop registration could not be set up.
    /// The host cannot continue without a working helper.
    #[error("Initialization failed: {0}")]
    Initialization(String),
    /// Memory for a buffer or transfer could not be allocated.
    #[error("Out of memory: {0}")]
    Allocation(String),
    /// The bus/address pair resolved from a path is not currently attached.
    #[error("Device {address} on bus {bus} not found")]
    DeviceNotFound {
        /// USB bus number.
        bus: u8,
        /// Device address on that bus.
        address: u8,
    },
    /// The USB bus/address pair could not be determined from a path.
    #[error("Failed to determine device address for '{path}': {message}")]
    AddressResolution {
        /// The path that was being resolved.
        path: String,
        /// Additional error details.
        message: String,
    },
    /// Operation not available for the subsystem the handle was opened with.
    #[error("{operation} is not supported on {subsystem} devices")]
    UnsupportedOperation {
        /// Name of the attempted operation.
        operation: &'static str,
        /// Subsystem of the handle.
        subsystem: Subsystem,
    },
    /// The API was used against its contract (e.g. closing a handle twice).
    #[error("Misuse: {0}")]
    Misuse(String),
    /// A hidapi request addressed an interface other than the one the
    /// device was opened for.
    #[error("Request for interface {requested} on a device opened for interface {opened:?}")]
    InterfaceMismatch {
        /// Interface index recorded when the device was opened.
        opened: Option<u8>,
        /// Interface index the request was addressed to.
        requested: u16,
    },
    /// Provided buffer is smaller than required for the operation.
    #[error("Provided buffer is too small (expected at least {expected}, got {actual})")]
    BufferTooSmall {
        /// Minimum required buffer size.
        expected: usize,
        /// Actual buffer size provided.
        actual: usize,
    },
    /// Requested operation exceeds backend limits.
    #[error("Requested operation size is too large (max {max}, got {actual})")]
    OperationTooLarge {
        /// Maximum allowed size for this operation.
        max: usize,
        /// Actual size requested.
        actual: usize,
    },
    /// Function argument is outside the valid range.
    #[error("Argument out of range: {0}")]
    ArgumentOutOfRange(String),
    /// The mainloop refused to schedule a delayed task.
    #[error("Mainloop refused to schedule {0}")]
    Schedule(&'static str),
}

/// Result type alias for dualhid operations.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn unsupported(operation: &'static str, subsystem: Subsystem) -> Error {
    Error::UnsupportedOperation {
        operation,
        subsystem,
    }
}

pub(crate) fn closed_handle(operation: &str) -> Error {
    Error::Misuse(format!("{} called on a closed device handle", operation))
}
