//! Internal constants: HID class requests, timeouts, limits and path conventions.

use std::time::Duration;

// --- HID Class Requests (Control Transfer) ---
/// bmRequestType for host-to-device, class, interface recipient.
pub const REQUEST_TYPE_CLASS_OUT: u8 = 0x21;
/// bmRequestType for device-to-host, class, interface recipient.
pub const REQUEST_TYPE_CLASS_IN: u8 = 0xA1;
/// HID GET_REPORT request code.
pub const HID_GET_REPORT: u8 = 0x01;
/// HID SET_REPORT request code.
pub const HID_SET_REPORT: u8 = 0x09;
/// wValue for a feature report (type 3 in the high byte) with report id 0.
pub const HID_FEATURE_REPORT_VALUE: u16 = 0x0300;

// --- Endpoint Addressing ---
pub const ENDPOINT_DIR_MASK: u8 = 0x80;
pub const ENDPOINT_IN: u8 = 0x80;

// --- libusb transfer fields ---
pub const TRANSFER_TYPE_INTERRUPT: u8 = 3;

/// Default timeout for synchronous control transfers.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

// --- hidapi Backend ---
/// Largest feature request (excluding the report id byte) accepted on hidapi handles.
pub const HIDAPI_MAX_REQUEST: usize = 256;
/// Report id prepended to hidapi feature requests.
pub const HIDAPI_REPORT_ID: u8 = 0;
/// Ticks between two blocking-read polls of a hidapi read loop.
pub const DEFAULT_HID_POLL_INTERVAL: u32 = 1;

// --- Scheduler ---
/// Initial capacity of the delivery queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

// --- Device Path Conventions ---
/// Prefix of synthetic paths naming a hidapi device path.
pub const HIDAPI_PATH_PREFIX: &str = "/hidapi";
/// Prefix of synthetic paths naming a USB bus/address pair in hex.
pub const USB_ADDRESS_PATH_PREFIX: &str = "/win32/usb/";
/// Marker introducing the interface number inside a hidapi device path.
pub const INTERFACE_MARKER: &str = "&mi_";
/// sysfs attribute holding the bus number of a USB device.
pub const SYSFS_BUSNUM: &str = "busnum";
/// sysfs attribute holding the device address of a USB device.
pub const SYSFS_DEVNUM: &str = "devnum";
