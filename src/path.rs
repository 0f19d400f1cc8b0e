//! Classification of device paths handed over by device discovery.
//!
//! Three shapes are recognized:
//!
//! *   `/hidapi<native path>` names a device to be opened through hidapi.
//!     On Windows the native path had its backslashes turned into slashes,
//!     which are reversed here. A `&mi_XX` component carries the interface
//!     number in hex.
//! *   `/win32/usb/<bus>/<address>` names a libusb device by bus number and
//!     device address, both in hex.
//! *   Anything else is taken as a sysfs device directory whose `busnum` and
//!     `devnum` attributes give the bus/address pair.

use crate::consts;
use crate::error::{Error, Result};
use log::trace;
use std::ffi::{CStr, CString};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// A device path after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePath {
    /// Device to open with hidapi.
    HidApi {
        /// Native hidapi path.
        path: CString,
        /// Interface number parsed from the path, if present and well formed.
        interface: Option<u8>,
    },
    /// libusb device with a known bus/address pair.
    UsbAddress {
        /// USB bus number.
        bus: u8,
        /// Device address on that bus.
        address: u8,
    },
    /// libusb device described by a sysfs directory.
    Sysfs(PathBuf),
}

impl DevicePath {
    /// Classifies a path string. Only the synthetic shapes can fail here;
    /// sysfs paths are resolved later by [`DevicePath::usb_address`].
    pub fn parse(path: &str) -> Result<Self> {
        if let Some(native) = path.strip_prefix(consts::HIDAPI_PATH_PREFIX) {
            let native = if cfg!(windows) {
                native.replace('/', "\\")
            } else {
                native.to_string()
            };
            let interface = parse_interface_marker(&native);
            let path = CString::new(native).map_err(|_| {
                Error::ArgumentOutOfRange(format!("device path '{}' contains a NUL byte", path))
            })?;
            return Ok(DevicePath::HidApi { path, interface });
        }

        if let Some(address) = path.strip_prefix(consts::USB_ADDRESS_PATH_PREFIX) {
            let (bus, address) = parse_hex_address(address).ok_or_else(|| {
                Error::AddressResolution {
                    path: path.to_string(),
                    message: "expected <bus>/<address> in hex".to_string(),
                }
            })?;
            return Ok(DevicePath::UsbAddress { bus, address });
        }

        Ok(DevicePath::Sysfs(PathBuf::from(path)))
    }

    /// Resolves the USB bus/address pair of a libusb path.
    /// Returns `None` for hidapi paths.
    pub fn usb_address(&self) -> Option<Result<(u8, u8)>> {
        match self {
            DevicePath::HidApi { .. } => None,
            DevicePath::UsbAddress { bus, address } => Some(Ok((*bus, *address))),
            DevicePath::Sysfs(dir) => Some(read_sysfs_address(dir)),
        }
    }

    /// Builds the synthetic path naming a libusb device by bus and address.
    pub fn usb_address_path(bus: u8, address: u8) -> String {
        format!("{}{:x}/{:x}", consts::USB_ADDRESS_PATH_PREFIX, bus, address)
    }

    /// Builds the synthetic path naming a hidapi device.
    pub fn hidapi_path(native: &CStr) -> String {
        let native = native.to_string_lossy();
        let native = if cfg!(windows) {
            native.replace('\\', "/")
        } else {
            native.into_owned()
        };
        format!("{}{}", consts::HIDAPI_PATH_PREFIX, native)
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePath::HidApi { path, .. } => write!(f, "{}", path.to_string_lossy()),
            DevicePath::UsbAddress { bus, address } => {
                write!(f, "device {} on bus {}", address, bus)
            }
            DevicePath::Sysfs(dir) => write!(f, "{}", dir.display()),
        }
    }
}

/// Parses the hex digits after `&mi_`. Anything malformed means "no interface".
fn parse_interface_marker(native: &str) -> Option<u8> {
    let start = native.find(consts::INTERFACE_MARKER)? + consts::INTERFACE_MARKER.len();
    let digits: String = native[start..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    u8::from_str_radix(&digits, 16).ok()
}

fn parse_hex_address(s: &str) -> Option<(u8, u8)> {
    let (bus, address) = s.split_once('/')?;
    let address = address.trim_end_matches('/');
    Some((
        u8::from_str_radix(bus, 16).ok()?,
        u8::from_str_radix(address, 16).ok()?,
    ))
}

pub(crate) fn read_sysfs_address(dir: &Path) -> Result<(u8, u8)> {
    let bus = read_sysfs_number(dir, consts::SYSFS_BUSNUM)?;
    let address = read_sysfs_number(dir, consts::SYSFS_DEVNUM)?;
    trace!("{} resolved to bus {} address {}", dir.display(), bus, address);
    Ok((bus, address))
}

fn read_sysfs_number(dir: &Path, attribute: &str) -> Result<u8> {
    let file = dir.join(attribute);
    let text = fs::read_to_string(&file).map_err(|e| Error::AddressResolution {
        path: dir.display().to_string(),
        message: format!("failed to read {}: {}", file.display(), e),
    })?;
    text.trim().parse::<u8>().map_err(|e| Error::AddressResolution {
        path: dir.display().to_string(),
        message: format!("bad {} value '{}': {}", attribute, text.trim(), e),
    })
}
