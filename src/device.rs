//! Device handles: one native connection through libusb or hidapi.

use crate::error::{closed_handle, Error, Result};
use hidapi::{HidApi, HidDevice};
use log::{debug, error, warn};
use std::cell::RefCell;
use std::ffi::CStr;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// Backend library a device handle was opened through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// libusb: event-driven asynchronous transfers.
    Usb,
    /// hidapi: blocking reads polled from the mainloop.
    HidApi,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::Usb => f.write_str("libusb"),
            Subsystem::HidApi => f.write_str("hidapi"),
        }
    }
}

/// Identity of an opened device, passed to read callbacks as routing context.
/// Unique within one [`UsbHelper`](crate::UsbHelper).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl HandleId {
    /// Returns the raw numeric id.
    #[inline]
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device #{}", self.0)
    }
}

/// libusb connection, shared with the read loops still submitted against it.
pub(crate) type UsbConnection = Rc<RefCell<rusb::DeviceHandle<rusb::Context>>>;

pub(crate) enum Connection {
    Usb(UsbConnection),
    /// hidapi read loops only hold weak references, so dropping this closes the device.
    Hid(Rc<HidDevice>),
    Closed,
}

/// A handle to an opened device.
/// Created by [`UsbHelper::open`](crate::UsbHelper::open), released by [`DeviceHandle::close`]
/// or when dropped.
/// **Note:** This handle is not thread-safe (`!Send`, `!Sync`).
pub struct DeviceHandle {
    id: HandleId,
    subsystem: Subsystem,
    pub(crate) connection: Connection,
    interface: Option<u8>,
    pub(crate) control_timeout: Duration,
}

impl DeviceHandle {
    /// Opens the attached libusb device at `bus`/`address`.
    pub(crate) fn open_usb(
        context: &rusb::Context,
        id: HandleId,
        bus: u8,
        address: u8,
        control_timeout: Duration,
    ) -> Result<Self> {
        use rusb::UsbContext;

        let devices = context.devices().map_err(|e| {
            error!("Failed to list USB devices: {}", e);
            Error::Usb(e)
        })?;
        let device = find_attached(devices.iter(), bus, address, |device| {
            (device.bus_number(), device.address())
        })?;
        let mut usb = device.open().map_err(|e| {
            error!("Failed to open device {} on bus {}: {}", address, bus, e);
            Error::Usb(e)
        })?;
        if let Err(e) = usb.set_auto_detach_kernel_driver(true) {
            // Not available outside Linux; claiming works without it there.
            // This is the only place kernel drivers get detached.
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }

        debug!("Opened {} (device {} on bus {}) via libusb", id, address, bus);
        Ok(DeviceHandle {
            id,
            subsystem: Subsystem::Usb,
            connection: Connection::Usb(Rc::new(RefCell::new(usb))),
            interface: None,
            control_timeout,
        })
    }

    /// Opens a hidapi device by its native path.
    pub(crate) fn open_hid(
        api: &HidApi,
        id: HandleId,
        path: &CStr,
        interface: Option<u8>,
        control_timeout: Duration,
    ) -> Result<Self> {
        let device = api.open_path(path).map_err(|e| {
            error!("Failed to open device {:?}: {}", path, e);
            Error::Hid(e)
        })?;

        debug!(
            "Opened {} ({:?}, interface {:?}) via hidapi",
            id, path, interface
        );
        Ok(DeviceHandle {
            id,
            subsystem: Subsystem::HidApi,
            connection: Connection::Hid(Rc::new(device)),
            interface,
            control_timeout,
        })
    }

    /// Returns the id passed to read callbacks for this device.
    #[inline]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Returns the backend this handle was opened through.
    #[inline]
    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    /// Interface number the device was opened for (hidapi only).
    #[inline]
    pub fn interface(&self) -> Option<u8> {
        self.interface
    }

    /// Returns `true` until the handle is closed.
    pub fn is_open(&self) -> bool {
        !matches!(self.connection, Connection::Closed)
    }

    /// Releases the native connection.
    ///
    /// No read loop should still be running on this device. A libusb loop
    /// that is still submitted keeps the connection open until it ends; a
    /// hidapi loop ends at its next poll.
    ///
    /// Closing a handle twice returns [`Error::Misuse`].
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.connection, Connection::Closed) {
            Connection::Usb(usb) => {
                if Rc::strong_count(&usb) > 1 {
                    warn!(
                        "Closing {} with {} read loop(s) still submitted; connection released when they end",
                        self.id,
                        Rc::strong_count(&usb) - 1
                    );
                }
                drop(usb);
            }
            Connection::Hid(hid) => drop(hid),
            Connection::Closed => {
                warn!("close called on {} which is already closed", self.id);
                return Err(closed_handle("close"));
            }
        }
        debug!("Closed {} ({})", self.id, self.subsystem);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn closed_for_test(id: u64, subsystem: Subsystem, interface: Option<u8>) -> Self {
        DeviceHandle {
            id: HandleId(id),
            subsystem,
            connection: Connection::Closed,
            interface,
            control_timeout: crate::consts::DEFAULT_CONTROL_TIMEOUT,
        }
    }
}

/// Picks the attached device at `bus`/`address`.
pub(crate) fn find_attached<T, I, F>(devices: I, bus: u8, address: u8, location: F) -> Result<T>
where
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> (u8, u8),
{
    devices
        .into_iter()
        .find(|device| location(device) == (bus, address))
        .ok_or_else(|| {
            error!("Device {} on bus {} not found", address, bus);
            Error::DeviceNotFound { bus, address }
        })
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("subsystem", &self.subsystem)
            .field("open", &self.is_open())
            .field("interface", &self.interface)
            .finish()
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.subsystem)
    }
}
