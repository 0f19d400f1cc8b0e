//! # dualhid
//!
//! Mainloop-driven access to USB HID devices through two backends:
//! `libusb` (via the `rusb` crate) for event-driven asynchronous transfers, and
//! `hidapi` for platforms or devices where only the HID class driver is usable.
//!
//! The helper does not run a loop of its own. It plugs into the host's
//! [`Mainloop`]: one per-tick callback processes libusb events and hands the
//! completed reads to their callbacks, and hidapi read loops run as one-shot
//! tasks that reschedule themselves.
//!
//! ## Features
//!
//! *   Backend setup and teardown (`UsbHelper::init`, `UsbHelper::init_with_config`, `UsbHelper::close`).
//! *   Opening devices by discovery path (`UsbHelper::open`):
//!     *   `/hidapi<native path>` opens through hidapi; a `&mi_XX` component names the interface.
//!     *   `/win32/usb/<bus>/<address>` (hex) opens through libusb.
//!     *   Any other path is read as a sysfs device directory (`busnum`, `devnum`).
//! *   Claiming interfaces by class triple (`DeviceHandle::claim_interfaces_by`).
//! *   HID feature reports:
//!     *   Fire-and-forget writes (`DeviceHandle::hid_write`).
//!     *   Write-then-read requests (`DeviceHandle::hid_request`, `DeviceHandle::hid_request_in_place`).
//! *   Continuous interrupt reads delivered on the mainloop (`UsbHelper::start_read_loop`).
//!
//! ## Threading
//!
//! Everything here is single-threaded: handles, callbacks and the helper
//! itself are `!Send`. All calls must come from the thread running the mainloop.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use dualhid::{Mainloop, Result, UsbHelper};
//!
//! fn run(mainloop: &mut dyn Mainloop, path: &str) -> Result<()> {
//!     let helper = UsbHelper::init(mainloop)?;
//!     let device = helper.open(path)?;
//!
//!     // Generic HID: class 3, no subclass, no protocol.
//!     if device.claim_interfaces_by(3, 0, 0) == 0 {
//!         eprintln!("No HID interface claimed on {}", device);
//!     }
//!
//!     let status = device.hid_request(0, &[0x01, 0x00], 8)?;
//!     println!("Status report: {:02X?}", status);
//!
//!     helper.start_read_loop(&device, mainloop, 0x81, 64, |id, endpoint, data| match data {
//!         Some(data) => println!("{} ep{}: {:02X?}", id, endpoint, data),
//!         None => eprintln!("{} disconnected", id),
//!     })?;
//!
//!     // The host's mainloop now drives the reads. Keep `helper` and
//!     // `device` alive for as long as it runs.
//!     Ok(())
//! }
//! ```
//!
//! See `demos/poll_device.rs` for a complete program with a minimal mainloop.
//!
//! ## Linux Permissions
//!
//! libusb needs write access to `/dev/bus/usb/*` and hidapi to `/dev/hidraw*`.
//! A udev rule such as the following grants it to the `plugdev` group:
//!
//! ```udev
//! SUBSYSTEM=="usb", ATTRS{idVendor}=="YOUR_VID", MODE="0660", GROUP="plugdev"
//! SUBSYSTEM=="hidraw", ATTRS{idVendor}=="YOUR_VID", MODE="0660", GROUP="plugdev"
//! ```

use hidapi::HidApi;
use log::{debug, error, info, warn};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

mod config;
mod consts;
mod device;
mod error;
mod interrupt;
mod mainloop;
mod path;
mod transfer;
mod usb_transfer;

pub use config::{EventWait, HelperConfig};
pub use device::{DeviceHandle, HandleId, Subsystem};
pub use error::{Error, Result};
pub use interrupt::ReadCallback;
pub use mainloop::{Mainloop, Task, TickCallback};
pub use path::DevicePath;

use interrupt::{EventPump, EventSource, Scheduler};

/// Both backend library contexts. Dropped together when the helper closes.
struct Backends {
    usb: rusb::Context,
    hid: HidApi,
}

impl EventSource for Backends {
    fn handle_events(&self, timeout: Duration) -> Result<()> {
        EventSource::handle_events(&self.usb, timeout)
    }
}

// --- Helper Context ---
/// An initialized pair of libusb and hidapi contexts, attached to a mainloop.
/// **Note:** This context is not thread-safe (`!Send`, `!Sync`).
pub struct UsbHelper {
    backends: Rc<Backends>,
    scheduler: Rc<Scheduler>,
    config: HelperConfig,
    next_id: Cell<u64>,
}

impl UsbHelper {
    /// Initializes both backends with the default configuration and
    /// registers the per-tick event callback with `mainloop`.
    pub fn init(mainloop: &mut dyn Mainloop) -> Result<Self> {
        Self::init_with_config(mainloop, HelperConfig::default())
    }

    /// Like [`UsbHelper::init`], with explicit tunables.
    ///
    /// Fails with [`Error::Initialization`] if either backend cannot be
    /// started or the mainloop refuses the tick callback. The host should
    /// treat that as fatal.
    pub fn init_with_config(mainloop: &mut dyn Mainloop, config: HelperConfig) -> Result<Self> {
        let usb = rusb::Context::new().map_err(|e| {
            error!("Failed to initialize libusb: {}", e);
            Error::Initialization(format!("libusb: {}", e))
        })?;
        let hid = HidApi::new_without_enumerate().map_err(|e| {
            error!("Failed to initialize hidapi: {}", e);
            Error::Initialization(format!("hidapi: {}", e))
        })?;

        let backends = Rc::new(Backends { usb, hid });
        let scheduler = Rc::new(Scheduler::new(config.queue_capacity));
        let pump = EventPump::new(
            Rc::downgrade(&backends),
            Rc::clone(&scheduler),
            config.clone(),
        );
        if !mainloop.add_tick_callback(Box::new(move |mainloop: &mut dyn Mainloop| {
            pump.tick(mainloop);
        })) {
            error!("Mainloop refused the USB event callback");
            return Err(Error::Initialization(
                "mainloop refused the tick callback".to_string(),
            ));
        }

        info!("USB helper initialized (event wait: {:?})", config.event_wait);
        Ok(UsbHelper {
            backends,
            scheduler,
            config,
            next_id: Cell::new(1),
        })
    }

    /// Shuts down both backends. The tick callback stays registered but
    /// does nothing from now on.
    ///
    /// Deliveries still queued are dropped and no read callback runs after
    /// this. Devices still open keep their own connection until they are closed.
    pub fn close(self) {
        let dropped = self.scheduler.close();
        if dropped > 0 {
            warn!("Closing USB helper with {} undelivered read(s)", dropped);
        }
        debug!("USB helper closed");
    }

    /// Opens the device named by a discovery path.
    ///
    /// See [`DevicePath`] for the recognized shapes. Resolution and open
    /// failures are logged and returned.
    pub fn open(&self, path: &str) -> Result<DeviceHandle> {
        let parsed = DevicePath::parse(path).map_err(|e| {
            error!("Cannot open '{}': {}", path, e);
            e
        })?;
        let id = self.allocate_id();

        let (bus, address) = match &parsed {
            DevicePath::HidApi {
                path: native,
                interface,
            } => {
                return DeviceHandle::open_hid(
                    &self.backends.hid,
                    id,
                    native,
                    *interface,
                    self.config.control_timeout,
                );
            }
            DevicePath::UsbAddress { bus, address } => (*bus, *address),
            DevicePath::Sysfs(dir) => crate::path::read_sysfs_address(dir).map_err(|e| {
                error!("Cannot open '{}': {}", path, e);
                e
            })?,
        };
        DeviceHandle::open_usb(
            &self.backends.usb,
            id,
            bus,
            address,
            self.config.control_timeout,
        )
    }

    /// Number of completed libusb reads waiting for the next tick.
    pub fn pending_deliveries(&self) -> usize {
        self.scheduler.pending()
    }

    /// The configuration this helper was initialized with.
    pub fn config(&self) -> &HelperConfig {
        &self.config
    }

    fn allocate_id(&self) -> HandleId {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));
        HandleId(id)
    }
}

impl std::fmt::Debug for UsbHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbHelper")
            .field("config", &self.config)
            .field("pending_deliveries", &self.scheduler.pending())
            .finish()
    }
}
