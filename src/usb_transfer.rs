//! Asynchronous libusb interrupt transfers.
//!
//! `rusb` only wraps synchronous I/O, so the read loops drive libusb's
//! transfer API through `rusb::ffi`. Each loop owns one transfer that is
//! resubmitted from its own completion callback until a submission fails.

use crate::consts;
use crate::device::UsbConnection;
use crate::error::{Error, Result};
use crate::interrupt::{InterruptTransfer, LoopStatus, Route, Scheduler};
use rusb::ffi;
use std::os::raw::{c_int, c_void};
use std::ptr::NonNull;
use std::rc::Rc;

/// An allocated libusb transfer reading into `buffer`.
struct NativeTransfer {
    raw: NonNull<ffi::libusb_transfer>,
    buffer: Vec<u8>,
    // Keeps the device handle open while the transfer may be in flight.
    _connection: UsbConnection,
}

impl NativeTransfer {
    fn new(connection: UsbConnection, endpoint: u8, mut buffer: Vec<u8>) -> Result<Self> {
        let length = c_int::try_from(buffer.len()).map_err(|_| Error::OperationTooLarge {
            max: c_int::MAX as usize,
            actual: buffer.len(),
        })?;
        // SAFETY: plain allocation, checked for NULL below.
        let raw = NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) })
            .ok_or_else(|| Error::Allocation("libusb transfer".to_string()))?;

        // SAFETY: `raw` is a freshly allocated, zeroed transfer that nothing
        // else references yet. The buffer pointer stays valid because the
        // Vec is never resized while owned here.
        unsafe {
            let t = raw.as_ptr();
            (*t).dev_handle = connection.borrow().as_raw();
            (*t).endpoint = (endpoint & !consts::ENDPOINT_DIR_MASK) | consts::ENDPOINT_IN;
            (*t).transfer_type = consts::TRANSFER_TYPE_INTERRUPT;
            (*t).timeout = 0;
            (*t).buffer = buffer.as_mut_ptr();
            (*t).length = length;
            (*t).callback = on_interrupt_complete;
            (*t).user_data = std::ptr::null_mut();
        }

        Ok(NativeTransfer {
            raw,
            buffer,
            _connection: connection,
        })
    }

    fn set_user_data(&mut self, user_data: *mut c_void) {
        // SAFETY: the transfer is not in flight while its owner mutates it.
        unsafe { (*self.raw.as_ptr()).user_data = user_data };
    }

    fn submit(&mut self) -> Result<()> {
        // SAFETY: the transfer is fully filled in and not currently submitted.
        let rc = unsafe { ffi::libusb_submit_transfer(self.raw.as_ptr()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::Usb(usb_error(rc)))
        }
    }
}

impl InterruptTransfer for NativeTransfer {
    fn received(&self) -> &[u8] {
        // SAFETY: only called from the completion callback, when libusb has
        // handed the transfer back.
        let actual = unsafe { (*self.raw.as_ptr()).actual_length };
        let actual = usize::try_from(actual).unwrap_or(0).min(self.buffer.len());
        &self.buffer[..actual]
    }

    fn resubmit(&mut self) -> Result<()> {
        self.submit()
    }
}

impl Drop for NativeTransfer {
    fn drop(&mut self) {
        // SAFETY: a transfer is only dropped when it is not in flight.
        unsafe { ffi::libusb_free_transfer(self.raw.as_ptr()) };
    }
}

/// A transfer that can carry its loop state through libusb's `user_data`.
trait LoopTransfer: InterruptTransfer {
    /// Stores `user_data` and submits for the first time.
    fn submit_first(&mut self, user_data: *mut c_void) -> Result<()>;
}

impl LoopTransfer for NativeTransfer {
    fn submit_first(&mut self, user_data: *mut c_void) -> Result<()> {
        self.set_user_data(user_data);
        self.submit()
    }
}

/// One running read loop; leaked into the transfer's `user_data` while armed.
struct InterruptLoop<T> {
    transfer: T,
    route: Route,
    scheduler: Rc<Scheduler>,
}

/// Submits the first transfer of a read loop on `connection`.
/// Nothing is left behind if the submission fails.
pub(crate) fn start(
    connection: &UsbConnection,
    scheduler: Rc<Scheduler>,
    route: Route,
    buffer: Vec<u8>,
) -> Result<()> {
    let transfer = NativeTransfer::new(Rc::clone(connection), route.endpoint, buffer)?;
    launch(transfer, route, scheduler)
}

fn launch<T: LoopTransfer>(transfer: T, route: Route, scheduler: Rc<Scheduler>) -> Result<()> {
    let state = Box::into_raw(Box::new(InterruptLoop {
        transfer,
        route,
        scheduler,
    }));

    // SAFETY: `state` comes from Box::into_raw above and is reclaimed exactly
    // once: here if the submission fails, or in `complete_loop` when the
    // loop ends.
    unsafe {
        if let Err(e) = (*state).transfer.submit_first(state.cast()) {
            drop(Box::from_raw(state));
            return Err(e);
        }
    }
    Ok(())
}

/// Runs one completion of the loop at `state`, freeing it when the loop ends.
///
/// # Safety
///
/// `state` must be the pointer handed to `submit_first` by `launch`, for a
/// loop that has not ended yet.
unsafe fn complete_loop<T: InterruptTransfer>(state: *mut InterruptLoop<T>) -> LoopStatus {
    let status = {
        // SAFETY: per the contract above; no other reference to the loop
        // exists while its completion runs.
        let lp = unsafe { &mut *state };
        let scheduler = Rc::clone(&lp.scheduler);
        scheduler.complete(&lp.route, &mut lp.transfer)
    };
    if status == LoopStatus::Ended {
        // SAFETY: the transfer was not resubmitted, so nothing refers to it anymore.
        drop(unsafe { Box::from_raw(state) });
    }
    status
}

extern "system" fn on_interrupt_complete(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb passes back the transfer submitted by `launch`, whose
    // user_data points to its live InterruptLoop.
    unsafe {
        let state = (*transfer).user_data.cast::<InterruptLoop<NativeTransfer>>();
        complete_loop(state);
    }
}

fn usb_error(code: c_int) -> rusb::Error {
    match code {
        ffi::constants::LIBUSB_ERROR_IO => rusb::Error::Io,
        ffi::constants::LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        ffi::constants::LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        ffi::constants::LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        ffi::constants::LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        ffi::constants::LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        ffi::constants::LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        ffi::constants::LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        ffi::constants::LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        ffi::constants::LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        ffi::constants::LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        ffi::constants::LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}
