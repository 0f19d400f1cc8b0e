//! Continuous interrupt reads.
//!
//! libusb completes transfers from inside its event processing, where calling
//! back into libusb is not allowed. Completed reads are therefore copied into a
//! FIFO of deliveries and handed to the read callbacks only after event
//! processing has returned, once per mainloop tick.
//!
//! hidapi has no completion model. Its read loops are simulated with one-shot
//! mainloop tasks that drain the device with non-blocking reads and reschedule
//! themselves, delivering straight to the callback.

use crate::config::HelperConfig;
use crate::consts;
use crate::device::{Connection, DeviceHandle, HandleId};
use crate::error::{closed_handle, Error, Result};
use crate::mainloop::Mainloop;
use crate::transfer::ReportPipe;
use crate::usb_transfer;
use crate::UsbHelper;
use log::{debug, error, trace, warn};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::mem;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Read callback: `(device, endpoint number, received bytes)`.
/// `None` means the read loop has failed and ended.
pub type ReadCallback = dyn FnMut(HandleId, u8, Option<&[u8]>);

/// Where a completed read goes.
#[derive(Clone)]
pub(crate) struct Route {
    pub handle: HandleId,
    /// Endpoint number, direction bit cleared.
    pub endpoint: u8,
    callback: Rc<RefCell<ReadCallback>>,
}

impl Route {
    pub(crate) fn new<F>(handle: HandleId, endpoint: u8, callback: F) -> Self
    where
        F: FnMut(HandleId, u8, Option<&[u8]>) + 'static,
    {
        Route {
            handle,
            endpoint: endpoint & !consts::ENDPOINT_DIR_MASK,
            callback: Rc::new(RefCell::new(callback)),
        }
    }

    pub(crate) fn deliver(&self, data: Option<&[u8]>) {
        match self.callback.try_borrow_mut() {
            Ok(mut callback) => (&mut *callback)(self.handle, self.endpoint, data),
            Err(_) => error!(
                "Read callback of {} endpoint {} re-entered itself; delivery dropped",
                self.handle, self.endpoint
            ),
        }
    }
}

/// A completed read waiting for the next drain.
struct Delivery {
    route: Route,
    payload: Option<Vec<u8>>,
}

/// A submitted interrupt transfer, as seen from its completion handler.
pub(crate) trait InterruptTransfer {
    /// Bytes received by the completed transfer.
    fn received(&self) -> &[u8];
    /// Submits the transfer again for the next read.
    fn resubmit(&mut self) -> Result<()>;
}

/// What a completion did to its read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopStatus {
    /// The transfer was resubmitted; the loop keeps running.
    Armed,
    /// The loop ended; the transfer must be released.
    Ended,
}

/// Delivery queue shared by every libusb read loop of one helper.
pub(crate) struct Scheduler {
    queue: RefCell<VecDeque<Delivery>>,
    processing: Cell<bool>,
    closed: Cell<bool>,
    #[cfg(test)]
    fail_next_alloc: Cell<bool>,
}

/// Marks libusb event processing as running until dropped.
pub(crate) struct EventsGuard<'a> {
    processing: &'a Cell<bool>,
}

impl Drop for EventsGuard<'_> {
    fn drop(&mut self) {
        self.processing.set(false);
    }
}

impl Scheduler {
    pub(crate) fn new(capacity: usize) -> Self {
        Scheduler {
            queue: RefCell::new(VecDeque::with_capacity(capacity)),
            processing: Cell::new(false),
            closed: Cell::new(false),
            #[cfg(test)]
            fail_next_alloc: Cell::new(false),
        }
    }

    /// Number of deliveries waiting for the next drain.
    pub(crate) fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Drops every queued delivery and stops all later ones.
    /// Returns the number of deliveries dropped.
    pub(crate) fn close(&self) -> usize {
        self.closed.set(true);
        let mut queue = self.queue.borrow_mut();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Enters event processing. Returns `None` if it is already running.
    pub(crate) fn begin_events(&self) -> Option<EventsGuard<'_>> {
        if self.processing.replace(true) {
            return None;
        }
        Some(EventsGuard {
            processing: &self.processing,
        })
    }

    /// Handles one completed transfer of the loop described by `route`.
    ///
    /// Runs inside libusb event processing, so nothing here calls a read
    /// callback, except on allocation failure: the loop is then torn down,
    /// the undelivered reads of the same device are discarded and the
    /// callback is told right away.
    pub(crate) fn complete(&self, route: &Route, transfer: &mut dyn InterruptTransfer) -> LoopStatus {
        if self.closed.get() {
            debug!(
                "Read from {} endpoint {} completed after close; loop ended",
                route.handle, route.endpoint
            );
            return LoopStatus::Ended;
        }
        let mut queue = self.queue.borrow_mut();
        // Room for the data and for a failure record, so that the second
        // push below cannot fail.
        if queue.try_reserve(2).is_err() {
            drop(queue);
            return self.abandon(route);
        }
        let Some(payload) = self.copy_payload(transfer.received()) else {
            drop(queue);
            return self.abandon(route);
        };

        trace!(
            "Queued {} bytes from {} endpoint {}",
            payload.len(),
            route.handle,
            route.endpoint
        );
        queue.push_back(Delivery {
            route: route.clone(),
            payload: Some(payload),
        });

        match transfer.resubmit() {
            Ok(()) => LoopStatus::Armed,
            Err(e) => {
                error!(
                    "Failed to resubmit read on {} endpoint {}: {}",
                    route.handle, route.endpoint, e
                );
                queue.push_back(Delivery {
                    route: route.clone(),
                    payload: None,
                });
                LoopStatus::Ended
            }
        }
    }

    fn abandon(&self, route: &Route) -> LoopStatus {
        error!(
            "Out of memory while queuing read from {} endpoint {}; read loop closed",
            route.handle, route.endpoint
        );
        let discarded = self.discard(route.handle);
        if discarded > 0 {
            debug!("Discarded {} queued read(s) of {}", discarded, route.handle);
        }
        route.deliver(None);
        LoopStatus::Ended
    }

    /// Drops every queued delivery for `handle`. Returns how many were dropped.
    fn discard(&self, handle: HandleId) -> usize {
        let mut queue = self.queue.borrow_mut();
        let before = queue.len();
        queue.retain(|delivery| delivery.route.handle != handle);
        before - queue.len()
    }

    #[cfg(test)]
    fn injected_alloc_failure(&self) -> bool {
        self.fail_next_alloc.take()
    }

    #[cfg(not(test))]
    fn injected_alloc_failure(&self) -> bool {
        false
    }

    fn copy_payload(&self, data: &[u8]) -> Option<Vec<u8>> {
        if self.injected_alloc_failure() {
            return None;
        }
        let mut payload = Vec::new();
        payload.try_reserve_exact(data.len()).ok()?;
        payload.extend_from_slice(data);
        Some(payload)
    }

    /// Hands every queued delivery to its callback, oldest first.
    /// The queue is empty afterwards. Returns the number of deliveries.
    pub(crate) fn drain(&self) -> usize {
        if self.closed.get() {
            return 0;
        }
        let mut batch = mem::take(&mut *self.queue.borrow_mut());
        let count = batch.len();
        for delivery in batch.drain(..) {
            delivery.route.deliver(delivery.payload.as_deref());
        }
        // Keep the allocation for the next tick.
        let mut queue = self.queue.borrow_mut();
        if queue.is_empty() {
            *queue = batch;
        }
        count
    }
}

/// Source of libusb events.
pub(crate) trait EventSource {
    /// Processes pending events, waiting at most `timeout`. Completion
    /// handlers run from inside this call.
    fn handle_events(&self, timeout: Duration) -> Result<()>;
}

impl EventSource for rusb::Context {
    fn handle_events(&self, timeout: Duration) -> Result<()> {
        rusb::UsbContext::handle_events(self, Some(timeout))?;
        Ok(())
    }
}

/// Stops processing events once the owner is gone.
impl<E: EventSource> EventSource for Weak<E> {
    fn handle_events(&self, timeout: Duration) -> Result<()> {
        match self.upgrade() {
            Some(events) => events.handle_events(timeout),
            None => Ok(()),
        }
    }
}

/// The per-tick work registered with the mainloop.
pub(crate) struct EventPump<E> {
    events: E,
    scheduler: Rc<Scheduler>,
    config: HelperConfig,
}

impl<E: EventSource> EventPump<E> {
    pub(crate) fn new(events: E, scheduler: Rc<Scheduler>, config: HelperConfig) -> Self {
        EventPump {
            events,
            scheduler,
            config,
        }
    }

    /// Processes libusb events, then drains the deliveries they produced.
    /// Returns the number of deliveries.
    pub(crate) fn tick(&self, mainloop: &dyn Mainloop) -> usize {
        {
            let Some(_guard) = self.scheduler.begin_events() else {
                warn!("USB event processing re-entered from a read callback; tick skipped");
                return 0;
            };
            let timeout = self.config.event_timeout(mainloop.sleep_time());
            if let Err(e) = self.events.handle_events(timeout) {
                error!("Failed to process USB events: {}", e);
            }
        }
        self.scheduler.drain()
    }
}

/// State of one hidapi read loop, carried from one scheduled poll to the next.
pub(crate) struct HidPoll<R> {
    device: Weak<R>,
    route: Route,
    buffer: Vec<u8>,
    interval: u32,
}

impl<R: ReportPipe + 'static> HidPoll<R> {
    pub(crate) fn new(device: Weak<R>, route: Route, buffer: Vec<u8>, interval: u32) -> Self {
        HidPoll {
            device,
            route,
            buffer,
            interval,
        }
    }

    /// Schedules the next poll. Returns `false` if the mainloop refused it.
    pub(crate) fn schedule(self, mainloop: &mut dyn Mainloop) -> bool {
        let interval = self.interval;
        mainloop.schedule(interval, Box::new(move |mainloop: &mut dyn Mainloop| self.poll(mainloop)))
    }

    fn poll(mut self, mainloop: &mut dyn Mainloop) {
        let Some(device) = self.device.upgrade() else {
            debug!(
                "{} closed; read loop on endpoint {} ended",
                self.route.handle, self.route.endpoint
            );
            return;
        };

        loop {
            match device.read_timeout(&mut self.buffer, 0) {
                Ok(0) => break,
                Ok(n) => {
                    trace!("Read {} bytes from {}", n, self.route.handle);
                    self.route.deliver(Some(&self.buffer[..n]));
                }
                Err(e) => {
                    error!("Read from {} failed: {}", self.route.handle, e);
                    self.route.deliver(None);
                    return;
                }
            }
        }
        drop(device);

        let route = self.route.clone();
        if !self.schedule(mainloop) {
            error!("Failed to reschedule read loop of {}", route.handle);
            route.deliver(None);
        }
    }
}

impl UsbHelper {
    /// Starts reading `endpoint` of `handle` continuously, `length` bytes at
    /// a time.
    ///
    /// `callback` receives every chunk read. For libusb devices it runs from
    /// the mainloop tick after the read completed; for hidapi devices it runs
    /// from the polling task. A call with `None` means the loop has ended and
    /// the device should be treated as disconnected.
    ///
    /// The endpoint is always read in the IN direction. The loop keeps
    /// running until a read fails; close the handle only after that.
    pub fn start_read_loop<F>(
        &self,
        handle: &DeviceHandle,
        mainloop: &mut dyn Mainloop,
        endpoint: u8,
        length: usize,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(HandleId, u8, Option<&[u8]>) + 'static,
    {
        if length == 0 {
            let e = Error::ArgumentOutOfRange("read length must be at least 1".to_string());
            error!("start_read_loop on {} failed: {}", handle, e);
            return Err(e);
        }

        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(length).is_err() {
            error!("start_read_loop on {}: out of memory", handle);
            return Err(Error::Allocation(format!("{} byte read buffer", length)));
        }
        buffer.resize(length, 0);

        let route = Route::new(handle.id(), endpoint, callback);
        match &handle.connection {
            Connection::Usb(usb) => {
                usb_transfer::start(usb, Rc::clone(&self.scheduler), route, buffer).map_err(|e| {
                    error!("start_read_loop on {} failed: {}", handle, e);
                    e
                })?;
            }
            Connection::Hid(hid) => {
                let poll = HidPoll::new(Rc::downgrade(hid), route, buffer, self.config.poll_interval());
                if !poll.schedule(mainloop) {
                    error!("start_read_loop on {}: mainloop refused the poll task", handle);
                    return Err(Error::Schedule("hidapi read loop"));
                }
            }
            Connection::Closed => {
                let e = closed_handle("start_read_loop");
                warn!("{}", e);
                return Err(e);
            }
        }

        debug!(
            "Read loop started on {} endpoint {} ({} bytes)",
            handle,
            endpoint & !consts::ENDPOINT_DIR_MASK,
            length
        );
        Ok(())
    }
}
