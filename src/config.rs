//! Tunables for a [`UsbHelper`](crate::UsbHelper).

use crate::consts;
use std::time::Duration;

/// How long each tick may wait inside libusb event processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventWait {
    /// Poll with a zero timeout; the mainloop does its own blocking.
    Immediate,
    /// Wait up to the mainloop's idle-sleep budget, so event processing
    /// doubles as the loop's sleep.
    SleepBudget,
}

impl Default for EventWait {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            EventWait::Immediate
        } else {
            EventWait::SleepBudget
        }
    }
}

/// Configuration for a [`UsbHelper`](crate::UsbHelper).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperConfig {
    /// Timeout policy for per-tick libusb event processing.
    pub event_wait: EventWait,
    /// Timeout applied to every synchronous control transfer.
    pub control_timeout: Duration,
    /// Ticks between blocking-read polls of hidapi read loops (at least 1).
    pub hid_poll_interval: u32,
    /// Initial capacity reserved for the delivery queue.
    pub queue_capacity: usize,
}

impl Default for HelperConfig {
    fn default() -> Self {
        HelperConfig {
            event_wait: EventWait::default(),
            control_timeout: consts::DEFAULT_CONTROL_TIMEOUT,
            hid_poll_interval: consts::DEFAULT_HID_POLL_INTERVAL,
            queue_capacity: consts::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl HelperConfig {
    /// Returns the event processing timeout for one tick.
    pub(crate) fn event_timeout(&self, sleep_budget: Duration) -> Duration {
        match self.event_wait {
            EventWait::Immediate => Duration::ZERO,
            EventWait::SleepBudget => sleep_budget,
        }
    }

    /// Poll interval clamped so a hidapi loop never reschedules for the same tick.
    pub(crate) fn poll_interval(&self) -> u32 {
        self.hid_poll_interval.max(1)
    }
}
