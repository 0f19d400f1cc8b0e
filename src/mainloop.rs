//! Interface to the host application's mainloop.
//!
//! The helper never owns a loop of its own. It registers one per-tick
//! callback when initialized and, for hidapi read loops, one-shot tasks
//! that run a given number of ticks later.

use std::time::Duration;

/// Callback invoked by the mainloop on every tick.
pub type TickCallback = Box<dyn FnMut(&mut dyn Mainloop)>;

/// One-shot task invoked by the mainloop after a delay. The task owns its payload.
pub type Task = Box<dyn FnOnce(&mut dyn Mainloop)>;

/// The host's periodic scheduler, as seen by the helper.
///
/// Implementations are expected to hand themselves to the callbacks they run,
/// so a task can reschedule itself.
pub trait Mainloop {
    /// Registers a callback to run on every tick.
    /// Returns `false` when the mainloop cannot take another callback.
    fn add_tick_callback(&mut self, callback: TickCallback) -> bool;

    /// Runs `task` once, no sooner than `ticks` ticks from now.
    /// Returns `false` when the task could not be scheduled.
    fn schedule(&mut self, ticks: u32, task: Task) -> bool;

    /// Time the mainloop would sleep before its next tick if nothing happens.
    fn sleep_time(&self) -> Duration;
}
