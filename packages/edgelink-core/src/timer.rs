//! Timer abstraction for the cooperative event loop.
//!
//! Components never sleep or block. They ask a [`TimerService`] for a timer and
//! get a [`TimerId`] back; when the timer fires, the driver hands the id to
//! the owning component (`WorkerManagerChannel::on_timer`). Cancelled timers
//! may still be delivered by a racing driver, so owners compare the id against
//! the one they armed and ignore anything else.

use std::fmt;
use std::time::Duration;

/// Handle for one armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Abstraction for scheduling one-shot timers.
///
/// # Example
///
/// ```ignore
/// struct Heartbeat {
///     timer: Option<TimerId>,
/// }
///
/// impl Heartbeat {
///     fn arm(&mut self, timers: &mut dyn TimerService) {
///         self.timer = Some(timers.create_timer(Duration::from_secs(2)));
///     }
///
///     fn on_timer(&mut self, id: TimerId) {
///         if self.timer == Some(id) {
///             self.timer = None;
///             // fire
///         }
///     }
/// }
/// ```
pub trait TimerService: Send {
    /// Arms a one-shot timer firing after `delay`.
    ///
    /// A zero delay fires on the next loop iteration, never synchronously.
    fn create_timer(&mut self, delay: Duration) -> TimerId;

    /// Cancels a timer. Unknown or already-fired ids are ignored.
    fn cancel_timer(&mut self, id: TimerId);
}
