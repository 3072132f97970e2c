//! Connection backoff gate.
//!
//! Decides whether a connect attempt may run now or must wait until the
//! backoff deadline set by the last transient server error has passed. At most
//! one task and one timer are pending at a time.

use std::sync::Arc;
use std::time::Duration;

use crate::error::WorkerManagerErrorCode;
use crate::protocol_constants::{BACKOFF_INITIAL_MS, BACKOFF_MAX_MS};
use crate::timer::{TimerId, TimerService};
use crate::utils::Clock;

/// Next interval in the doubling backoff sequence (0 → 4000 → 8000 … capped at 30000).
#[must_use]
pub(crate) fn next_backoff_interval(current_ms: u64) -> u64 {
    if current_ms == 0 {
        BACKOFF_INITIAL_MS
    } else {
        current_ms.saturating_mul(2).min(BACKOFF_MAX_MS)
    }
}

/// Backoff gate for connect attempts.
///
/// Generic over the deferred task so the owner decides what "connect" means;
/// the gate only stores it and hands it back when it may run.
pub struct ConnectionStrategy<T> {
    clock: Arc<dyn Clock>,
    /// Current backoff in milliseconds (0 = no penalty).
    interval: u64,
    /// Attempts are deferred until this absolute time (milliseconds).
    active_ts: u64,
    task: Option<T>,
    timer: Option<TimerId>,
}

impl<T> ConnectionStrategy<T> {
    /// Creates an idle gate.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            interval: 0,
            active_ts: 0,
            task: None,
            timer: None,
        }
    }

    /// Requests a connect attempt.
    ///
    /// Returns the task if it may run immediately (no active penalty), in which
    /// case any pending task and timer are dropped. Otherwise the task replaces
    /// whatever was pending and a single timer is armed for the remaining
    /// backoff; the task comes back from [`on_timer`](Self::on_timer).
    pub fn connect(&mut self, task: T, timers: &mut dyn TimerService) -> Option<T> {
        let now = self.clock.now_ms();
        if self.active_ts <= now {
            self.cancel(timers);
            return Some(task);
        }

        self.task = Some(task);
        if self.timer.is_none() {
            let delay = self.active_ts - now;
            log::info!(
                "[ConnectionStrategy] Deferring connect for {}ms (backoff {}ms)",
                delay,
                self.interval
            );
            self.timer = Some(timers.create_timer(Duration::from_millis(delay)));
        }
        None
    }

    /// Releases the pending task when its timer fires.
    ///
    /// Returns `None` for timers this gate does not own.
    pub fn on_timer(&mut self, id: TimerId) -> Option<T> {
        if self.timer != Some(id) {
            return None;
        }
        self.timer = None;
        self.task.take()
    }

    /// Feeds a server result into the gate.
    ///
    /// Transient server errors escalate the backoff; success clears it and
    /// drops any deferred attempt. Other codes leave the gate unchanged.
    pub fn on_code(&mut self, code: WorkerManagerErrorCode, timers: &mut dyn TimerService) {
        if code.is_transient_server_error() {
            self.interval = next_backoff_interval(self.interval);
            self.active_ts = self.clock.now_ms() + self.interval;
            log::warn!(
                "[ConnectionStrategy] {} - backing off {}ms",
                code,
                self.interval
            );
        } else if code == WorkerManagerErrorCode::ServerNoError {
            self.interval = 0;
            self.active_ts = 0;
            self.cancel(timers);
        }
    }

    /// Drops the pending task and cancels its timer.
    pub fn cancel(&mut self, timers: &mut dyn TimerService) {
        if let Some(id) = self.timer.take() {
            timers.cancel_timer(id);
        }
        self.task = None;
    }

    /// Returns true if `id` is this gate's pending timer.
    #[must_use]
    pub fn owns_timer(&self, id: TimerId) -> bool {
        self.timer == Some(id)
    }

    /// Current backoff interval in milliseconds.
    #[must_use]
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Absolute time before which attempts are deferred.
    #[must_use]
    pub fn active_ts(&self) -> u64 {
        self.active_ts
    }

    /// Returns true if a deferred task is waiting.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.task.is_some()
    }
}
