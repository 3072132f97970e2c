//! Timer service backed by tokio sleeps.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::timer::{TimerId, TimerService};
use crate::utils::{now_millis, Clock};

use super::spawner::{TaskSpawner, TokioSpawner};
use super::{EventSender, RuntimeEvent};

/// Clock that follows tokio time, so it agrees with [`TokioTimers`] even when
/// tokio time is paused or advanced.
///
/// Readings start at the wall-clock time of construction.
#[derive(Debug, Clone)]
pub struct TokioClock {
    base_ms: u64,
    start: tokio::time::Instant,
}

impl TokioClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_ms: now_millis(),
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.base_ms + self.start.elapsed().as_millis() as u64
    }
}

/// Each timer is a spawned sleep that posts [`RuntimeEvent::Timer`] when it
/// elapses. Cancelling a timer cancels its token; the task exits without
/// posting.
pub struct TokioTimers {
    spawner: TokioSpawner,
    events: EventSender,
    next_id: u64,
    armed: HashMap<TimerId, CancellationToken>,
}

impl TokioTimers {
    pub fn new(spawner: TokioSpawner, events: EventSender) -> Self {
        Self {
            spawner,
            events,
            next_id: 0,
            armed: HashMap::new(),
        }
    }

    /// Number of timers that have neither fired nor been cancelled.
    #[must_use]
    pub fn armed_count(&self) -> usize {
        self.armed.values().filter(|t| !t.is_cancelled()).count()
    }
}

impl TimerService for TokioTimers {
    fn create_timer(&mut self, delay: Duration) -> TimerId {
        // Fired timers cancel their own token, so this drops them too.
        self.armed.retain(|_, token| !token.is_cancelled());

        self.next_id += 1;
        let id = TimerId(self.next_id);
        let token = CancellationToken::new();
        let task_token = token.clone();
        let events = self.events.clone();

        self.spawner.spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    task_token.cancel();
                    let _ = events.send(RuntimeEvent::Timer(id));
                }
            }
        });

        self.armed.insert(id, token);
        id
    }

    fn cancel_timer(&mut self, id: TimerId) {
        if let Some(token) = self.armed.remove(&id) {
            token.cancel();
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        for token in self.armed.values() {
            token.cancel();
        }
    }
}
