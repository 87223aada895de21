//! Scheduled-cleanup pacer.
//!
//! Expiration must make progress even when the cache goes quiet, so the
//! maintenance pass hands the next deadline to an external [`Scheduler`].
//! Deadlines arrive on every drain; rescheduling each one would thrash the
//! scheduler, so the pacer coalesces: a pending fire within one tolerance of
//! the requested time is left alone, anything else is cancelled and
//! replaced. Delays are floored at the tolerance so a burst of imminent
//! deadlines produces one wake-up, not many.
//!
//! `clean_up` and `invalidate_all` cancel whatever is pending and reset
//! `next_fire_time` to zero; the next drain with live deadlines re-arms.

use crate::traits::{Scheduler, Task};
use std::sync::Arc;

use crate::traits::ScheduledTask;

/// Reschedules closer than this to the pending fire time are skipped; also
/// the minimum scheduled delay (~1.07 s).
pub const TOLERANCE: u64 = 1 << 30;

/// Coalescing coordinator for the delayed cleanup task.
#[derive(Default)]
pub struct Pacer {
    next_fire_time: u64,
    future: Option<Arc<dyn ScheduledTask>>,
}

impl std::fmt::Debug for Pacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pacer")
            .field("next_fire_time", &self.next_fire_time)
            .field("scheduled", &self.future.is_some())
            .finish()
    }
}

impl Pacer {
    /// Creates an idle pacer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The absolute fire time of the pending task, or zero when idle.
    #[inline]
    pub fn next_fire_time(&self) -> u64 {
        self.next_fire_time
    }

    /// Returns `true` while a cleanup is pending.
    #[inline]
    pub fn is_scheduled(&self) -> bool {
        self.future.is_some()
    }

    /// Requests a cleanup roughly `delay` nanoseconds from `now`.
    ///
    /// Skips when the pending fire time is still ahead and within
    /// [`TOLERANCE`] of the request; otherwise cancels and re-arms with a
    /// delay floored at the tolerance.
    pub fn schedule(&mut self, scheduler: &dyn Scheduler, task: Task, now: u64, delay: u64) {
        let schedule_at = now.saturating_add(delay);
        if let Some(future) = &self.future {
            if self.next_fire_time > now && self.next_fire_time.abs_diff(schedule_at) <= TOLERANCE {
                return;
            }
            future.cancel();
        }

        let actual_delay = delay.max(TOLERANCE);
        self.next_fire_time = now.saturating_add(actual_delay);
        self.future = Some(scheduler.schedule(actual_delay, task));
    }

    /// Cancels any pending cleanup and resets the fire time.
    pub fn cancel(&mut self) {
        if let Some(future) = self.future.take() {
            future.cancel();
        }
        self.next_fire_time = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
