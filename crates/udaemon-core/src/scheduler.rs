//! Deadline-triggered tasks.
//!
//! A task fires once its deadline has passed. Its return value decides what
//! happens next: it is retired, aborted, or re-armed with a new interval,
//! which makes backoff patterns (doubling the interval on every retry) a
//! matter of returning a bigger number.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::slots::{SlotId, Slots};

/// Outcome of one task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task completed; its slot is freed.
    Finished,
    /// The task gave up; its slot is freed and it is never invoked again.
    Aborted,
    /// Run the task again after this many seconds.
    Reschedule(u32),
}

impl From<i32> for TaskStatus {
    /// `0` finishes, negative aborts, positive reschedules after that many seconds.
    fn from(v: i32) -> Self {
        match v {
            0 => TaskStatus::Finished,
            n if n < 0 => TaskStatus::Aborted,
            n => TaskStatus::Reschedule(n.unsigned_abs()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct TaskEntry<F> {
    interval: u32,
    deadline: Instant,
    /// `None` while the task is executing.
    callback: Option<F>,
}

/// Fixed-capacity table of scheduled tasks.
#[derive(Debug)]
pub(crate) struct TaskTable<F> {
    slots: Slots<TaskEntry<F>>,
}

impl<F> TaskTable<F> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Slots::with_capacity(capacity),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Schedule `callback` to fire `interval` seconds after `now`.
    pub(crate) fn schedule(
        &mut self,
        now: Instant,
        interval: u32,
        callback: F,
    ) -> Result<SlotId, RuntimeError> {
        let entry = TaskEntry {
            interval,
            deadline: now + Duration::from_secs(u64::from(interval)),
            callback: Some(callback),
        };
        match self.slots.insert(entry) {
            Ok(id) => {
                debug!("Adding task at slot {} (interval {}s)", id.index, interval);
                Ok(id)
            }
            Err(_) => Err(RuntimeError::ResourceExhausted {
                table: "task",
                capacity: self.slots.capacity(),
            }),
        }
    }

    /// Take the callback out of slot `index` if its deadline has passed.
    ///
    /// The slot stays occupied while the callback runs, so tasks scheduled
    /// from inside it cannot claim the slot.
    pub(crate) fn take_due(&mut self, index: usize, now: Instant) -> Option<(SlotId, u32, F)> {
        let id = self.slots.id_at(index)?;
        let entry = self.slots.get_mut(id)?;
        if entry.deadline > now {
            return None;
        }
        let callback = entry.callback.take()?;
        Some((id, entry.interval, callback))
    }

    /// Retire or re-arm a task after it ran at `fired_at`.
    pub(crate) fn complete(&mut self, id: SlotId, callback: F, status: TaskStatus, fired_at: Instant) {
        match status {
            TaskStatus::Finished => {
                debug!("Removing task at slot {}", id.index);
                self.slots.remove(id);
            }
            TaskStatus::Aborted => {
                warn!("Task at slot {} aborted, removing it", id.index);
                self.slots.remove(id);
            }
            TaskStatus::Reschedule(interval) => {
                if let Some(entry) = self.slots.get_mut(id) {
                    debug!(
                        "Rescheduling task at slot {} to run in {} seconds",
                        id.index, interval
                    );
                    entry.interval = interval;
                    entry.deadline = fired_at + Duration::from_secs(u64::from(interval));
                    entry.callback = Some(callback);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self, id: SlotId) -> Option<Instant> {
        self.slots.get(id).map(|e| e.deadline)
    }

    #[cfg(test)]
    pub(crate) fn interval(&self, id: SlotId) -> Option<u32> {
        self.slots.get(id).map(|e| e.interval)
    }

    /// Drop every pending task, returning how many there were.
    pub(crate) fn clear(&mut self) -> usize {
        self.slots.clear()
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
