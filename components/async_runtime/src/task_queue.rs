//! Task and timer queue management.
//!
//! This module provides the queues used by the event loop. Tasks run one at
//! a time in FIFO order; timers are ordered by due time on the loop's virtual
//! clock, ties broken by creation order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::ops::ControlFlow;

/// A task to be executed by the event loop.
///
/// Tasks represent work to be done in a later turn of the event loop.
/// Examples include message deliveries and page script execution.
pub struct Task {
    callback: Box<dyn FnOnce() + Send>,
}

impl Task {
    /// Creates a new Task from a closure.
    ///
    /// # Arguments
    ///
    /// * `f` - The function to execute when the task runs
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            callback: Box::new(f),
        }
    }

    /// Executes the task.
    pub fn run(self) {
        (self.callback)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task {{ ... }}")
    }
}

/// A queue for tasks.
///
/// Tasks are processed in FIFO order, one at a time.
#[derive(Debug, Default)]
pub struct TaskQueue {
    queue: VecDeque<Task>,
}

impl TaskQueue {
    /// Creates a new empty TaskQueue.
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Adds a task to the end of the queue.
    pub fn enqueue(&mut self, task: Task) {
        self.queue.push_back(task);
    }

    /// Removes and returns the next task from the queue.
    pub fn dequeue(&mut self) -> Option<Task> {
        self.queue.pop_front()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns the number of tasks in the queue.
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Identifier of a scheduled timeout or interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

pub(crate) enum TimerCallback {
    Once(Box<dyn FnOnce() + Send>),
    Repeat {
        period: u64,
        callback: Box<dyn FnMut() -> ControlFlow<()> + Send>,
    },
}

/// A queue of timers ordered by due time.
#[derive(Default)]
pub struct TimerQueue {
    entries: BTreeMap<(u64, TimerId), TimerCallback>,
    due_by_id: HashMap<TimerId, u64>,
}

impl TimerQueue {
    /// Creates a new empty TimerQueue.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule(&mut self, id: TimerId, due: u64, callback: TimerCallback) {
        self.entries.insert((due, id), callback);
        self.due_by_id.insert(id, due);
    }

    /// Removes a timer. Returns false if it was not scheduled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.due_by_id.remove(&id) {
            Some(due) => self.entries.remove(&(due, id)).is_some(),
            None => false,
        }
    }

    /// Returns the due time of the earliest timer.
    pub fn next_due(&self) -> Option<u64> {
        self.entries.keys().next().map(|(due, _)| *due)
    }

    pub(crate) fn pop_due(&mut self, now: u64) -> Option<(TimerId, u64, TimerCallback)> {
        let (due, id) = *self.entries.keys().next()?;
        if due > now {
            return None;
        }
        let callback = self.entries.remove(&(due, id))?;
        self.due_by_id.remove(&id);
        Some((id, due, callback))
    }

    /// Returns true if no timer is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of scheduled timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("len", &self.entries.len())
            .field("next_due", &self.next_due())
            .finish()
    }
}
