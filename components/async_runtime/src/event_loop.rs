//! Event loop implementation.
//!
//! This module provides a single-threaded event loop driven by a virtual
//! clock. Each turn runs one task (or one due timer callback) and then ends
//! the tick by flushing the possibly-unhandled rejection watcher. Time only
//! moves when the owner calls [`EventLoop::advance`] or
//! [`EventLoop::run_until`], which keeps timeout behavior deterministic.

use crate::deferred::Deferred;
use crate::task_queue::{Task, TaskQueue, TimerCallback, TimerId, TimerQueue};
use crate::unhandled::flush_possibly_unhandled;
use core_types::MessageError;
use parking_lot::Mutex;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

#[derive(Default)]
struct LoopState {
    now: u64,
    tasks: TaskQueue,
    timers: TimerQueue,
    next_timer_id: u64,
    firing: Option<TimerId>,
    firing_cancelled: bool,
}

/// The event loop shared by every window of a browser.
///
/// Cloning yields another handle to the same loop.
///
/// # Examples
///
/// ```
/// use async_runtime::EventLoop;
/// use std::sync::{Arc, Mutex};
///
/// let event_loop = EventLoop::new();
/// let fired = Arc::new(Mutex::new(Vec::new()));
///
/// let log = Arc::clone(&fired);
/// event_loop.set_timeout(100, move || log.lock().unwrap().push("timeout"));
/// let log = Arc::clone(&fired);
/// event_loop.spawn(move || log.lock().unwrap().push("task"));
///
/// event_loop.run_until_idle();
/// assert_eq!(*fired.lock().unwrap(), vec!["task"]);
///
/// event_loop.advance(100);
/// assert_eq!(*fired.lock().unwrap(), vec!["task", "timeout"]);
/// assert_eq!(event_loop.now(), 100);
/// ```
#[derive(Clone, Default)]
pub struct EventLoop {
    state: Arc<Mutex<LoopState>>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventLoop")
            .field("now", &state.now)
            .field("tasks", &state.tasks.len())
            .field("timers", &state.timers)
            .finish()
    }
}

impl EventLoop {
    /// Creates a new EventLoop with empty queues at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        self.state.lock().now
    }

    /// Adds a task to the task queue.
    pub fn enqueue_task(&self, task: Task) {
        self.state.lock().tasks.enqueue(task);
    }

    /// Queues `f` to run in a later turn.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue_task(Task::new(f));
    }

    /// Runs `f` once, `delay_ms` after the current time.
    pub fn set_timeout<F>(&self, delay_ms: u64, f: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(delay_ms, TimerCallback::Once(Box::new(f)))
    }

    /// Runs `f` every `period_ms` until it returns `ControlFlow::Break`
    /// or the timer is cleared.
    pub fn set_interval<F>(&self, period_ms: u64, f: F) -> TimerId
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let period = period_ms.max(1);
        self.schedule(
            period,
            TimerCallback::Repeat {
                period,
                callback: Box::new(f),
            },
        )
    }

    fn schedule(&self, delay_ms: u64, callback: TimerCallback) -> TimerId {
        let mut state = self.state.lock();
        state.next_timer_id += 1;
        let id = TimerId(state.next_timer_id);
        let due = state.now + delay_ms;
        state.timers.schedule(id, due, callback);
        id
    }

    /// Cancels a timeout or interval, including from inside its own callback.
    ///
    /// Returns false if the timer had already fired or been cleared.
    pub fn clear_timer(&self, id: TimerId) -> bool {
        let mut state = self.state.lock();
        if state.timers.cancel(id) {
            return true;
        }
        if state.firing == Some(id) && !state.firing_cancelled {
            state.firing_cancelled = true;
            return true;
        }
        false
    }

    /// Returns true if the task queue is empty.
    pub fn is_task_queue_empty(&self) -> bool {
        self.state.lock().tasks.is_empty()
    }

    /// Returns the number of scheduled timers.
    pub fn pending_timers(&self) -> usize {
        self.state.lock().timers.len()
    }

    /// Runs the oldest task, if any, and ends the tick.
    ///
    /// Returns true if a task ran.
    pub fn process_one_cycle(&self) -> bool {
        let task = self.state.lock().tasks.dequeue();
        match task {
            Some(task) => {
                task.run();
                flush_possibly_unhandled();
                true
            }
            None => false,
        }
    }

    fn fire_due_timer(&self) -> bool {
        let popped = {
            let mut state = self.state.lock();
            let now = state.now;
            let popped = state.timers.pop_due(now);
            if let Some((id, _, _)) = &popped {
                state.firing = Some(*id);
                state.firing_cancelled = false;
            }
            popped
        };
        let Some((id, due, callback)) = popped else {
            return false;
        };

        match callback {
            TimerCallback::Once(f) => f(),
            TimerCallback::Repeat {
                period,
                mut callback,
            } => {
                let flow = callback();
                let mut state = self.state.lock();
                if flow.is_continue() && !state.firing_cancelled {
                    state.timers.schedule(
                        id,
                        due + period,
                        TimerCallback::Repeat { period, callback },
                    );
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.firing = None;
            state.firing_cancelled = false;
        }
        flush_possibly_unhandled();
        true
    }

    /// Runs tasks and due timers until nothing is runnable at the current
    /// time.
    ///
    /// Returns the number of turns executed.
    pub fn run_until_idle(&self) -> usize {
        let mut turns = 0;
        loop {
            if self.process_one_cycle() || self.fire_due_timer() {
                turns += 1;
                continue;
            }
            return turns;
        }
    }

    /// Moves the clock forward by `ms`, firing every timer that falls due on
    /// the way in order.
    ///
    /// Returns the number of turns executed.
    pub fn advance(&self, ms: u64) -> usize {
        let target = self.now() + ms;
        let mut turns = self.run_until_idle();
        while self.step_to_next_timer(target) {
            turns += self.run_until_idle();
        }
        self.state.lock().now = target;
        turns + self.run_until_idle()
    }

    /// Advances the clock timer by timer until `predicate` holds or `max_ms`
    /// elapse.
    ///
    /// Returns the final value of `predicate`.
    pub fn run_until<P>(&self, max_ms: u64, mut predicate: P) -> bool
    where
        P: FnMut() -> bool,
    {
        let deadline = self.now() + max_ms;
        self.run_until_idle();
        if predicate() {
            return true;
        }
        while self.step_to_next_timer(deadline) {
            self.run_until_idle();
            if predicate() {
                return true;
            }
        }
        self.state.lock().now = deadline;
        self.run_until_idle();
        predicate()
    }

    fn step_to_next_timer(&self, limit: u64) -> bool {
        let mut state = self.state.lock();
        match state.timers.next_due() {
            Some(due) if due <= limit => {
                state.now = state.now.max(due);
                true
            }
            _ => false,
        }
    }

    /// Returns a Deferred that resolves after `ms`.
    pub fn delay(&self, ms: u64) -> Deferred<()> {
        let deferred = Deferred::new();
        let target = deferred.clone();
        self.set_timeout(ms, move || {
            target.resolve(());
        });
        deferred
    }

    /// Derives a Deferred that settles like `source`, or rejects with
    /// `make_error()` if `source` is still pending after `ms`.
    pub fn timeout<T, E>(&self, source: &Deferred<T>, ms: u64, make_error: E) -> Deferred<T>
    where
        T: Clone + Send + 'static,
        E: FnOnce() -> MessageError + Send + 'static,
    {
        let output = Deferred::new();
        let expired = output.clone();
        let timer = self.set_timeout(ms, move || {
            expired.reject(make_error());
        });

        let event_loop = self.clone();
        let settled = output.clone();
        source.on_settled(move |result| {
            event_loop.clear_timer(timer);
            settled.settle(result);
        });
        output
    }
}
