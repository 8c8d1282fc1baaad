//! Deferred results with eager, order-preserving continuation dispatch.
//!
//! A [`Deferred`] is a settle-once resolve/reject container. Unlike a
//! scheduler-driven future, its continuations run synchronously at the moment
//! the value settles (or immediately, if attached after settlement), in the
//! order they were attached. Cross-window code relies on this: a response
//! handler must observe the settlement in the same turn that delivered it.

use crate::unhandled::{track_possibly_unhandled, RejectionProbe};
use core_types::{MessageError, MessageResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// The state of a Deferred.
///
/// Once settled (Resolved or Rejected), a Deferred cannot change state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    /// The initial state; neither resolved nor rejected.
    Pending,
    /// Settled with a value.
    Resolved,
    /// Settled with an error.
    Rejected,
}

enum Slot<T> {
    Pending,
    Resolved(T),
    Rejected(MessageError),
}

impl<T: Clone> Slot<T> {
    fn snapshot(&self) -> Option<MessageResult<T>> {
        match self {
            Slot::Pending => None,
            Slot::Resolved(value) => Some(Ok(value.clone())),
            Slot::Rejected(error) => Some(Err(error.clone())),
        }
    }

    fn state(&self) -> DeferredState {
        match self {
            Slot::Pending => DeferredState::Pending,
            Slot::Resolved(_) => DeferredState::Resolved,
            Slot::Rejected(_) => DeferredState::Rejected,
        }
    }
}

type Reaction<T> = Box<dyn FnOnce(MessageResult<T>) + Send>;

struct Shared<T> {
    slot: Slot<T>,
    reactions: VecDeque<Reaction<T>>,
    dispatching: bool,
    error_handled: bool,
}

impl<T: Clone + Send> RejectionProbe for Mutex<Shared<T>> {
    fn unhandled_error(&self) -> Option<MessageError> {
        let shared = self.lock();
        if shared.error_handled {
            return None;
        }
        match &shared.slot {
            Slot::Rejected(error) => Some(error.clone()),
            _ => None,
        }
    }
}

/// A settle-once result that may not be available yet.
///
/// Cloning a `Deferred` yields another handle to the same result.
///
/// # Examples
///
/// ```
/// use async_runtime::{Deferred, DeferredState};
///
/// let deferred: Deferred<u32> = Deferred::new();
/// let doubled = deferred.then(|value| Ok(value * 2));
///
/// deferred.resolve(21);
/// assert_eq!(doubled.state(), DeferredState::Resolved);
/// assert_eq!(doubled.result(), Some(Ok(42)));
/// ```
pub struct Deferred<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.lock().slot {
            Slot::Pending => "pending",
            Slot::Resolved(_) => "resolved",
            Slot::Rejected(_) => "rejected",
        };
        write!(f, "Deferred {{ {} }}", state)
    }
}

/// An input to [`Deferred::all`]: either a plain value or a pending result.
pub enum MaybeDeferred<T> {
    /// A value that is already available.
    Value(T),
    /// A result that may still be pending.
    Deferred(Deferred<T>),
}

impl<T> From<Deferred<T>> for MaybeDeferred<T> {
    fn from(deferred: Deferred<T>) -> Self {
        MaybeDeferred::Deferred(deferred)
    }
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Creates a new pending Deferred.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                slot: Slot::Pending,
                reactions: VecDeque::new(),
                dispatching: false,
                error_handled: false,
            })),
        }
    }

    /// Creates a Deferred already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        let deferred = Self::new();
        deferred.resolve(value);
        deferred
    }

    /// Creates a Deferred already rejected with `error`.
    pub fn rejected(error: MessageError) -> Self {
        let deferred = Self::new();
        deferred.reject(error);
        deferred
    }

    /// Runs `f` and settles a new Deferred with its outcome.
    pub fn try_call<F>(f: F) -> Self
    where
        F: FnOnce() -> MessageResult<T>,
    {
        let deferred = Self::new();
        deferred.settle(f());
        deferred
    }

    /// Returns the current state.
    pub fn state(&self) -> DeferredState {
        self.shared.lock().slot.state()
    }

    /// Returns true while the Deferred has not settled.
    pub fn is_pending(&self) -> bool {
        self.state() == DeferredState::Pending
    }

    /// Returns a copy of the settled result, or `None` while pending.
    ///
    /// Peeking does not count as handling a rejection.
    pub fn result(&self) -> Option<MessageResult<T>> {
        self.shared.lock().slot.snapshot()
    }

    /// Resolves with `value`. Returns false if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Rejects with `error`. Returns false if already settled.
    pub fn reject(&self, error: MessageError) -> bool {
        self.settle(Err(error))
    }

    /// Settles with `result`. Returns false if already settled.
    ///
    /// Every attached continuation runs before this call returns.
    pub fn settle(&self, result: MessageResult<T>) -> bool {
        let track = {
            let mut shared = self.shared.lock();
            if !matches!(shared.slot, Slot::Pending) {
                return false;
            }
            match result {
                Ok(value) => {
                    shared.slot = Slot::Resolved(value);
                    false
                }
                Err(error) => {
                    shared.slot = Slot::Rejected(error);
                    !shared.error_handled
                }
            }
        };
        if track {
            let probe: Arc<dyn RejectionProbe> = self.shared.clone();
            track_possibly_unhandled(probe);
        }
        self.dispatch();
        true
    }

    /// Attaches a continuation that receives the settled result.
    ///
    /// Runs immediately if the Deferred has already settled. Attaching any
    /// continuation marks a rejection as handled.
    pub fn on_settled<F>(&self, f: F)
    where
        F: FnOnce(MessageResult<T>) + Send + 'static,
    {
        {
            let mut shared = self.shared.lock();
            shared.error_handled = true;
            shared.reactions.push_back(Box::new(f));
        }
        self.dispatch();
    }

    /// Chains a fallible transformation of the resolved value.
    ///
    /// Rejections propagate to the returned Deferred unchanged.
    pub fn then<U, F>(&self, on_resolved: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> MessageResult<U> + Send + 'static,
    {
        let chained = Deferred::new();
        let target = chained.clone();
        self.on_settled(move |result| {
            target.settle(result.and_then(on_resolved));
        });
        chained
    }

    /// Chains a continuation that itself returns a Deferred.
    pub fn and_then<U, F>(&self, on_resolved: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Deferred<U> + Send + 'static,
    {
        let chained = Deferred::new();
        let target = chained.clone();
        self.on_settled(move |result| match result {
            Ok(value) => on_resolved(value).forward_to(&target),
            Err(error) => {
                target.reject(error);
            }
        });
        chained
    }

    /// Recovers from a rejection.
    pub fn catch<F>(&self, on_rejected: F) -> Deferred<T>
    where
        F: FnOnce(MessageError) -> MessageResult<T> + Send + 'static,
    {
        let chained = Deferred::new();
        let target = chained.clone();
        self.on_settled(move |result| {
            target.settle(result.or_else(on_rejected));
        });
        chained
    }

    /// Runs `f` on settlement and passes the result through unchanged.
    pub fn finally<F>(&self, f: F) -> Deferred<T>
    where
        F: FnOnce() + Send + 'static,
    {
        let chained = Deferred::new();
        let target = chained.clone();
        self.on_settled(move |result| {
            f();
            target.settle(result);
        });
        chained
    }

    /// Settles `target` with this Deferred's result once available.
    pub fn forward_to(&self, target: &Deferred<T>) {
        let target = target.clone();
        self.on_settled(move |result| {
            target.settle(result);
        });
    }

    /// Aggregates `items` into a single Deferred.
    ///
    /// Resolves with every value, in input order, once all inputs resolve;
    /// rejects with the first rejection. Plain values count as resolved.
    pub fn all<I>(items: I) -> Deferred<Vec<T>>
    where
        I: IntoIterator<Item = MaybeDeferred<T>>,
    {
        let items: Vec<MaybeDeferred<T>> = items.into_iter().collect();
        let output = Deferred::new();
        if items.is_empty() {
            output.resolve(Vec::new());
            return output;
        }

        let progress = Arc::new(Mutex::new(AllProgress {
            values: vec![None; items.len()],
            remaining: items.len(),
        }));

        for (index, item) in items.into_iter().enumerate() {
            match item {
                MaybeDeferred::Value(value) => AllProgress::fill(&progress, &output, index, value),
                MaybeDeferred::Deferred(deferred) => {
                    let progress = Arc::clone(&progress);
                    let output = output.clone();
                    deferred.on_settled(move |result| match result {
                        Ok(value) => AllProgress::fill(&progress, &output, index, value),
                        Err(error) => {
                            output.reject(error);
                        }
                    });
                }
            }
        }
        output
    }

    fn dispatch(&self) {
        {
            let mut shared = self.shared.lock();
            if shared.dispatching || matches!(shared.slot, Slot::Pending) {
                return;
            }
            shared.dispatching = true;
        }

        // Continuations attached while dispatching are queued behind the
        // current one, which keeps attachment order.
        loop {
            let next = {
                let mut shared = self.shared.lock();
                match shared.reactions.pop_front() {
                    Some(reaction) => shared.slot.snapshot().map(|result| (reaction, result)),
                    None => {
                        shared.dispatching = false;
                        None
                    }
                }
            };
            match next {
                Some((reaction, result)) => reaction(result),
                None => break,
            }
        }
    }
}

struct AllProgress<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T: Clone + Send + 'static> AllProgress<T> {
    fn fill(progress: &Mutex<Self>, output: &Deferred<Vec<T>>, index: usize, value: T) {
        let completed = {
            let mut progress = progress.lock();
            if progress.values[index].is_some() {
                return;
            }
            progress.values[index] = Some(value);
            progress.remaining -= 1;
            if progress.remaining == 0 {
                Some(progress.values.drain(..).flatten().collect::<Vec<T>>())
            } else {
                None
            }
        };
        if let Some(values) = completed {
            output.resolve(values);
        }
    }
}
