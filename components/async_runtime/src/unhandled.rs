//! Possibly-unhandled rejection watcher.
//!
//! Rejections that settle with no continuation attached are batched for the
//! current tick. At the end of the tick ([`flush_possibly_unhandled`], called
//! by the event loop after every task) the batch is re-checked, and every
//! Deferred that still has no continuation is reported to the registered
//! handlers. The watcher is per thread.

use core_types::MessageError;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

pub(crate) trait RejectionProbe {
    fn unhandled_error(&self) -> Option<MessageError>;
}

type UnhandledHandler = Rc<dyn Fn(&MessageError)>;

thread_local! {
    static POSSIBLY_UNHANDLED: RefCell<Vec<Arc<dyn RejectionProbe>>> = RefCell::new(Vec::new());
    static HANDLERS: RefCell<Vec<(u64, UnhandledHandler)>> = RefCell::new(Vec::new());
    static NEXT_HANDLER_ID: Cell<u64> = const { Cell::new(1) };
}

pub(crate) fn track_possibly_unhandled(probe: Arc<dyn RejectionProbe>) {
    POSSIBLY_UNHANDLED.with(|batch| batch.borrow_mut().push(probe));
}

/// Registration of an unhandled-rejection handler.
///
/// The handler stays registered until the guard is dropped or cancelled.
#[derive(Debug)]
#[must_use = "dropping the guard unregisters the handler"]
pub struct UnhandledHandlerGuard {
    id: u64,
}

impl UnhandledHandlerGuard {
    /// Unregisters the handler.
    pub fn cancel(self) {}
}

impl Drop for UnhandledHandlerGuard {
    fn drop(&mut self) {
        let id = self.id;
        HANDLERS.with(|handlers| handlers.borrow_mut().retain(|(handler_id, _)| *handler_id != id));
    }
}

/// Registers a diagnostic handler for rejections nobody handled.
///
/// # Examples
///
/// ```
/// use async_runtime::{flush_possibly_unhandled, on_possibly_unhandled, Deferred};
/// use core_types::MessageError;
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let seen = Rc::new(Cell::new(0));
/// let counter = Rc::clone(&seen);
/// let _guard = on_possibly_unhandled(move |_| counter.set(counter.get() + 1));
///
/// let deferred: Deferred<()> = Deferred::new();
/// deferred.reject(MessageError::handler("nobody listens"));
/// flush_possibly_unhandled();
/// assert_eq!(seen.get(), 1);
/// ```
pub fn on_possibly_unhandled<F>(handler: F) -> UnhandledHandlerGuard
where
    F: Fn(&MessageError) + 'static,
{
    let id = NEXT_HANDLER_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        id
    });
    HANDLERS.with(|handlers| handlers.borrow_mut().push((id, Rc::new(handler))));
    UnhandledHandlerGuard { id }
}

/// Reports every rejection of the current batch that is still unhandled.
///
/// Returns the number of rejections reported.
pub fn flush_possibly_unhandled() -> usize {
    let batch = POSSIBLY_UNHANDLED.with(|batch| std::mem::take(&mut *batch.borrow_mut()));
    if batch.is_empty() {
        return 0;
    }
    let handlers: Vec<UnhandledHandler> =
        HANDLERS.with(|handlers| handlers.borrow().iter().map(|(_, h)| Rc::clone(h)).collect());

    let mut reported = 0;
    for probe in batch {
        let Some(error) = probe.unhandled_error() else {
            continue;
        };
        reported += 1;
        if handlers.is_empty() {
            tracing::debug!(error = %error, "possibly unhandled rejection");
        }
        for handler in &handlers {
            handler(&error);
        }
    }
    reported
}
