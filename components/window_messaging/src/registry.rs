//! Listener registry.
//!
//! One registry per messenger holds:
//! - the response table: hash of every outstanding request, until it settles
//! - the request table: inbound handlers, scanned in registration order
//! - the ids already processed, for idempotent receipt
//! - readiness of the windows this messenger talks to
//!
//! Every method returns what must be settled instead of settling under the
//! lock; callers settle afterwards.

use crate::client::Reply;
use crate::envelope::{AckStatus, Envelope};
use async_runtime::Deferred;
use core_types::{ErrorKind, MessageError, MessageResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use web_platform::{DomainMatcher, MessageEvent, WindowId};

pub(crate) type Handler = Arc<dyn Fn(MessageEvent) -> MessageResult<Reply> + Send + Sync>;

/// Callback told about failures of a request handler.
pub type ErrorHandler = Arc<dyn Fn(&MessageError) + Send + Sync>;

/// Which callers a request listener accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WindowMatch {
    /// Any window (`*`)
    #[default]
    Any,
    /// Only this window
    Window(WindowId),
}

impl WindowMatch {
    /// Returns true if a message from `source` is accepted.
    pub fn matches(&self, source: WindowId) -> bool {
        match self {
            WindowMatch::Any => true,
            WindowMatch::Window(win) => *win == source,
        }
    }
}

impl From<WindowId> for WindowMatch {
    fn from(win: WindowId) -> Self {
        WindowMatch::Window(win)
    }
}

impl fmt::Display for WindowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowMatch::Any => f.write_str("*"),
            WindowMatch::Window(win) => write!(f, "{}", win),
        }
    }
}

#[derive(Clone)]
pub(crate) struct RequestListener {
    pub id: u64,
    pub name: String,
    pub window: WindowMatch,
    pub domain: DomainMatcher,
    pub handler: Handler,
    pub error_handler: Option<ErrorHandler>,
    pub once: bool,
}

pub(crate) struct NewRequestListener {
    pub name: String,
    pub window: WindowMatch,
    pub domain: DomainMatcher,
    pub handler: Handler,
    pub error_handler: Option<ErrorHandler>,
    pub once: bool,
    pub override_existing: bool,
}

struct EarlyResponse {
    source: WindowId,
    origin: String,
    envelope: Envelope,
}

pub(crate) struct ResponseListener {
    pub name: String,
    pub window: WindowId,
    pub domain: DomainMatcher,
    pub settle: Deferred<MessageEvent>,
    acked_at: Option<u64>,
    early: Option<EarlyResponse>,
}

impl ResponseListener {
    pub fn new(
        name: &str,
        window: WindowId,
        domain: DomainMatcher,
        settle: Deferred<MessageEvent>,
    ) -> Self {
        Self {
            name: name.to_string(),
            window,
            domain,
            settle,
            acked_at: None,
            early: None,
        }
    }
}

/// Settlement computed under the lock, applied by the caller.
pub(crate) type Settlement = (Deferred<MessageEvent>, MessageResult<MessageEvent>);

pub(crate) enum AckOutcome {
    Unknown { retired: bool },
    DomainMismatch { expected: String },
    Acked { settle: Option<Settlement> },
}

pub(crate) enum ResponseOutcome {
    Unknown { retired: bool },
    WrongSource { expected: WindowId },
    Stashed,
    Settle(Settlement),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingStatus {
    pub name: String,
    pub window: WindowId,
    pub acked_at: Option<u64>,
}

fn settle_with(
    source: WindowId,
    origin: String,
    envelope: Envelope,
) -> MessageResult<MessageEvent> {
    match envelope.ack {
        Some(AckStatus::Error) => Err(envelope.to_error()),
        _ => Ok(MessageEvent {
            source,
            origin,
            data: envelope.data,
        }),
    }
}

/// Number of settled hashes and processed ids remembered.
const REMEMBERED_KEYS: usize = 1024;

/// Set of the most recently inserted keys.
#[derive(Default)]
struct RecentKeys {
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl RecentKeys {
    /// Returns false if `key` is already remembered.
    fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        while self.order.len() >= REMEMBERED_KEYS {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.order.push_back(key.to_string());
        self.keys.insert(key.to_string());
        true
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    responses: Mutex<HashMap<String, ResponseListener>>,
    retired: Mutex<RecentKeys>,
    requests: Mutex<Vec<RequestListener>>,
    seen: Mutex<RecentKeys>,
    ready: Mutex<HashMap<WindowId, Deferred<()>>>,
    next_listener_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // Request table

    pub fn add_request_listener(&self, listener: NewRequestListener) -> MessageResult<u64> {
        let mut requests = self.requests.lock();
        let existing = requests
            .iter()
            .position(|l| l.name == listener.name && l.window == listener.window);
        if let Some(index) = existing {
            if !listener.override_existing {
                return Err(MessageError::new(
                    ErrorKind::ListenerExists,
                    format!(
                        "Request listener already exists for {} on window {}",
                        listener.name, listener.window
                    ),
                ));
            }
            requests.remove(index);
        }
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst) + 1;
        requests.push(RequestListener {
            id,
            name: listener.name,
            window: listener.window,
            domain: listener.domain,
            handler: listener.handler,
            error_handler: listener.error_handler,
            once: listener.once,
        });
        Ok(id)
    }

    pub fn remove_request_listener(&self, id: u64) -> bool {
        let mut requests = self.requests.lock();
        let before = requests.len();
        requests.retain(|l| l.id != id);
        requests.len() != before
    }

    /// Finds the first listener for `name` accepting `source`.
    pub fn find_request_listener(&self, name: &str, source: WindowId) -> Option<RequestListener> {
        self.requests
            .lock()
            .iter()
            .find(|l| l.name == name && l.window.matches(source))
            .cloned()
    }

    /// Claims `listener` for one invocation.
    ///
    /// A `once` listener leaves the table here, before its handler runs;
    /// false means another invocation already claimed it.
    pub fn claim_request_listener(&self, listener: &RequestListener) -> bool {
        !listener.once || self.remove_request_listener(listener.id)
    }

    #[cfg(test)]
    pub fn request_listener_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn clear_request_listeners(&self) {
        let drained: Vec<RequestListener> = self.requests.lock().drain(..).collect();
        drop(drained);
    }

    // Response table

    pub fn add_response_listener(&self, hash: &str, listener: ResponseListener) {
        self.responses.lock().insert(hash.to_string(), listener);
    }

    pub fn pending_status(&self, hash: &str) -> Option<PendingStatus> {
        self.responses.lock().get(hash).map(|listener| PendingStatus {
            name: listener.name.clone(),
            window: listener.window,
            acked_at: listener.acked_at,
        })
    }

    pub fn pending_count(&self) -> usize {
        self.responses.lock().len()
    }

    fn retire(&self, hash: &str) {
        self.retired.lock().insert(hash);
    }

    fn is_retired(&self, hash: &str) -> bool {
        self.retired.lock().contains(hash)
    }

    pub fn record_ack(&self, hash: &str, origin: &str, now: u64) -> AckOutcome {
        let mut responses = self.responses.lock();
        let Some(listener) = responses.get_mut(hash) else {
            drop(responses);
            return AckOutcome::Unknown {
                retired: self.is_retired(hash),
            };
        };
        if !listener.domain.matches(origin) {
            return AckOutcome::DomainMismatch {
                expected: listener.domain.to_string(),
            };
        }
        if listener.acked_at.is_none() {
            listener.acked_at = Some(now);
        }
        let Some(early) = listener.early.take() else {
            return AckOutcome::Acked { settle: None };
        };
        let listener = responses.remove(hash);
        drop(responses);
        self.retire(hash);
        let settle = listener.map(|listener| {
            (
                listener.settle,
                settle_with(early.source, early.origin, early.envelope),
            )
        });
        AckOutcome::Acked { settle }
    }

    pub fn record_response(
        &self,
        hash: &str,
        source: WindowId,
        origin: &str,
        envelope: Envelope,
    ) -> ResponseOutcome {
        let mut responses = self.responses.lock();
        let Some(listener) = responses.get_mut(hash) else {
            drop(responses);
            return ResponseOutcome::Unknown {
                retired: self.is_retired(hash),
            };
        };
        if listener.window != source {
            return ResponseOutcome::WrongSource {
                expected: listener.window,
            };
        }
        if !listener.domain.matches(origin) {
            let error = MessageError::domain_mismatch(format!(
                "Response origin {} does not match domain {}",
                origin, listener.domain
            ));
            let settle = listener.settle.clone();
            responses.remove(hash);
            drop(responses);
            self.retire(hash);
            return ResponseOutcome::Settle((settle, Err(error)));
        }
        if listener.acked_at.is_none() {
            listener.early = Some(EarlyResponse {
                source,
                origin: origin.to_string(),
                envelope,
            });
            return ResponseOutcome::Stashed;
        }
        let settle = listener.settle.clone();
        responses.remove(hash);
        drop(responses);
        self.retire(hash);
        ResponseOutcome::Settle((settle, settle_with(source, origin.to_string(), envelope)))
    }

    /// Removes the request `hash` and returns its Deferred with `error`.
    pub fn fail(&self, hash: &str, error: MessageError) -> Option<Settlement> {
        let listener = self.responses.lock().remove(hash)?;
        self.retire(hash);
        Some((listener.settle, Err(error)))
    }

    /// Removes every outstanding request.
    pub fn drain_pending(&self) -> Vec<(String, Deferred<MessageEvent>)> {
        let drained: Vec<(String, ResponseListener)> = self.responses.lock().drain().collect();
        drained
            .into_iter()
            .map(|(hash, listener)| {
                self.retire(&hash);
                (hash, listener.settle)
            })
            .collect()
    }

    // Receipt

    /// Returns true the first time `id` is seen.
    pub fn mark_seen(&self, id: &str) -> bool {
        self.seen.lock().insert(id)
    }

    // Readiness

    pub fn readiness(&self, win: WindowId) -> Deferred<()> {
        self.ready.lock().entry(win).or_default().clone()
    }

    pub fn mark_ready(&self, win: WindowId) -> bool {
        self.readiness(win).resolve(())
    }

    pub fn is_ready(&self, win: WindowId) -> bool {
        self.ready
            .lock()
            .get(&win)
            .map(|ready| !ready.is_pending())
            .unwrap_or(false)
    }
}
