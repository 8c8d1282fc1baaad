//! Browsing contexts and cross-window message delivery
//!
//! A [`Browser`] owns every window (top-level pages, iframes and popups), the
//! event loop they share, and the message channel between them. Code that
//! runs inside a window only reaches other windows through a
//! [`WindowProxy`], which enforces the same-origin policy on every property
//! that browsers protect.

use crate::same_origin::{Origin, OriginError, SameOriginPolicy, OPAQUE_ORIGIN, WILDCARD};
use async_runtime::EventLoop;
use core_types::{ErrorKind, MessageError};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

/// User agent used when none is given.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Handle to a window owned by a [`Browser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(u64);

impl WindowId {
    /// Returns the raw identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window#{}", self.0)
    }
}

/// Identifier of a registered message listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A message delivered to a window.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    /// The window that posted the message
    pub source: WindowId,
    /// Serialized origin of the poster, `"null"` for opaque origins
    pub origin: String,
    /// The posted payload
    pub data: Value,
}

/// Callback invoked for every message delivered to a window.
pub type MessageListener = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

/// Script run whenever a window loads a served URL.
pub type PageScript = Arc<dyn Fn(&Arc<Browser>, WindowId) + Send + Sync>;

/// A value a document publishes on its window object.
pub type GlobalValue = Arc<dyn Any + Send + Sync>;

/// An element of a window's document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    /// An iframe and the window it hosts
    Frame(WindowId),
    /// Any other element
    Other {
        /// Tag name
        tag: String,
    },
}

/// Errors raised when a window refuses access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// The same-origin policy blocked the access
    #[error(transparent)]
    CrossOrigin(#[from] OriginError),
    /// The window throws on every property access
    #[error("Permission denied to access property on {0}")]
    Faulted(WindowId),
    /// The window has been closed
    #[error("{0} is closed")]
    Closed(WindowId),
    /// No such window was ever opened
    #[error("{0} does not exist")]
    NoSuchWindow(WindowId),
}

impl From<AccessError> for MessageError {
    fn from(error: AccessError) -> Self {
        let kind = match error {
            AccessError::CrossOrigin(_) | AccessError::Faulted(_) => ErrorKind::SecurityError,
            AccessError::Closed(_) | AccessError::NoSuchWindow(_) => ErrorKind::InvalidTarget,
        };
        MessageError::new(kind, error.to_string())
    }
}

struct WindowRecord {
    url: String,
    origin: Option<Origin>,
    name: String,
    parent: Option<WindowId>,
    opener: Option<WindowId>,
    frames: Vec<WindowId>,
    closed: bool,
    access_fault: bool,
    document: u64,
    listeners: Vec<(ListenerId, MessageListener)>,
    globals: HashMap<String, GlobalValue>,
    elements: HashMap<String, Element>,
}

impl WindowRecord {
    fn event_origin(&self) -> String {
        self.origin
            .as_ref()
            .map(Origin::event_origin)
            .unwrap_or_else(|| OPAQUE_ORIGIN.to_string())
    }

    /// Discards everything owned by the current document.
    fn unload(&mut self) -> Vec<Box<dyn Any + Send>> {
        let mut released: Vec<Box<dyn Any + Send>> = Vec::new();
        released.extend(self.listeners.drain(..).map(|(_, l)| Box::new(l) as Box<dyn Any + Send>));
        released.extend(self.globals.drain().map(|(_, g)| Box::new(g) as Box<dyn Any + Send>));
        self.elements.clear();
        released
    }
}

#[derive(Default)]
struct BrowserState {
    next_window: u64,
    next_listener: u64,
    next_document: u64,
    windows: HashMap<WindowId, WindowRecord>,
    pages: Vec<(String, PageScript)>,
}

impl BrowserState {
    fn record(&self, win: WindowId) -> Result<&WindowRecord, AccessError> {
        self.windows.get(&win).ok_or(AccessError::NoSuchWindow(win))
    }

    fn open_record(&mut self, win: WindowId) -> Result<&mut WindowRecord, AccessError> {
        let record = self.windows.get_mut(&win).ok_or(AccessError::NoSuchWindow(win))?;
        if record.closed {
            return Err(AccessError::Closed(win));
        }
        Ok(record)
    }

    fn create(&mut self, url: &str, name: &str) -> WindowId {
        self.next_window += 1;
        self.next_document += 1;
        let id = WindowId(self.next_window);
        self.windows.insert(
            id,
            WindowRecord {
                url: url.to_string(),
                origin: Origin::parse(url).ok(),
                name: name.to_string(),
                parent: None,
                opener: None,
                frames: Vec::new(),
                closed: false,
                access_fault: false,
                document: self.next_document,
                listeners: Vec::new(),
                globals: HashMap::new(),
                elements: HashMap::new(),
            },
        );
        id
    }

    fn descendants(&self, win: WindowId) -> Vec<WindowId> {
        let mut found = vec![win];
        let mut index = 0;
        while index < found.len() {
            if let Some(record) = self.windows.get(&found[index]) {
                found.extend(record.frames.iter().copied());
            }
            index += 1;
        }
        found
    }
}

/// The simulated browser hosting every window.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use std::sync::{Arc, Mutex};
/// use web_platform::Browser;
///
/// let browser = Browser::new();
/// let merchant = browser.open_window("https://merchant.example/cart");
/// let frame = browser
///     .open_frame(merchant, "https://pay.example/button", "button")
///     .unwrap();
///
/// let received = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&received);
/// browser
///     .add_message_listener(frame, move |event| sink.lock().unwrap().push(event.origin.clone()))
///     .unwrap();
///
/// browser.post_message(merchant, frame, json!("hi"), "https://pay.example").unwrap();
/// browser.post_message(merchant, frame, json!("lost"), "https://elsewhere.example").unwrap();
/// browser.event_loop().run_until_idle();
///
/// assert_eq!(*received.lock().unwrap(), vec!["https://merchant.example".to_string()]);
/// ```
pub struct Browser {
    event_loop: EventLoop,
    user_agent: String,
    state: Mutex<BrowserState>,
    weak_self: Weak<Browser>,
}

impl fmt::Debug for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Browser")
            .field("user_agent", &self.user_agent)
            .field("windows", &self.state.lock().windows.len())
            .field("event_loop", &self.event_loop)
            .finish()
    }
}

impl Browser {
    /// Creates a browser with the default user agent.
    pub fn new() -> Arc<Self> {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    /// Creates a browser reporting `user_agent`.
    pub fn with_user_agent(user_agent: impl Into<String>) -> Arc<Self> {
        let user_agent = user_agent.into();
        Arc::new_cyclic(|weak_self| Self {
            event_loop: EventLoop::new(),
            user_agent,
            state: Mutex::new(BrowserState::default()),
            weak_self: weak_self.clone(),
        })
    }

    /// The event loop shared by every window.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// The user agent string.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Returns true for engines whose popups cannot receive messages
    /// from cross-domain openers.
    pub fn is_legacy_user_agent(&self) -> bool {
        static LEGACY: OnceLock<Option<Regex>> = OnceLock::new();
        LEGACY
            .get_or_init(|| Regex::new(r"MSIE|Trident|Edge/").ok())
            .as_ref()
            .map(|regex| regex.is_match(&self.user_agent))
            .unwrap_or(false)
    }

    /// Registers a page script run by every window that loads a URL starting
    /// with `url_prefix`.
    pub fn serve<F>(&self, url_prefix: impl Into<String>, script: F)
    where
        F: Fn(&Arc<Browser>, WindowId) + Send + Sync + 'static,
    {
        self.state.lock().pages.push((url_prefix.into(), Arc::new(script)));
    }

    /// Opens a top-level window.
    pub fn open_window(&self, url: &str) -> WindowId {
        let win = self.state.lock().create(url, "");
        tracing::debug!(window = %win, url, "opened window");
        self.load(win);
        win
    }

    /// Appends an iframe named `name` to `parent`'s document.
    ///
    /// The frame is also registered as the element `name`.
    pub fn open_frame(
        &self,
        parent: WindowId,
        url: &str,
        name: &str,
    ) -> Result<WindowId, AccessError> {
        let frame = {
            let mut state = self.state.lock();
            state.open_record(parent)?;
            let frame = state.create(url, name);
            if let Some(record) = state.windows.get_mut(&frame) {
                record.parent = Some(parent);
            }
            let record = state.open_record(parent)?;
            record.frames.push(frame);
            record.elements.insert(name.to_string(), Element::Frame(frame));
            frame
        };
        tracing::debug!(window = %frame, parent = %parent, url, name, "opened frame");
        self.load(frame);
        Ok(frame)
    }

    /// Opens a popup named `name` whose opener is `opener`.
    pub fn open_popup(
        &self,
        opener: WindowId,
        url: &str,
        name: &str,
    ) -> Result<WindowId, AccessError> {
        let popup = {
            let mut state = self.state.lock();
            state.open_record(opener)?;
            let popup = state.create(url, name);
            if let Some(record) = state.windows.get_mut(&popup) {
                record.opener = Some(opener);
            }
            popup
        };
        tracing::debug!(window = %popup, opener = %opener, url, name, "opened popup");
        self.load(popup);
        Ok(popup)
    }

    /// Loads a new document into `win`.
    ///
    /// Listeners, globals, elements and child frames of the old document are
    /// discarded; the window keeps its name and relationships.
    pub fn navigate(&self, win: WindowId, url: &str) -> Result<(), AccessError> {
        let released = {
            let mut state = self.state.lock();
            let frames = std::mem::take(&mut state.open_record(win)?.frames);
            let mut released = Vec::new();
            for frame in frames {
                released.extend(Self::close_locked(&mut state, frame));
            }
            state.next_document += 1;
            let document = state.next_document;
            let record = state.open_record(win)?;
            released.extend(record.unload());
            record.url = url.to_string();
            record.origin = Origin::parse(url).ok();
            record.document = document;
            released
        };
        drop(released);
        tracing::debug!(window = %win, url, "navigated");
        self.load(win);
        Ok(())
    }

    /// Closes `win` and every frame inside it.
    ///
    /// A closed iframe is also removed from its parent's document.
    pub fn close(&self, win: WindowId) {
        let released = {
            let mut state = self.state.lock();
            Self::close_locked(&mut state, win)
        };
        drop(released);
        tracing::debug!(window = %win, "closed");
    }

    fn close_locked(state: &mut BrowserState, win: WindowId) -> Vec<Box<dyn Any + Send>> {
        let mut released = Vec::new();
        for id in state.descendants(win) {
            if let Some(record) = state.windows.get_mut(&id) {
                record.closed = true;
                released.extend(record.unload());
            }
        }
        let parent = state.windows.get(&win).and_then(|record| record.parent);
        if let Some(parent) = parent.and_then(|p| state.windows.get_mut(&p)) {
            parent.frames.retain(|frame| *frame != win);
            parent
                .elements
                .retain(|_, element| *element != Element::Frame(win));
        }
        released
    }

    /// Returns true if `win` is closed or unknown.
    pub fn is_closed(&self, win: WindowId) -> bool {
        self.state.lock().windows.get(&win).map(|r| r.closed).unwrap_or(true)
    }

    /// The URL currently loaded in `win`.
    pub fn url(&self, win: WindowId) -> Option<String> {
        self.state.lock().windows.get(&win).map(|r| r.url.clone())
    }

    /// Makes every property access on `win` fail.
    pub fn set_access_fault(&self, win: WindowId, fault: bool) {
        if let Some(record) = self.state.lock().windows.get_mut(&win) {
            record.access_fault = fault;
        }
    }

    /// Adds a non-frame element to `win`'s document.
    pub fn add_element(
        &self,
        win: WindowId,
        element_id: &str,
        tag: &str,
    ) -> Result<(), AccessError> {
        let mut state = self.state.lock();
        state.open_record(win)?.elements.insert(
            element_id.to_string(),
            Element::Other {
                tag: tag.to_lowercase(),
            },
        );
        Ok(())
    }

    /// Publishes `value` as the global `key` of `win`'s document.
    pub fn expose(&self, win: WindowId, key: &str, value: GlobalValue) -> Result<(), AccessError> {
        let previous = {
            let mut state = self.state.lock();
            state.open_record(win)?.globals.insert(key.to_string(), value)
        };
        drop(previous);
        Ok(())
    }

    /// Removes the global `key` of `win`'s document.
    pub fn unexpose(&self, win: WindowId, key: &str) -> Option<GlobalValue> {
        let mut state = self.state.lock();
        state.windows.get_mut(&win)?.globals.remove(key)
    }

    /// Registers a message listener on `win`.
    pub fn add_message_listener<F>(
        &self,
        win: WindowId,
        listener: F,
    ) -> Result<ListenerId, AccessError>
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        state.next_listener += 1;
        let id = ListenerId(state.next_listener);
        state.open_record(win)?.listeners.push((id, Arc::new(listener)));
        Ok(id)
    }

    /// Removes a message listener. Returns false if it was not registered.
    pub fn remove_message_listener(&self, win: WindowId, id: ListenerId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let Some(record) = state.windows.get_mut(&win) else {
                return false;
            };
            let index = record.listeners.iter().position(|(listener, _)| *listener == id);
            index.map(|index| record.listeners.remove(index))
        };
        removed.is_some()
    }

    /// Queues delivery of `data` from `from` to `to`.
    ///
    /// The message is dropped at delivery time when `target_origin` is not
    /// `*` and does not match the origin of the document then loaded in `to`.
    pub fn post_message(
        &self,
        from: WindowId,
        to: WindowId,
        data: Value,
        target_origin: &str,
    ) -> Result<(), AccessError> {
        let origin = {
            let state = self.state.lock();
            let target = state.record(to)?;
            if target.access_fault {
                return Err(AccessError::Faulted(to));
            }
            if target.closed {
                return Err(AccessError::Closed(to));
            }
            state.record(from)?.event_origin()
        };
        let target_origin = if target_origin == WILDCARD {
            None
        } else {
            Some(Origin::parse(target_origin)?)
        };

        let browser = self.weak_self.clone();
        let event = MessageEvent {
            source: from,
            origin,
            data,
        };
        self.event_loop.spawn(move || {
            if let Some(browser) = browser.upgrade() {
                browser.deliver(to, event, target_origin);
            }
        });
        Ok(())
    }

    fn deliver(&self, to: WindowId, event: MessageEvent, target_origin: Option<Origin>) {
        let listeners: Vec<MessageListener> = {
            let state = self.state.lock();
            let Some(record) = state.windows.get(&to) else {
                return;
            };
            if record.closed {
                tracing::trace!(window = %to, "dropping message for closed window");
                return;
            }
            if let Some(expected) = &target_origin {
                let matches = record
                    .origin
                    .as_ref()
                    .map(|origin| origin.is_same_origin(expected))
                    .unwrap_or(false);
                if !matches {
                    tracing::trace!(
                        window = %to,
                        target_origin = %expected,
                        "dropping message for other origin"
                    );
                    return;
                }
            }
            record.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(&event);
        }
    }

    /// Returns a handle through which code running in `viewer` accesses
    /// `target`.
    pub fn proxy(&self, viewer: WindowId, target: WindowId) -> WindowProxy {
        WindowProxy {
            browser: self.weak_self.clone(),
            viewer,
            target,
        }
    }

    fn load(&self, win: WindowId) {
        let (url, document) = match self.state.lock().windows.get(&win) {
            Some(record) => (record.url.clone(), record.document),
            None => return,
        };
        let script = {
            let state = self.state.lock();
            state
                .pages
                .iter()
                .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, script)| Arc::clone(script))
        };
        let Some(script) = script else {
            return;
        };
        let browser = self.weak_self.clone();
        self.event_loop.spawn(move || {
            let Some(browser) = browser.upgrade() else {
                return;
            };
            let current = {
                let state = browser.state.lock();
                state
                    .windows
                    .get(&win)
                    .map(|record| !record.closed && record.document == document)
                    .unwrap_or(false)
            };
            if current {
                script(&browser, win);
            }
        });
    }
}

/// A viewer-bound reference to a window.
///
/// Structural properties (`closed`, `parent`, `top`, `opener`, `frames`) are
/// readable across origins. Document properties (`origin`, `url`, `name`,
/// globals, elements) require the viewer to be same-origin with the target.
#[derive(Clone)]
pub struct WindowProxy {
    browser: Weak<Browser>,
    viewer: WindowId,
    target: WindowId,
}

impl fmt::Debug for WindowProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowProxy")
            .field("viewer", &self.viewer)
            .field("target", &self.target)
            .finish()
    }
}

impl WindowProxy {
    /// The window this proxy points at.
    pub fn id(&self) -> WindowId {
        self.target
    }

    /// The window whose code holds this proxy.
    pub fn viewer(&self) -> WindowId {
        self.viewer
    }

    fn with_record<R>(
        &self,
        f: impl FnOnce(&BrowserState, &WindowRecord) -> R,
    ) -> Result<R, AccessError> {
        let browser = self.browser.upgrade().ok_or(AccessError::NoSuchWindow(self.target))?;
        let state = browser.state.lock();
        let record = state.record(self.target)?;
        if record.access_fault {
            return Err(AccessError::Faulted(self.target));
        }
        Ok(f(&state, record))
    }

    fn with_same_origin<R>(&self, f: impl FnOnce(&WindowRecord) -> R) -> Result<R, AccessError> {
        self.with_record(|state, record| {
            if self.viewer != self.target {
                let viewer = state.record(self.viewer)?;
                match (&viewer.origin, &record.origin) {
                    (Some(viewer), Some(target)) => {
                        SameOriginPolicy::new(viewer.clone()).check_access(target)?;
                    }
                    _ => {
                        return Err(AccessError::CrossOrigin(OriginError::CrossOriginDenied {
                            viewer: viewer.event_origin(),
                            target: record.event_origin(),
                        }))
                    }
                }
            }
            Ok(f(record))
        })?
    }

    /// Returns true once the window has been closed.
    pub fn closed(&self) -> Result<bool, AccessError> {
        self.with_record(|_, record| record.closed)
    }

    /// The window's parent, if it is an iframe.
    pub fn parent(&self) -> Result<Option<WindowId>, AccessError> {
        self.with_record(|_, record| record.parent)
    }

    /// The window that opened this popup.
    pub fn opener(&self) -> Result<Option<WindowId>, AccessError> {
        self.with_record(|_, record| record.opener)
    }

    /// The outermost window of the frame tree.
    pub fn top(&self) -> Result<WindowId, AccessError> {
        self.with_record(|state, record| {
            let mut top = self.target;
            let mut parent = record.parent;
            while let Some(next) = parent {
                top = next;
                parent = state.windows.get(&next).and_then(|r| r.parent);
            }
            top
        })
    }

    /// The window's open child frames, in document order.
    pub fn frames(&self) -> Result<Vec<WindowId>, AccessError> {
        self.with_record(|state, record| {
            record
                .frames
                .iter()
                .copied()
                .filter(|frame| state.windows.get(frame).map(|r| !r.closed).unwrap_or(false))
                .collect()
        })
    }

    /// The child frame named `name`.
    pub fn frame_named(&self, name: &str) -> Result<Option<WindowId>, AccessError> {
        self.with_record(|state, record| {
            record.frames.iter().copied().find(|frame| {
                state
                    .windows
                    .get(frame)
                    .map(|r| !r.closed && r.name == name)
                    .unwrap_or(false)
            })
        })
    }

    /// The window's origin; `None` for opaque documents.
    pub fn origin(&self) -> Result<Option<Origin>, AccessError> {
        self.with_same_origin(|record| record.origin.clone())
    }

    /// The URL of the loaded document.
    pub fn url(&self) -> Result<String, AccessError> {
        self.with_same_origin(|record| record.url.clone())
    }

    /// The window name.
    pub fn name(&self) -> Result<String, AccessError> {
        self.with_same_origin(|record| record.name.clone())
    }

    /// The global `key` published by the loaded document.
    pub fn global(&self, key: &str) -> Result<Option<GlobalValue>, AccessError> {
        self.with_same_origin(|record| record.globals.get(key).cloned())
    }

    /// The global `key`, if it holds a `T`.
    pub fn global_as<T>(&self, key: &str) -> Result<Option<Arc<T>>, AccessError>
    where
        T: Any + Send + Sync,
    {
        Ok(self.global(key)?.and_then(|value| value.downcast::<T>().ok()))
    }

    /// Looks up an element of the loaded document by id.
    pub fn element(&self, element_id: &str) -> Result<Option<Element>, AccessError> {
        self.with_same_origin(|record| record.elements.get(element_id).cloned())
    }

    /// Posts `data` to the window from the viewer.
    pub fn post_message(&self, data: Value, target_origin: &str) -> Result<(), AccessError> {
        let browser = self.browser.upgrade().ok_or(AccessError::NoSuchWindow(self.target))?;
        browser.post_message(self.viewer, self.target, data, target_origin)
    }
}
