//! Client API.
//!
//! A [`Messenger`] is the messaging endpoint of one window. It is installed
//! once per window and lives as long as the document that installed it.

use crate::bridge::BridgeManager;
use crate::config::MessagingConfig;
use crate::envelope::{new_hash, Envelope, Stamp, READY_MESSAGE};
use crate::registry::{
    ErrorHandler, Handler, NewRequestListener, Registry, ResponseListener, WindowMatch,
};
use crate::transport::{self, Diagnostics, SendReport, StrategyFailure};
use async_runtime::Deferred;
use core_types::{ErrorKind, MessageError, MessageResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::ops::{ControlFlow, Deref};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use web_platform::{
    Browser, DomainMatcher, Element, ListenerId, MessageEvent, Origin, Topology, WindowId,
    OPAQUE_ORIGIN,
};

/// Global under which a window publishes its messenger.
pub(crate) const MESSENGER_GLOBAL: &str = "__window_messaging_messenger__";

/// The window a request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetWindow {
    /// A window handle
    Window(WindowId),
    /// The id of an iframe element in the sender's document
    Element(String),
}

impl From<WindowId> for TargetWindow {
    fn from(win: WindowId) -> Self {
        TargetWindow::Window(win)
    }
}

impl From<&str> for TargetWindow {
    fn from(element_id: &str) -> Self {
        TargetWindow::Element(element_id.to_string())
    }
}

impl From<String> for TargetWindow {
    fn from(element_id: String) -> Self {
        TargetWindow::Element(element_id)
    }
}

/// What a request handler produced.
#[derive(Debug, Clone)]
pub enum Reply {
    /// A value available now
    Value(Value),
    /// A value computed later
    Pending(Deferred<Value>),
}

/// Conversion of handler return values into a [`Reply`].
///
/// Handlers may return a JSON value, `()`, a `Deferred<Value>`, or a
/// `MessageResult` of any of those.
pub trait IntoReply {
    /// Converts into a reply, or the error to answer with.
    fn into_reply(self) -> MessageResult<Reply>;
}

impl IntoReply for Reply {
    fn into_reply(self) -> MessageResult<Reply> {
        Ok(self)
    }
}

impl IntoReply for Value {
    fn into_reply(self) -> MessageResult<Reply> {
        Ok(Reply::Value(self))
    }
}

impl IntoReply for () {
    fn into_reply(self) -> MessageResult<Reply> {
        Ok(Reply::Value(Value::Null))
    }
}

impl IntoReply for Deferred<Value> {
    fn into_reply(self) -> MessageResult<Reply> {
        Ok(Reply::Pending(self))
    }
}

impl<T: IntoReply> IntoReply for MessageResult<T> {
    fn into_reply(self) -> MessageResult<Reply> {
        self.and_then(IntoReply::into_reply)
    }
}

/// Options of [`Messenger::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Target window
    pub window: Option<TargetWindow>,
    /// Message name
    pub name: String,
    /// Payload
    pub data: Value,
    /// Domains the target may be on
    pub domain: DomainMatcher,
    /// Do not wait for ACK or RESPONSE
    pub fire_and_forget: bool,
    /// Milliseconds to wait for the RESPONSE once acked
    pub timeout: Option<u64>,
}

impl RequestOptions {
    /// A request named `name` to `window`.
    pub fn new(window: impl Into<TargetWindow>, name: &str) -> Self {
        Self {
            window: Some(window.into()),
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Sets the payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Restricts the domains the target may be on.
    pub fn with_domain(mut self, domain: impl Into<DomainMatcher>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Sets the response timeout.
    pub fn with_timeout(mut self, ms: u64) -> Self {
        self.timeout = Some(ms);
        self
    }

    /// Sends without waiting for ACK or RESPONSE.
    pub fn fire_and_forget(mut self) -> Self {
        self.fire_and_forget = true;
        self
    }
}

/// Options of [`Messenger::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Domains the target may be on
    pub domain: DomainMatcher,
    /// Do not wait for ACK or RESPONSE
    pub fire_and_forget: bool,
    /// Milliseconds to wait for the RESPONSE once acked
    pub timeout: Option<u64>,
}

impl SendOptions {
    /// Restricts the domains the target may be on.
    pub fn with_domain(mut self, domain: impl Into<DomainMatcher>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Sets the response timeout.
    pub fn with_timeout(mut self, ms: u64) -> Self {
        self.timeout = Some(ms);
        self
    }

    /// Sends without waiting for ACK or RESPONSE.
    pub fn fire_and_forget(mut self) -> Self {
        self.fire_and_forget = true;
        self
    }
}

/// Options of [`Messenger::on`] and [`Messenger::once`].
#[derive(Clone, Default)]
pub struct ListenerOptions {
    /// Windows whose requests are accepted
    pub window: WindowMatch,
    /// Domains whose requests are accepted
    pub domain: DomainMatcher,
    /// Replace an existing listener for the same name and window
    pub override_existing: bool,
    /// Told about every failure of the handler
    pub error_handler: Option<ErrorHandler>,
}

impl fmt::Debug for ListenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerOptions")
            .field("window", &self.window)
            .field("domain", &self.domain)
            .field("override_existing", &self.override_existing)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl ListenerOptions {
    /// Accepts requests from `window` only.
    pub fn window(mut self, window: impl Into<WindowMatch>) -> Self {
        self.window = window.into();
        self
    }

    /// Accepts requests from `domain` only.
    pub fn domain(mut self, domain: impl Into<DomainMatcher>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Replaces an existing listener instead of failing.
    pub fn override_existing(mut self) -> Self {
        self.override_existing = true;
        self
    }

    /// Calls `f` whenever the handler fails.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&MessageError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(f));
        self
    }
}

/// A registered request listener.
#[derive(Debug)]
pub struct ListenerHandle {
    core: Weak<Core>,
    id: u64,
    name: String,
}

impl ListenerHandle {
    /// The message name listened for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Removes the listener. Returns false if it was already gone.
    pub fn cancel(&self) -> bool {
        self.core
            .upgrade()
            .map(|core| core.registry.remove_request_listener(self.id))
            .unwrap_or(false)
    }
}

/// A listener that fires once, and the event it fired with.
#[derive(Debug)]
pub struct OnceListener {
    result: Deferred<MessageEvent>,
    handle: ListenerHandle,
}

impl OnceListener {
    /// Removes the listener if it has not fired yet.
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }
}

impl Deref for OnceListener {
    type Target = Deferred<MessageEvent>;

    fn deref(&self) -> &Self::Target {
        &self.result
    }
}

pub(crate) struct Core {
    pub(crate) browser: Arc<Browser>,
    pub(crate) window: WindowId,
    pub(crate) config: MessagingConfig,
    pub(crate) topology: Topology,
    pub(crate) stamp: Stamp,
    pub(crate) registry: Registry,
    pub(crate) bridges: BridgeManager,
    pub(crate) diagnostics: Diagnostics,
    listener: Mutex<Option<ListenerId>>,
    destroyed: AtomicBool,
}

impl Core {
    fn new(browser: &Arc<Browser>, window: WindowId, config: MessagingConfig) -> Self {
        let topology = Topology::new(Arc::clone(browser), window);
        let own = topology.proxy(window).origin().ok().flatten();
        let config = if own.as_ref().map(Origin::is_file).unwrap_or(false) {
            config.for_file_page()
        } else {
            config
        };
        let source_domain = match &own {
            Some(origin) if config.mock_mode => format!("mock://{}", origin.host),
            Some(origin) => origin.serialize(),
            None => OPAQUE_ORIGIN.to_string(),
        };
        let stamp = Stamp {
            source_domain,
            window_type: topology.get_window_type(window),
        };
        let diagnostics = Diagnostics::new(config.diagnostics_capacity);
        Self {
            browser: Arc::clone(browser),
            window,
            config,
            topology,
            stamp,
            registry: Registry::new(),
            bridges: BridgeManager::new(),
            diagnostics,
            listener: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn send_envelope(
        &self,
        target: WindowId,
        envelope: &Envelope,
        domain: &DomainMatcher,
    ) -> MessageResult<SendReport> {
        transport::send_message(self, target, envelope, domain)
    }

    /// Sends a fire-and-forget request right away.
    pub(crate) fn notify(
        &self,
        target: WindowId,
        name: &str,
        data: Value,
        domain: &DomainMatcher,
    ) -> MessageResult<SendReport> {
        let hash = new_hash(name);
        let envelope =
            Envelope::request(&self.stamp, name, &hash, data, &domain.to_string(), true);
        self.send_envelope(target, &envelope, domain)
    }

    pub(crate) fn add_listener<F, R>(
        &self,
        name: &str,
        options: ListenerOptions,
        handler: F,
    ) -> MessageResult<u64>
    where
        F: Fn(MessageEvent) -> R + Send + Sync + 'static,
        R: IntoReply,
    {
        let handler: Handler = Arc::new(move |event: MessageEvent| handler(event).into_reply());
        self.add_request_listener(name, options, handler, false)
    }

    fn add_request_listener(
        &self,
        name: &str,
        options: ListenerOptions,
        handler: Handler,
        once: bool,
    ) -> MessageResult<u64> {
        if name.is_empty() {
            return Err(MessageError::missing_parameter("Expected listener name"));
        }
        if self.is_destroyed() {
            return Err(destroyed_error());
        }
        let id = self.registry.add_request_listener(NewRequestListener {
            name: name.to_string(),
            window: options.window,
            domain: options.domain,
            handler,
            error_handler: options.error_handler,
            once,
            override_existing: options.override_existing,
        })?;
        tracing::debug!(name, window = %options.window, once, "listening");
        Ok(id)
    }

    fn install_ready_handler(self: &Arc<Self>) -> MessageResult<()> {
        let core = Arc::downgrade(self);
        self.add_listener(READY_MESSAGE, ListenerOptions::default(), move |event: MessageEvent| {
            if let Some(core) = core.upgrade() {
                core.on_ready(event.source);
            }
        })?;
        Ok(())
    }

    fn on_ready(&self, source: WindowId) {
        if self.registry.mark_ready(source) {
            tracing::debug!(window = %self.window, ready = %source, "window ready");
        }
        // The ancestor probes children it is waiting on.
        if self.topology.get_ancestor(self.window) == Some(source) {
            self.announce_ready_to(source);
        }
    }

    fn announce_ready_to(&self, target: WindowId) {
        if let Err(error) = self.notify(target, READY_MESSAGE, Value::Null, &DomainMatcher::Any) {
            tracing::debug!(window = %self.window, to = %target, %error, "ready not delivered");
        }
    }

    fn resolve_target(&self, target: &TargetWindow) -> MessageResult<WindowId> {
        let element_id = match target {
            TargetWindow::Window(win) => return Ok(*win),
            TargetWindow::Element(element_id) => element_id,
        };
        match self.topology.proxy(self.window).element(element_id)? {
            Some(Element::Frame(win)) => Ok(win),
            Some(Element::Other { tag }) => Err(MessageError::invalid_target(format!(
                "Expected element {} to be iframe, got {}",
                element_id, tag
            ))),
            None => Err(MessageError::invalid_target(format!(
                "Can not find element {}",
                element_id
            ))),
        }
    }

    pub(crate) fn request(self: &Arc<Self>, options: RequestOptions) -> Deferred<MessageEvent> {
        if self.is_destroyed() {
            return Deferred::rejected(destroyed_error());
        }
        if options.name.is_empty() {
            return Deferred::rejected(MessageError::missing_parameter("Expected options.name"));
        }
        let Some(target) = options.window.as_ref() else {
            return Deferred::rejected(MessageError::missing_parameter("Expected options.window"));
        };
        let target = match self.resolve_target(target) {
            Ok(target) => target,
            Err(error) => return Deferred::rejected(error),
        };
        if self.topology.is_window_closed(target) {
            return Deferred::rejected(MessageError::invalid_target(format!(
                "Target window is closed: {}",
                target
            )));
        }

        let hash = new_hash(&options.name);
        let output = Deferred::new();
        if !options.fire_and_forget {
            self.registry.add_response_listener(
                &hash,
                ResponseListener::new(
                    &options.name,
                    target,
                    options.domain.clone(),
                    output.clone(),
                ),
            );
        }
        tracing::debug!(name = %options.name, %hash, window = %target, "request");

        let core = Arc::clone(self);
        let settled = output.clone();
        self.await_ready(target).on_settled(move |ready| match ready {
            Ok(()) => core.deliver_request(target, hash, options, settled),
            Err(error) => core.fail_request(&hash, options.fire_and_forget, &settled, error),
        });
        output
    }

    /// Waits for a child window to announce itself.
    fn await_ready(&self, target: WindowId) -> Deferred<()> {
        if !self.topology.is_ancestor(self.window, target) || self.registry.is_ready(target) {
            return Deferred::resolved(());
        }
        self.announce_ready_to(target);
        let timeout = self.config.child_window_timeout;
        self.browser.event_loop().timeout(&self.registry.readiness(target), timeout, move || {
            MessageError::new(
                ErrorKind::ReadyTimeout,
                format!("Child window {} did not announce readiness in {}ms", target, timeout),
            )
        })
    }

    fn deliver_request(
        self: &Arc<Self>,
        target: WindowId,
        hash: String,
        options: RequestOptions,
        output: Deferred<MessageEvent>,
    ) {
        let domain = options.domain.to_string();
        let request = Envelope::request(
            &self.stamp,
            &options.name,
            &hash,
            options.data,
            &domain,
            options.fire_and_forget,
        );
        let report = match self.send_envelope(target, &request, &options.domain) {
            Ok(report) => report,
            Err(error) => return self.fail_request(&hash, options.fire_and_forget, &output, error),
        };
        tracing::debug!(
            name = %options.name,
            %hash,
            via = ?report.delivered_via,
            failed = report.failures.len(),
            "request sent"
        );

        if options.fire_and_forget {
            output.resolve(MessageEvent {
                source: target,
                origin: domain,
                data: Value::Null,
            });
            return;
        }

        let started = self.browser.event_loop().now();
        let response_timeout = options.timeout.or(self.config.response_timeout);
        let core = Arc::clone(self);
        self.browser
            .event_loop()
            .set_interval(self.config.ack_poll_interval, move || {
                core.poll_request(&hash, started, response_timeout)
            });
    }

    fn poll_request(
        &self,
        hash: &str,
        started: u64,
        response_timeout: Option<u64>,
    ) -> ControlFlow<()> {
        let Some(status) = self.registry.pending_status(hash) else {
            return ControlFlow::Break(());
        };
        let now = self.browser.event_loop().now();
        let error = if self.topology.is_window_closed(status.window) {
            let stage = if status.acked_at.is_some() { "response" } else { "ack" };
            MessageError::invalid_target(format!(
                "Window closed for {} before {}",
                status.name, stage
            ))
        } else {
            match (status.acked_at, response_timeout) {
                (None, _) if now.saturating_sub(started) >= self.config.ack_timeout => {
                    MessageError::new(
                        ErrorKind::AckTimeout,
                        format!(
                            "No ack for postMessage {} in {}ms",
                            status.name, self.config.ack_timeout
                        ),
                    )
                }
                (Some(acked), Some(timeout)) if now.saturating_sub(acked) >= timeout => {
                    MessageError::new(
                        ErrorKind::ResponseTimeout,
                        format!("No response for postMessage {} in {}ms", status.name, timeout),
                    )
                }
                _ => return ControlFlow::Continue(()),
            }
        };
        self.fail_pending(hash, error);
        ControlFlow::Break(())
    }

    fn fail_request(
        &self,
        hash: &str,
        fire_and_forget: bool,
        output: &Deferred<MessageEvent>,
        error: MessageError,
    ) {
        if fire_and_forget {
            tracing::warn!(hash, %error, "send failed");
            output.reject(error);
        } else {
            self.fail_pending(hash, error);
        }
    }

    fn fail_pending(&self, hash: &str, error: MessageError) {
        tracing::warn!(hash, %error, "request failed");
        if let Some((deferred, result)) = self.registry.fail(hash, error) {
            deferred.settle(result);
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.listener.lock().take() {
            self.browser.remove_message_listener(self.window, id);
        }
        self.registry.clear_request_listeners();
        for (hash, pending) in self.registry.drain_pending() {
            pending.reject(MessageError::new(
                ErrorKind::Destroyed,
                format!("Messenger destroyed before {} settled", hash),
            ));
        }
        for frame in self.bridges.bridge_frames() {
            self.browser.close(frame);
        }
        self.bridges.clear();
        let global = self.browser.unexpose(self.window, MESSENGER_GLOBAL);
        drop(global);
        tracing::debug!(window = %self.window, "messenger destroyed");
    }
}

fn destroyed_error() -> MessageError {
    MessageError::new(ErrorKind::Destroyed, "Messenger destroyed")
}

/// The messaging endpoint of one window.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use web_platform::Browser;
/// use window_messaging::{ListenerOptions, Messenger, MessagingConfig, SendOptions};
///
/// let browser = Browser::new();
/// let top = browser.open_window("https://merchant.example");
/// let parent = Messenger::install(&browser, top, MessagingConfig::default()).unwrap();
///
/// let frame = browser.open_frame(top, "https://pay.example/button", "button").unwrap();
/// let child = Messenger::install(&browser, frame, MessagingConfig::default()).unwrap();
/// child
///     .on("ping", ListenerOptions::default(), |event| json!({ "pong": event.data }))
///     .unwrap();
///
/// let reply = parent.send("button", "ping", json!(1), SendOptions::default());
/// browser.event_loop().run_until(1000, || !reply.is_pending());
/// assert_eq!(reply.result().unwrap().unwrap().data, json!({ "pong": 1 }));
/// ```
#[derive(Clone)]
pub struct Messenger {
    core: Arc<Core>,
}

impl fmt::Debug for Messenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Messenger")
            .field("window", &self.core.window)
            .field("domain", &self.core.stamp.source_domain)
            .field("destroyed", &self.core.is_destroyed())
            .finish()
    }
}

impl Messenger {
    /// Installs the messenger of `window`.
    ///
    /// Returns the existing messenger if the window already has one. The new
    /// messenger announces itself to its opener or parent, and a popup that
    /// can only reach its opener through a bridge starts looking for it.
    pub fn install(
        browser: &Arc<Browser>,
        window: WindowId,
        config: MessagingConfig,
    ) -> MessageResult<Messenger> {
        if let Some(existing) = Self::for_window(browser, window) {
            return Ok(existing);
        }
        let core = Arc::new(Core::new(browser, window, config));

        let receiver = Arc::downgrade(&core);
        let listener = browser.add_message_listener(window, move |event| {
            if let Some(core) = receiver.upgrade() {
                core.receive(event);
            }
        })?;
        *core.listener.lock() = Some(listener);
        browser.expose(window, MESSENGER_GLOBAL, core.clone())?;
        core.install_ready_handler()?;
        core.install_tunnel_handlers()?;
        tracing::debug!(
            window = %window,
            domain = %core.stamp.source_domain,
            window_type = ?core.stamp.window_type,
            "messenger installed"
        );

        if let Some(ancestor) = core.topology.get_ancestor(window) {
            core.announce_ready_to(ancestor);
        }
        if core.needs_opener_tunnel() {
            core.open_tunnel_to_opener();
        }
        Ok(Messenger { core })
    }

    /// The messenger installed in `window`, if any.
    pub fn for_window(browser: &Arc<Browser>, window: WindowId) -> Option<Messenger> {
        browser
            .proxy(window, window)
            .global_as::<Core>(MESSENGER_GLOBAL)
            .ok()
            .flatten()
            .filter(|core| !core.is_destroyed())
            .map(|core| Messenger { core })
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// The window this messenger belongs to.
    pub fn window(&self) -> WindowId {
        self.core.window
    }

    /// The effective configuration.
    pub fn config(&self) -> &MessagingConfig {
        &self.core.config
    }

    /// Topology queries from this window.
    pub fn topology(&self) -> &Topology {
        &self.core.topology
    }

    /// Sends a request and settles with the target's answer.
    ///
    /// The request is rejected with:
    /// - `MissingParameter` without a name or window
    /// - `InvalidTarget` for an element that is not an iframe, or a target
    ///   that closes before answering
    /// - `ReadyTimeout` when a child window never announces itself
    /// - `AllStrategiesFailed` when nothing could deliver it
    /// - `AckTimeout` or `ResponseTimeout` when the target goes quiet
    /// - the target handler's error
    pub fn request(&self, options: RequestOptions) -> Deferred<MessageEvent> {
        self.core.request(options)
    }

    /// Sends `name` with `data` to `target`.
    pub fn send(
        &self,
        target: impl Into<TargetWindow>,
        name: &str,
        data: Value,
        options: SendOptions,
    ) -> Deferred<MessageEvent> {
        self.core.request(RequestOptions {
            window: Some(target.into()),
            name: name.to_string(),
            data,
            domain: options.domain,
            fire_and_forget: options.fire_and_forget,
            timeout: options.timeout,
        })
    }

    /// Sends `name` with `data` to the opener or parent of this window.
    pub fn send_to_parent(
        &self,
        name: &str,
        data: Value,
        options: SendOptions,
    ) -> Deferred<MessageEvent> {
        match self.core.topology.get_ancestor(self.core.window) {
            Some(parent) => self.send(parent, name, data, options),
            None => {
                Deferred::rejected(MessageError::invalid_target("Window does not have a parent"))
            }
        }
    }

    /// Handles requests named `name`.
    pub fn on<F, R>(
        &self,
        name: &str,
        options: ListenerOptions,
        handler: F,
    ) -> MessageResult<ListenerHandle>
    where
        F: Fn(MessageEvent) -> R + Send + Sync + 'static,
        R: IntoReply,
    {
        let id = self.core.add_listener(name, options, handler)?;
        Ok(ListenerHandle {
            core: Arc::downgrade(&self.core),
            id,
            name: name.to_string(),
        })
    }

    /// Handles the next request named `name`.
    ///
    /// The returned listener dereferences to a Deferred that resolves with
    /// the request event.
    pub fn once<F, R>(
        &self,
        name: &str,
        options: ListenerOptions,
        handler: F,
    ) -> MessageResult<OnceListener>
    where
        F: Fn(MessageEvent) -> R + Send + Sync + 'static,
        R: IntoReply,
    {
        let result = Deferred::new();
        let fired = result.clone();
        let handler: Handler = Arc::new(move |event: MessageEvent| {
            let reply = handler(event.clone()).into_reply();
            fired.resolve(event);
            reply
        });
        let id = self.core.add_request_listener(name, options, handler, true)?;
        Ok(OnceListener {
            result,
            handle: ListenerHandle {
                core: Arc::downgrade(&self.core),
                id,
                name: name.to_string(),
            },
        })
    }

    /// Loads the bridge frame for `domain` from `url`.
    ///
    /// Resolves with the frame once it has announced itself; repeated calls
    /// for the same domain share one frame.
    pub fn open_bridge(&self, url: &str, domain: Option<&str>) -> Deferred<WindowId> {
        self.core.open_bridge(url, domain)
    }

    /// Returns true when messages to `domain` need a bridge.
    pub fn bridge_required(&self, url: &str, domain: Option<&str>) -> bool {
        let domain = match domain {
            Some(domain) => domain.to_string(),
            None => match Origin::parse(url) {
                Ok(origin) => origin.serialize(),
                Err(_) => return false,
            },
        };
        self.core.bridge_required(&domain)
    }

    /// Opens a popup named `name` that may tunnel back through a bridge.
    pub fn open_popup(&self, url: &str, name: &str) -> MessageResult<WindowId> {
        let domain = Origin::parse(url)
            .map(|origin| origin.serialize())
            .map_err(|error| MessageError::invalid_target(error.to_string()))?;
        let popup = self.core.browser.open_popup(self.core.window, url, name)?;
        self.core.bridges.register_popup(popup, name, &domain);
        Ok(popup)
    }

    /// Records a popup opened elsewhere so it may open a tunnel.
    pub fn register_popup(&self, window: WindowId, name: &str, domain: &str) {
        self.core.bridges.register_popup(window, name, domain);
    }

    /// Connects this popup to its opener through the opener's bridge frame.
    pub fn open_tunnel_to_opener(&self) -> Deferred<()> {
        self.core.open_tunnel_to_opener()
    }

    /// Returns true once `window` has announced itself.
    pub fn is_ready(&self, window: WindowId) -> bool {
        self.core.registry.is_ready(window)
    }

    /// Number of requests waiting for an answer.
    pub fn pending_requests(&self) -> usize {
        self.core.registry.pending_count()
    }

    /// Recent strategy failures, oldest first.
    pub fn diagnostics(&self) -> Vec<StrategyFailure> {
        self.core.diagnostics.snapshot()
    }

    /// Stops listening and rejects every pending request with `Destroyed`.
    pub fn destroy(&self) {
        self.core.destroy();
    }
}
