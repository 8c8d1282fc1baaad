//! Bridge frames and tunnels.
//!
//! When an opener and its cross-domain popup may not post to each other,
//! the opener loads a hidden frame from the popup's domain. The popup is
//! same-origin with that frame, so it can hand the frame a sink for inbound
//! messages; the frame relays between its parent and the popup:
//!
//! ```text
//! opener ──BRIDGE_TO_CHILD──▶ bridge frame ──sink──▶ popup
//! opener ◀─BRIDGE_TO_PARENT── bridge frame ◀─relay── popup
//! ```
//!
//! The opener only accepts a tunnel for a popup it registered, and only
//! when the popup's domain is the bridge frame's domain.

use crate::client::{Core, ListenerOptions, Messenger, RequestOptions};
use crate::config::MessagingConfig;
use crate::envelope::{
    self, BRIDGE_TO_CHILD_MESSAGE, BRIDGE_TO_PARENT_MESSAGE, OPEN_TUNNEL_MESSAGE, READY_MESSAGE,
};
use crate::registry::WindowMatch;
use async_runtime::Deferred;
use core_types::{ErrorKind, MessageError, MessageResult};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock, Weak};
use web_platform::{Browser, DomainMatcher, MessageEvent, Origin, WindowId};

/// Global under which a bridge page publishes its [`BridgeEndpoint`].
pub const BRIDGE_ENDPOINT_GLOBAL: &str = "__window_messaging_bridge__";

/// Receives messages tunneled to a popup: `(origin, raw message)`.
pub type TunnelSink = Arc<dyn Fn(&str, Value) + Send + Sync>;

type RemoteSend = Arc<dyn Fn(Value) -> MessageResult<()> + Send + Sync>;

/// Frame name of the bridge for `domain`.
///
/// # Examples
///
/// ```
/// use window_messaging::bridge::bridge_name;
///
/// assert_eq!(bridge_name("https://pay.example.com:8443"), "__bridge__https_pay_example_com_8443");
/// ```
pub fn bridge_name(domain: &str) -> String {
    static UNSAFE: OnceLock<Option<Regex>> = OnceLock::new();
    let sanitized = UNSAFE
        .get_or_init(|| Regex::new(r"[^a-zA-Z0-9]+").ok())
        .as_ref()
        .map(|regex| regex.replace_all(domain, "_").into_owned())
        .unwrap_or_else(|| domain.to_string());
    format!("__bridge__{}", sanitized)
}

fn domain_of(url: &str) -> MessageResult<String> {
    Origin::parse(url)
        .map(|origin| origin.serialize())
        .map_err(|error| {
            MessageError::invalid_target(format!("Can not derive domain from {}: {}", url, error))
        })
}

#[derive(Clone)]
struct BridgeRecord {
    frame: WindowId,
    ready: Deferred<WindowId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PopupRecord {
    window: WindowId,
    domain: String,
}

/// A window reachable only through a tunnel.
#[derive(Clone)]
pub(crate) struct RemoteWindow {
    pub domain: String,
    pub send: RemoteSend,
}

/// Bridge state of one messenger.
#[derive(Default)]
pub(crate) struct BridgeManager {
    bridges: Mutex<HashMap<String, BridgeRecord>>,
    popups: Mutex<HashMap<String, PopupRecord>>,
    remotes: Mutex<HashMap<WindowId, RemoteWindow>>,
    opener_tunnel: Mutex<Option<Deferred<()>>>,
}

impl BridgeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote_window(&self, win: WindowId) -> Option<RemoteWindow> {
        self.remotes.lock().get(&win).cloned()
    }

    fn register_remote(&self, win: WindowId, remote: RemoteWindow) {
        tracing::debug!(window = %win, domain = %remote.domain, "registered remote window");
        let previous = self.remotes.lock().insert(win, remote);
        drop(previous);
    }

    pub fn register_popup(&self, win: WindowId, name: &str, domain: &str) {
        self.popups.lock().insert(
            name.to_string(),
            PopupRecord {
                window: win,
                domain: domain.to_string(),
            },
        );
    }

    fn popup(&self, name: &str) -> Option<PopupRecord> {
        self.popups.lock().get(name).cloned()
    }

    fn bridge_frame(&self, domain: &str) -> Option<WindowId> {
        self.bridges.lock().get(domain).map(|record| record.frame)
    }

    pub fn bridge_frames(&self) -> Vec<WindowId> {
        self.bridges.lock().values().map(|record| record.frame).collect()
    }

    pub fn clear(&self) {
        let bridges = std::mem::take(&mut *self.bridges.lock());
        let remotes = std::mem::take(&mut *self.remotes.lock());
        self.popups.lock().clear();
        self.opener_tunnel.lock().take();
        drop(bridges);
        drop(remotes);
    }
}

impl Core {
    /// Returns true when talking to `domain` needs a bridge from this window.
    pub(crate) fn bridge_required(&self, domain: &str) -> bool {
        self.config.allowed_send_strategies.bridge
            && (self.browser.is_legacy_user_agent() || !self.config.allow_postmessage_popup)
            && domain != self.topology.own_domain()
    }

    pub(crate) fn open_bridge(
        self: &Arc<Self>,
        url: &str,
        domain: Option<&str>,
    ) -> Deferred<WindowId> {
        let domain = match domain {
            Some(domain) => domain.to_string(),
            None => match domain_of(url) {
                Ok(domain) => domain,
                Err(error) => return Deferred::rejected(error),
            },
        };
        if let Some(record) = self.bridges.bridges.lock().get(&domain) {
            return record.ready.clone();
        }

        let name = bridge_name(&domain);
        let frame = match self.browser.open_frame(self.window, url, &name) {
            Ok(frame) => frame,
            Err(error) => return Deferred::rejected(MessageError::bridge(error.to_string())),
        };
        tracing::debug!(%domain, url, window = %frame, "opening bridge");
        let ready = Deferred::new();
        self.bridges.bridges.lock().insert(
            domain.clone(),
            BridgeRecord {
                frame,
                ready: ready.clone(),
            },
        );

        let timeout = self.config.bridge_timeout;
        let url = url.to_string();
        let readiness = self.registry.readiness(frame);
        let loaded = self.browser.event_loop().timeout(&readiness, timeout, move || {
            MessageError::bridge(format!("Bridge did not load after {}ms: {}", timeout, url))
        });
        let core = Arc::clone(self);
        let settled = ready.clone();
        loaded.on_settled(move |result| match result {
            Ok(()) => {
                tracing::debug!(%domain, window = %frame, "bridge ready");
                settled.resolve(frame);
            }
            Err(error) => {
                tracing::warn!(%domain, %error, "bridge failed to load");
                let record = core.bridges.bridges.lock().remove(&domain);
                drop(record);
                core.browser.close(frame);
                settled.reject(error);
            }
        });
        ready
    }

    /// Handlers every messenger carries for the opener side of a tunnel.
    pub(crate) fn install_tunnel_handlers(self: &Arc<Self>) -> MessageResult<()> {
        let core = Arc::downgrade(self);
        let accept = move |event: MessageEvent| match core.upgrade() {
            Some(core) => core.accept_tunnel(&event).map(|_| Value::Null),
            None => Err(MessageError::new(ErrorKind::Destroyed, "Messenger destroyed")),
        };
        self.add_listener(OPEN_TUNNEL_MESSAGE, ListenerOptions::default(), accept)?;

        let core = Arc::downgrade(self);
        let relay = move |event: MessageEvent| match core.upgrade() {
            Some(core) => core.receive_from_tunnel(&event),
            None => Ok(()),
        };
        self.add_listener(BRIDGE_TO_PARENT_MESSAGE, ListenerOptions::default(), relay)?;
        Ok(())
    }

    /// Finds the popup named in a tunnel message from a bridge frame.
    fn tunneled_popup(&self, event: &MessageEvent) -> MessageResult<(String, PopupRecord)> {
        if self.bridges.bridge_frame(&event.origin) != Some(event.source) {
            return Err(MessageError::bridge(format!(
                "{} is not the bridge frame for {}",
                event.source, event.origin
            )));
        }
        let name = event
            .data
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| MessageError::missing_parameter("Expected tunnel window name"))?;
        let popup = self
            .bridges
            .popup(name)
            .ok_or_else(|| MessageError::bridge(format!("No window named {} was opened", name)))?;
        if popup.domain != event.origin {
            return Err(MessageError::bridge(format!(
                "Window {} is on {}, bridge is on {}",
                name, popup.domain, event.origin
            )));
        }
        Ok((name.to_string(), popup))
    }

    fn accept_tunnel(self: &Arc<Self>, event: &MessageEvent) -> MessageResult<()> {
        let (name, popup) = self.tunneled_popup(event)?;
        let frame = event.source;
        let core = Arc::downgrade(self);
        let bridge_domain = DomainMatcher::from(event.origin.as_str());
        let send: RemoteSend = Arc::new(move |message: Value| {
            let core = core
                .upgrade()
                .ok_or_else(|| MessageError::new(ErrorKind::Destroyed, "Messenger destroyed"))?;
            core.notify(
                frame,
                BRIDGE_TO_CHILD_MESSAGE,
                json!({ "name": name, "message": message }),
                &bridge_domain,
            )
            .map(|_| ())
        });
        self.bridges.register_remote(
            popup.window,
            RemoteWindow {
                domain: popup.domain,
                send,
            },
        );
        Ok(())
    }

    fn receive_from_tunnel(self: &Arc<Self>, event: &MessageEvent) -> MessageResult<()> {
        let (_, popup) = self.tunneled_popup(event)?;
        let raw = event.data.get("message").cloned().unwrap_or(Value::Null);
        let Some(message) = envelope::parse(&raw) else {
            tracing::trace!(
                window = %popup.window,
                "ignoring tunneled payload that is not a message"
            );
            return Ok(());
        };
        self.dispatch(popup.window, &popup.domain, message);
        Ok(())
    }

    /// Returns true when this window is a popup that can only reach its
    /// opener through a bridge.
    pub(crate) fn needs_opener_tunnel(&self) -> bool {
        let Some(opener) = self.topology.get_opener(self.window) else {
            return false;
        };
        self.config.allowed_send_strategies.bridge
            && (self.browser.is_legacy_user_agent() || !self.config.allow_postmessage_popup)
            && !self.topology.is_same_domain(opener)
    }

    /// Looks for the bridge frame the opener loaded for this window's
    /// domain and registers the opener as a remote window through it.
    pub(crate) fn open_tunnel_to_opener(self: &Arc<Self>) -> Deferred<()> {
        if let Some(pending) = self.bridges.opener_tunnel.lock().as_ref() {
            return pending.clone();
        }
        let Some(opener) = self.topology.get_opener(self.window) else {
            return Deferred::rejected(MessageError::invalid_target("Window has no opener"));
        };
        let tunnel = Deferred::new();
        *self.bridges.opener_tunnel.lock() = Some(tunnel.clone());

        let core = Arc::clone(self);
        let started = self.browser.event_loop().now();
        let found = tunnel.clone();
        let poll = self.config.bridge_poll_interval;
        self.browser.event_loop().set_interval(poll, move || {
            if !found.is_pending() {
                return ControlFlow::Break(());
            }
            if let Some(endpoint) = core.find_opener_endpoint(opener) {
                core.connect_through(opener, endpoint).forward_to(&found);
                return ControlFlow::Break(());
            }
            if core.browser.event_loop().now() - started >= core.config.bridge_timeout {
                found.reject(MessageError::bridge(format!(
                    "No bridge found for opener of {} in {}ms",
                    core.window, core.config.bridge_timeout
                )));
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });

        let core = Arc::clone(self);
        tunnel.on_settled(move |result| {
            if let Err(error) = result {
                tracing::warn!(window = %core.window, %error, "tunnel to opener failed");
                core.bridges.opener_tunnel.lock().take();
            }
        });
        tunnel
    }

    fn find_opener_endpoint(&self, opener: WindowId) -> Option<Arc<BridgeEndpoint>> {
        let frame = self
            .topology
            .proxy(opener)
            .frame_named(&bridge_name(&self.topology.own_domain()))
            .ok()
            .flatten()?;
        self.topology
            .proxy(frame)
            .global_as::<BridgeEndpoint>(BRIDGE_ENDPOINT_GLOBAL)
            .ok()
            .flatten()
    }

    fn connect_through(
        self: &Arc<Self>,
        opener: WindowId,
        endpoint: Arc<BridgeEndpoint>,
    ) -> Deferred<()> {
        let name = match self.topology.proxy(self.window).name() {
            Ok(name) if !name.is_empty() => name,
            _ => {
                return Deferred::rejected(MessageError::missing_parameter(
                    "Popup has no window name",
                ))
            }
        };

        let core = Arc::downgrade(self);
        let sink: TunnelSink = Arc::new(move |origin: &str, raw: Value| {
            let Some(core) = core.upgrade() else {
                return;
            };
            match envelope::parse(&raw) {
                Some(message) => core.dispatch(opener, origin, message),
                None => tracing::trace!(
                    window = %core.window,
                    "ignoring tunneled payload that is not a message"
                ),
            }
        });

        let core = Arc::clone(self);
        endpoint
            .open_tunnel_to_parent(&name, self.window, sink)
            .then(move |opener_domain| {
                let relay = Arc::clone(&endpoint);
                let tunnel_name = name.clone();
                core.bridges.register_remote(
                    opener,
                    RemoteWindow {
                        domain: opener_domain,
                        send: Arc::new(move |message: Value| {
                            relay.relay_to_parent(&tunnel_name, message)
                        }),
                    },
                );
                let announced =
                    core.notify(opener, READY_MESSAGE, Value::Null, &DomainMatcher::Any);
                if let Err(error) = announced {
                    tracing::debug!(%error, "ready through tunnel not delivered");
                }
                Ok(())
            })
    }
}

struct Tunnel {
    window: WindowId,
    sink: TunnelSink,
}

/// Relay published by a bridge page for same-origin popups.
pub struct BridgeEndpoint {
    core: Weak<Core>,
    tunnels: Mutex<HashMap<String, Tunnel>>,
}

impl BridgeEndpoint {
    fn core(&self) -> MessageResult<Arc<Core>> {
        self.core
            .upgrade()
            .ok_or_else(|| MessageError::new(ErrorKind::Destroyed, "Bridge messenger destroyed"))
    }

    fn parent(core: &Core) -> MessageResult<WindowId> {
        core.topology
            .get_parent(core.window)
            .ok_or_else(|| MessageError::invalid_target("Bridge frame has no parent"))
    }

    /// Asks the bridge's parent to accept a tunnel to the window `name`.
    ///
    /// Resolves with the parent's domain once accepted. Messages the parent
    /// sends to `name` are handed to `sink`.
    pub fn open_tunnel_to_parent(
        &self,
        name: &str,
        window: WindowId,
        sink: TunnelSink,
    ) -> Deferred<String> {
        let core = match self.core() {
            Ok(core) => core,
            Err(error) => return Deferred::rejected(error),
        };
        let parent = match Self::parent(&core) {
            Ok(parent) => parent,
            Err(error) => return Deferred::rejected(error),
        };
        self.tunnels
            .lock()
            .insert(name.to_string(), Tunnel { window, sink });
        tracing::debug!(name, window = %window, "opening tunnel to parent");

        let options =
            RequestOptions::new(parent, OPEN_TUNNEL_MESSAGE).with_data(json!({ "name": name }));
        core.request(options).then(|event| Ok(event.origin))
    }

    /// Forwards a popup's raw message to the bridge's parent.
    pub fn relay_to_parent(&self, name: &str, message: Value) -> MessageResult<()> {
        let core = self.core()?;
        let parent = Self::parent(&core)?;
        core.notify(
            parent,
            BRIDGE_TO_PARENT_MESSAGE,
            json!({ "name": name, "message": message }),
            &DomainMatcher::Any,
        )
        .map(|_| ())
    }

    fn deliver_to_child(&self, event: &MessageEvent) -> MessageResult<()> {
        let name = event
            .data
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| MessageError::missing_parameter("Expected tunnel window name"))?;
        let (window, sink) = {
            let tunnels = self.tunnels.lock();
            let tunnel = tunnels
                .get(name)
                .ok_or_else(|| MessageError::bridge(format!("No tunnel open for {}", name)))?;
            (tunnel.window, Arc::clone(&tunnel.sink))
        };
        let core = self.core()?;
        if core.topology.is_window_closed(window) {
            let tunnel = self.tunnels.lock().remove(name);
            drop(tunnel);
            return Err(MessageError::invalid_target(format!("Tunneled window {} is closed", name)));
        }
        sink(&event.origin, event.data.get("message").cloned().unwrap_or(Value::Null));
        Ok(())
    }
}

/// Page script for bridge frames.
///
/// Installs a messenger in the frame and publishes its [`BridgeEndpoint`].
///
/// # Examples
///
/// ```
/// use web_platform::Browser;
/// use window_messaging::{bridge, MessagingConfig};
///
/// let browser = Browser::new();
/// let page = bridge::bridge_page(MessagingConfig::default());
/// browser.serve("https://pay.example.com/bridge", page);
/// ```
pub fn bridge_page(
    config: MessagingConfig,
) -> impl Fn(&Arc<Browser>, WindowId) + Send + Sync + 'static {
    move |browser, win| {
        if let Err(error) = install_bridge(browser, win, config.clone()) {
            tracing::error!(window = %win, %error, "failed to install bridge");
        }
    }
}

fn install_bridge(
    browser: &Arc<Browser>,
    win: WindowId,
    config: MessagingConfig,
) -> MessageResult<()> {
    let messenger = Messenger::install(browser, win, config)?;
    let core = messenger.core();
    let endpoint = Arc::new(BridgeEndpoint {
        core: Arc::downgrade(core),
        tunnels: Mutex::new(HashMap::new()),
    });

    let parent = BridgeEndpoint::parent(core)?;
    let relay = Arc::downgrade(&endpoint);
    core.add_listener(
        BRIDGE_TO_CHILD_MESSAGE,
        ListenerOptions::default().window(WindowMatch::Window(parent)),
        move |event: MessageEvent| match relay.upgrade() {
            Some(endpoint) => endpoint.deliver_to_child(&event),
            None => Ok(()),
        },
    )?;
    browser.expose(win, BRIDGE_ENDPOINT_GLOBAL, endpoint)?;
    tracing::debug!(window = %win, "bridge installed");
    Ok(())
}
