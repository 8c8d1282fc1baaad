//! Cross-window messaging
//!
//! Request/response messaging between windows of one browser: a page, the
//! iframes it embeds and the popups it opens.
//!
//! - [`envelope`] - the wire format and its parser
//! - [`registry`] - pending requests and request handlers
//! - [`transport`] - direct and bridge-relayed delivery, tried together
//! - [`bridge`] - bridge frames and the tunnel handshake
//! - [`Messenger`] - `send`, `request`, `on` and `once` for one window
//!
//! Every request is acknowledged by the receiver before its response is
//! computed. A request settles exactly once: with the response, the
//! handler's error, or a timeout.
//!
//! # Examples
//!
//! ```
//! use serde_json::json;
//! use web_platform::Browser;
//! use window_messaging::{ErrorKind, ListenerOptions, Messenger, MessagingConfig, RequestOptions};
//!
//! let browser = Browser::new();
//! let page = browser.open_window("https://merchant.example");
//! let frame = browser.open_frame(page, "https://pay.example/card", "card").unwrap();
//! let config = MessagingConfig::default().with_ack_timeout(100);
//!
//! let merchant = Messenger::install(&browser, page, config.clone()).unwrap();
//! let card = Messenger::install(&browser, frame, config).unwrap();
//! card.on("total", ListenerOptions::default(), |event| {
//!     json!(event.data["items"].as_array().map(Vec::len))
//! })
//! .unwrap();
//!
//! let items = json!({ "items": [1, 2, 3] });
//! let total = merchant.request(RequestOptions::new(frame, "total").with_data(items));
//! let missing = merchant.request(RequestOptions::new(frame, "refund"));
//! browser.event_loop().run_until(1000, || !total.is_pending() && !missing.is_pending());
//!
//! assert_eq!(total.result().unwrap().unwrap().data, json!(3));
//! assert_eq!(missing.result().unwrap().unwrap_err().kind, ErrorKind::NoHandler);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
mod client;
pub mod config;
mod dispatcher;
pub mod envelope;
pub mod registry;
pub mod transport;

// Re-export main types
pub use bridge::{bridge_page, BridgeEndpoint, TunnelSink, BRIDGE_ENDPOINT_GLOBAL};
pub use client::{
    IntoReply, ListenerHandle, ListenerOptions, Messenger, OnceListener, Reply, RequestOptions,
    SendOptions, TargetWindow,
};
pub use config::{
    ConfigError, MessagingConfig, SendStrategies, BRIDGE_STRATEGY, POST_MESSAGE_STRATEGY,
};
pub use core_types::{ErrorKind, MessageError, MessageResult};
pub use envelope::{AckStatus, Envelope, MessageType};
pub use registry::{ErrorHandler, WindowMatch};
pub use transport::{SendReport, StrategyFailure, MOCK_STRATEGY};
