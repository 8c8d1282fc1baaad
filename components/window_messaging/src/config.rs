//! Messaging configuration.
//!
//! Keys use the option names a page sets on the messaging library
//! (`ACK_TIMEOUT`, `ALLOWED_SEND_STRATEGIES`, ...). Missing keys take the
//! defaults below.
//!
//! ```json
//! {
//!   "ACK_TIMEOUT": 1000,
//!   "BRIDGE_TIMEOUT": 5000,
//!   "ALLOW_POSTMESSAGE_POPUP": false,
//!   "ALLOWED_SEND_STRATEGIES": { "postMessage": true, "bridge": true },
//!   "MOCK_MODE": false
//! }
//! ```

use serde::{Deserialize, Serialize};

/// Name of the direct cross-window send strategy.
pub const POST_MESSAGE_STRATEGY: &str = "postMessage";

/// Name of the bridge-relayed send strategy.
pub const BRIDGE_STRATEGY: &str = "bridge";

/// Errors raised while loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document is not valid JSON or has a mistyped key
    #[error("invalid messaging configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which send strategies may be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendStrategies {
    /// Direct delivery through the window message channel
    #[serde(rename = "postMessage", default = "config_defaults::enabled")]
    pub post_message: bool,
    /// Delivery relayed through a bridge frame
    #[serde(rename = "bridge", default = "config_defaults::enabled")]
    pub bridge: bool,
}

impl Default for SendStrategies {
    fn default() -> Self {
        Self {
            post_message: true,
            bridge: true,
        }
    }
}

impl SendStrategies {
    /// Returns true if the strategy named `name` is enabled.
    pub fn allows(&self, name: &str) -> bool {
        match name {
            POST_MESSAGE_STRATEGY => self.post_message,
            BRIDGE_STRATEGY => self.bridge,
            _ => false,
        }
    }
}

/// Configuration of one window's messenger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct MessagingConfig {
    /// Milliseconds a request waits for its ACK
    #[serde(default = "config_defaults::ack_timeout")]
    pub ack_timeout: u64,
    /// Milliseconds a bridge frame has to load and announce itself
    #[serde(default = "config_defaults::bridge_timeout")]
    pub bridge_timeout: u64,
    /// Allow direct delivery between windows of different frame trees
    #[serde(default = "config_defaults::enabled")]
    pub allow_postmessage_popup: bool,
    /// Strategies `send` may attempt
    #[serde(default)]
    pub allowed_send_strategies: SendStrategies,
    /// Route every send straight through the in-page channel
    #[serde(default)]
    pub mock_mode: bool,
    /// Milliseconds a request waits for a child window to announce itself
    #[serde(default = "config_defaults::child_window_timeout")]
    pub child_window_timeout: u64,
    /// Period of the ACK and RESPONSE poll
    #[serde(default = "config_defaults::poll_interval")]
    pub ack_poll_interval: u64,
    /// Milliseconds a request waits for its RESPONSE after the ACK
    #[serde(default)]
    pub response_timeout: Option<u64>,
    /// Period of the popup's search for its opener's bridge frame
    #[serde(default = "config_defaults::poll_interval")]
    pub bridge_poll_interval: u64,
    /// Number of strategy failures kept for diagnostics
    #[serde(default = "config_defaults::diagnostics_capacity")]
    pub diagnostics_capacity: usize,
}

mod config_defaults {
    pub fn ack_timeout() -> u64 {
        1000
    }

    pub fn bridge_timeout() -> u64 {
        5000
    }

    pub fn child_window_timeout() -> u64 {
        5000
    }

    pub fn poll_interval() -> u64 {
        50
    }

    pub fn diagnostics_capacity() -> usize {
        64
    }

    pub fn enabled() -> bool {
        true
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            ack_timeout: config_defaults::ack_timeout(),
            bridge_timeout: config_defaults::bridge_timeout(),
            allow_postmessage_popup: true,
            allowed_send_strategies: SendStrategies::default(),
            mock_mode: false,
            child_window_timeout: config_defaults::child_window_timeout(),
            ack_poll_interval: config_defaults::poll_interval(),
            response_timeout: None,
            bridge_poll_interval: config_defaults::poll_interval(),
            diagnostics_capacity: config_defaults::diagnostics_capacity(),
        }
    }
}

impl MessagingConfig {
    /// Parses a JSON configuration document.
    ///
    /// # Examples
    ///
    /// ```
    /// use window_messaging::MessagingConfig;
    ///
    /// let config = MessagingConfig::from_json_str(r#"{"ACK_TIMEOUT": 100}"#).unwrap();
    /// assert_eq!(config.ack_timeout, 100);
    /// assert_eq!(config.bridge_timeout, 5000);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets the ACK timeout.
    pub fn with_ack_timeout(mut self, ms: u64) -> Self {
        self.ack_timeout = ms;
        self
    }

    /// Sets the bridge timeout.
    pub fn with_bridge_timeout(mut self, ms: u64) -> Self {
        self.bridge_timeout = ms;
        self
    }

    /// Allows or forbids direct delivery across frame trees.
    pub fn with_allow_postmessage_popup(mut self, allow: bool) -> Self {
        self.allow_postmessage_popup = allow;
        self
    }

    /// Enables or disables individual strategies.
    pub fn with_send_strategies(mut self, post_message: bool, bridge: bool) -> Self {
        self.allowed_send_strategies = SendStrategies {
            post_message,
            bridge,
        };
        self
    }

    /// Turns mock mode on or off.
    pub fn with_mock_mode(mut self, mock: bool) -> Self {
        self.mock_mode = mock;
        self
    }

    /// Sets the child readiness timeout.
    pub fn with_child_window_timeout(mut self, ms: u64) -> Self {
        self.child_window_timeout = ms;
        self
    }

    /// Sets the default response timeout.
    pub fn with_response_timeout(mut self, ms: Option<u64>) -> Self {
        self.response_timeout = ms;
        self
    }

    /// Relaxes settings that cannot hold for a page loaded from `file://`.
    pub(crate) fn for_file_page(mut self) -> Self {
        self.allow_postmessage_popup = true;
        self
    }
}
