//! Error types for cross-window messaging.
//!
//! This module provides the error taxonomy shared by the deferred runtime,
//! the window model and the messaging client.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of messaging error.
///
/// Kinds are stable across the wire: an error RESPONSE carries the kind of
/// the remote failure so the caller can branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A required parameter (message name, target window) was absent
    MissingParameter,
    /// The target is unusable (element is not an iframe, window is closed)
    InvalidTarget,
    /// No listener is registered for an inbound REQUEST, ACK or RESPONSE
    NoHandler,
    /// The claimed origin does not match the expected domain
    DomainMismatch,
    /// No ACK arrived within the ack timeout
    AckTimeout,
    /// No RESPONSE arrived within the response timeout
    ResponseTimeout,
    /// Every allowed send strategy failed
    AllStrategiesFailed,
    /// The bridge frame did not load or the tunnel handshake was refused
    BridgeNegotiationFailed,
    /// A child window never announced readiness
    ReadyTimeout,
    /// The remote handler returned an error or panicked
    HandlerError,
    /// The host refused access to a cross-origin window property
    SecurityError,
    /// The messenger was destroyed while the operation was pending
    Destroyed,
    /// A request listener is already registered for the same name and window
    ListenerExists,
}

impl ErrorKind {
    /// Returns the stable name of the error kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingParameter => "MissingParameter",
            ErrorKind::InvalidTarget => "InvalidTarget",
            ErrorKind::NoHandler => "NoHandler",
            ErrorKind::DomainMismatch => "DomainMismatch",
            ErrorKind::AckTimeout => "AckTimeout",
            ErrorKind::ResponseTimeout => "ResponseTimeout",
            ErrorKind::AllStrategiesFailed => "AllStrategiesFailed",
            ErrorKind::BridgeNegotiationFailed => "BridgeNegotiationFailed",
            ErrorKind::ReadyTimeout => "ReadyTimeout",
            ErrorKind::HandlerError => "HandlerError",
            ErrorKind::SecurityError => "SecurityError",
            ErrorKind::Destroyed => "Destroyed",
            ErrorKind::ListenerExists => "ListenerExists",
        }
    }

    /// Returns true for the kinds produced by an expired timer.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ErrorKind::AckTimeout | ErrorKind::ResponseTimeout | ErrorKind::ReadyTimeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A messaging error with a kind, a human-readable message and optional
/// detail lines.
///
/// # Examples
///
/// ```
/// use core_types::{ErrorKind, MessageError};
///
/// let error = MessageError::new(ErrorKind::AllStrategiesFailed, "All send strategies failed")
///     .with_details(vec!["postMessage: Post message through popup disabled".to_string()]);
///
/// assert_eq!(error.details.len(), 1);
/// assert!(error.to_string().contains("postMessage"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}{}", render_details(.details))]
pub struct MessageError {
    /// The type of error
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Additional lines, one per underlying failure
    pub details: Vec<String>,
}

fn render_details(details: &[String]) -> String {
    if details.is_empty() {
        return String::new();
    }
    let mut rendered = String::from("\n");
    for line in details {
        rendered.push_str("\n  ");
        rendered.push_str(line);
    }
    rendered
}

impl MessageError {
    /// Creates a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Attaches detail lines to the error.
    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }

    /// Shorthand for [`ErrorKind::MissingParameter`].
    pub fn missing_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingParameter, message)
    }

    /// Shorthand for [`ErrorKind::InvalidTarget`].
    pub fn invalid_target(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTarget, message)
    }

    /// Shorthand for [`ErrorKind::NoHandler`].
    pub fn no_handler(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoHandler, message)
    }

    /// Shorthand for [`ErrorKind::DomainMismatch`].
    pub fn domain_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DomainMismatch, message)
    }

    /// Shorthand for [`ErrorKind::HandlerError`].
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerError, message)
    }

    /// Shorthand for [`ErrorKind::BridgeNegotiationFailed`].
    pub fn bridge(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BridgeNegotiationFailed, message)
    }
}

/// Result alias used across the messaging components.
pub type MessageResult<T> = Result<T, MessageError>;
