//! Web platform model for cross-window messaging
//!
//! Implements the browsing contexts messaging code runs in: windows, iframes
//! and popups sharing one event loop, the cross-window message channel,
//! Same-Origin Policy checks on window properties, and topology queries over
//! window relationships.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod browser;
pub mod same_origin;
pub mod topology;

// Re-export main types
pub use browser::{
    AccessError, Browser, Element, GlobalValue, ListenerId, MessageEvent, MessageListener,
    PageScript, WindowId, WindowProxy, DEFAULT_USER_AGENT,
};
pub use same_origin::{
    DomainMatcher, Origin, OriginError, SameOriginPolicy, OPAQUE_ORIGIN, WILDCARD,
};
pub use topology::{Topology, WindowType};
