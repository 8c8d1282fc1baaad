//! Core error types shared by the cross-window messaging components.
//!
//! Every fallible operation in the workspace, whether it settles a
//! [`Deferred`](../async_runtime/struct.Deferred.html) or returns a plain
//! `Result`, reports failures as a [`MessageError`] tagged with an
//! [`ErrorKind`].
//!
//! # Examples
//!
//! ```
//! use core_types::{ErrorKind, MessageError};
//!
//! let error = MessageError::new(ErrorKind::AckTimeout, "No ack for postMessage ping in 100ms");
//! assert_eq!(error.kind, ErrorKind::AckTimeout);
//! assert!(error.to_string().contains("AckTimeout"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod error;

pub use error::{ErrorKind, MessageError, MessageResult};
