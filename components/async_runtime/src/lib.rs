//! Async runtime for cross-window messaging.
//!
//! This crate provides the asynchronous building blocks the messaging
//! components run on:
//! - [`Deferred`] - settle-once results with eager, ordered continuations
//! - [`EventLoop`] - single-threaded task and timer loop on a virtual clock
//! - [`on_possibly_unhandled`] - diagnostics for rejections nobody handled
//!
//! # Examples
//!
//! ## Event Loop Usage
//!
//! ```
//! use async_runtime::EventLoop;
//!
//! let event_loop = EventLoop::new();
//! let waited = event_loop.delay(250);
//! event_loop.advance(250);
//! assert_eq!(waited.result(), Some(Ok(())));
//! ```
//!
//! ## Deferred Usage
//!
//! ```
//! use async_runtime::{Deferred, MaybeDeferred};
//!
//! let pending: Deferred<u32> = Deferred::new();
//! let all = Deferred::all(vec![MaybeDeferred::Value(1), pending.clone().into()]);
//! assert!(all.is_pending());
//!
//! pending.resolve(2);
//! assert_eq!(all.result(), Some(Ok(vec![1, 2])));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod deferred;
pub mod event_loop;
pub mod task_queue;
mod unhandled;

// Re-export main types at crate root
pub use deferred::{Deferred, DeferredState, MaybeDeferred};
pub use event_loop::EventLoop;
pub use task_queue::{Task, TaskQueue, TimerId, TimerQueue};
pub use unhandled::{flush_possibly_unhandled, on_possibly_unhandled, UnhandledHandlerGuard};
