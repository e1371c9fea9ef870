//! Reactive Plumbing
//!
//! This module ties the lifetime of remote subscriptions to the code that
//! reads live data.
//!
//! # Concepts
//!
//! ## Watched entities
//!
//! Records and lists returned by a collection are reference counted. The
//! first reference attaches them to a remote channel, the last release
//! closes the channel again.
//!
//! ## Watchers
//!
//! [`watch`] runs a function inside a scope. Every entity read through a
//! collection while the scope is open is collected, and once the function
//! returns the resulting [`Watcher`] takes one reference on each. Stopping
//! (or dropping) the watcher releases them.
//!
//! ## Computation bus
//!
//! Reconcilers emit [`Signal`]s on a [`Computation`] bus so a renderer
//! knows when a round of remote work started, settled, or changed state
//! out of band.
//!
//! # Implementation Notes
//!
//! The scope is a thread-local stack with RAII guards, so nested `watch`
//! calls collect independently and a panicking tracked function leaves no
//! scope behind.

mod computation;
mod context;
mod subscription;
mod watcher;

pub use computation::{drain, Computation, Signal};
pub use context::WatchContext;
pub use subscription::{EntityId, References, Subscription, Watched};
pub use watcher::{try_watch, watch, Watcher, WatcherId};
