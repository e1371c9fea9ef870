//! Tether Core
//!
//! This crate provides the client-side live-data layer for Tether. It
//! implements:
//!
//! - Live records and lists that converge with the server in place
//! - Reference-counted subscriptions driven by watch scopes
//! - A tiered cache per collection (plain, watch, sync)
//! - Optimistic creates and deletes routed into matching lists
//! - Transactional changesets with undo/redo
//!
//! The transport is not part of this crate: a collection talks to the
//! server through the [`Service`] and [`Channel`] traits.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: computation signals, watch scopes and subscriptions
//! - `live`: records, lists and their reconcilers
//! - `query`: query descriptors and local query matching
//! - `collection`: the tiered cache and optimistic routing
//! - `tracking`: changesets and undo history
//! - `relations`: has-many relations between collections
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{watch, Collection, Query};
//!
//! let posts = Collection::builder(service).build()?;
//!
//! // Everything read inside the scope stays subscribed while the
//! // watcher lives.
//! let watcher = watch(|| {
//!     let drafts = posts.find(Query::new().index("state").value("draft")).unwrap();
//!     render(&drafts);
//! });
//!
//! // Shows up in `drafts` immediately, confirmed by the server later.
//! posts.create(fields);
//!
//! drop(watcher);
//! ```

pub mod collection;
pub mod error;
pub mod live;
pub mod query;
pub mod reactive;
pub mod relations;
pub mod tracking;

pub use collection::{Collection, CollectionBuilder, Done, WeakCollection};
pub use error::{Error, Result};
pub use live::{
    Channel, ChannelEvent, DocumentFactory, FeedState, Fields, List, ListEvent, Operation, Record,
    RecordEvent, Response, Service, SyncDocument, Tier,
};
pub use query::{matchfind, Bound, Query, QueryKey};
pub use reactive::{try_watch, watch, Computation, Signal, Watcher};
pub use relations::Relation;
pub use tracking::Tracking;
