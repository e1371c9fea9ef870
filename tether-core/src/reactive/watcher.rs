//! Watchers
//!
//! A [`Watcher`] owns one reference on every live entity a tracked function
//! touched. Independent `watch` calls yield independent watchers; an entity
//! shared by several watchers stays subscribed until the last one stops.
//!
//! ```rust,ignore
//! let mut watcher = watch(|| {
//!     let todo = todos.get("1", Tier::Watch);
//!     let open = todos.find(Query::new().index("done").value(false));
//! });
//!
//! // ... render while channel events arrive ...
//!
//! watcher.stop();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use super::context::{Collected, WatchContext};
use super::subscription::{EntityId, Subscription};

/// Unique identifier for a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

impl WatcherId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for WatcherId {
    fn default() -> Self {
        Self::new()
    }
}

/// The set of entities touched by one tracked function.
///
/// Dropping a running watcher stops it.
pub struct Watcher {
    id: WatcherId,
    entities: Collected,
    subscriptions: Vec<Subscription>,
    running: bool,
}

impl Watcher {
    fn new(id: WatcherId, entities: Collected) -> Self {
        Self {
            id,
            entities,
            subscriptions: Vec::new(),
            running: false,
        }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// Number of distinct entities collected.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Check whether the watcher holds the given entity.
    pub fn contains(&self, entity: EntityId) -> bool {
        self.entities.iter().any(|e| e.entity_id() == entity)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Take one reference on every collected entity. Idempotent.
    pub fn start(&mut self) {
        if self.running {
            return;
        }

        self.running = true;
        trace!(watcher = ?self.id, entities = self.entities.len(), "watcher start");
        self.subscriptions = self
            .entities
            .iter()
            .cloned()
            .map(Subscription::acquire)
            .collect();
    }

    /// Release every reference taken by [`start`](Self::start). Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }

        self.running = false;
        trace!(watcher = ?self.id, "watcher stop");
        self.subscriptions.clear();
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("entities", &self.entities.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Run `f` in a fresh watch scope and activate the resulting watcher.
///
/// If `f` panics the scope is unwound and nothing is acquired.
pub fn watch<F>(f: F) -> Watcher
where
    F: FnOnce(),
{
    let id = WatcherId::new();
    let ctx = WatchContext::enter(id);
    f();
    let mut watcher = Watcher::new(id, ctx.finish());
    watcher.start();
    watcher
}

/// Like [`watch`], for fallible tracked functions.
///
/// On `Err` the scope is discarded and no entity is acquired.
pub fn try_watch<T, E, F>(f: F) -> Result<(Watcher, T), E>
where
    F: FnOnce() -> Result<T, E>,
{
    let id = WatcherId::new();
    let ctx = WatchContext::enter(id);
    let value = f()?;
    let mut watcher = Watcher::new(id, ctx.finish());
    watcher.start();
    Ok((watcher, value))
}
