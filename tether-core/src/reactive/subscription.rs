//! Reference-counted subscriptions.
//!
//! Every live record or list is a [`Watched`] entity. Consumers never call
//! `start`/`stop` on an entity directly; they acquire a [`Subscription`],
//! and dropping it releases the reference. Only the 0 -> 1 transition starts
//! the entity and only the 1 -> 0 transition stops it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Unique identifier for a watched entity.
///
/// Used to deduplicate entities pushed into the same watch scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    /// Generate a new unique entity ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// A non-negative reference count.
#[derive(Debug, Default)]
pub struct References(Mutex<usize>);

impl References {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of references.
    pub fn count(&self) -> usize {
        *self.0.lock()
    }

    /// Add a reference and return the new count.
    fn increment(&self) -> usize {
        let mut count = self.0.lock();
        *count += 1;
        *count
    }

    /// Drop a reference. Returns `None` when the count was already zero.
    fn decrement(&self) -> Option<usize> {
        let mut count = self.0.lock();
        if *count == 0 {
            return None;
        }
        *count -= 1;
        Some(*count)
    }
}

/// An entity whose remote subscription is tied to its reference count.
pub trait Watched: Send + Sync {
    fn entity_id(&self) -> EntityId;

    fn references(&self) -> &References;

    /// Attach to the remote side. Must be idempotent.
    fn start(&self);

    /// Release the remote side. Must be idempotent.
    fn stop(&self);

    /// Add a reference, starting the entity on the 0 -> 1 transition.
    fn increment(&self) {
        if self.references().increment() == 1 {
            self.start();
        }
    }

    /// Drop a reference, stopping the entity on the 1 -> 0 transition.
    fn decrement(&self) {
        if self.references().decrement() == Some(0) {
            self.stop();
        }
    }
}

/// Handle to one reference on a watched entity.
///
/// Dropping this handle releases the reference.
pub struct Subscription {
    entity: Arc<dyn Watched>,
}

impl Subscription {
    /// Take a reference on `entity`.
    pub fn acquire(entity: Arc<dyn Watched>) -> Self {
        entity.increment();
        Self { entity }
    }

    pub fn entity(&self) -> &Arc<dyn Watched> {
        &self.entity
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.entity.decrement();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("entity", &self.entity.entity_id())
            .field("references", &self.entity.references().count())
            .finish()
    }
}
