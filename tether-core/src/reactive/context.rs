//! Watch Context
//!
//! The watch context records which live entities a tracked function touches.
//! `Collection::get` and `Collection::find` call [`WatchContext::track`];
//! if a [`watch`](super::watch) scope is running the entity is collected,
//! otherwise the call is a no-op.
//!
//! # Implementation
//!
//! We use a thread-local stack of scopes. Entering a scope pushes a frame,
//! and the guard pops it when dropped, so the stack is restored even if the
//! tracked function panics. Frames only collect entities; nothing is
//! acquired until the scope has been popped.

use std::cell::RefCell;
use std::sync::Arc;

use smallvec::SmallVec;

use super::subscription::Watched;
use super::watcher::WatcherId;

/// Entities collected by one scope.
pub(crate) type Collected = SmallVec<[Arc<dyn Watched>; 4]>;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the watch context stack.
struct ContextEntry {
    watcher_id: WatcherId,
    entities: Collected,
}

/// Guard that pops the scope when dropped.
pub struct WatchContext {
    watcher_id: WatcherId,
    finished: bool,
}

impl WatchContext {
    /// Enter a new scope for the given watcher.
    pub(crate) fn enter(watcher_id: WatcherId) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                watcher_id,
                entities: SmallVec::new(),
            });
        });

        Self {
            watcher_id,
            finished: false,
        }
    }

    /// Check if there is an active scope.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// Get the watcher collecting into the innermost scope, if any.
    pub fn current_watcher() -> Option<WatcherId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().map(|entry| entry.watcher_id))
    }

    /// Record an entity in the innermost scope.
    ///
    /// An entity pushed twice into the same scope is only kept once.
    pub fn track(entity: Arc<dyn Watched>) {
        CONTEXT_STACK.with(|stack| {
            if let Some(entry) = stack.borrow_mut().last_mut() {
                let id = entity.entity_id();
                if !entry.entities.iter().any(|e| e.entity_id() == id) {
                    entry.entities.push(entity);
                }
            }
        });
    }

    /// Pop the scope and hand back what it collected.
    pub(crate) fn finish(mut self) -> Collected {
        self.finished = true;
        self.pop().map(|entry| entry.entities).unwrap_or_default()
    }

    fn pop(&self) -> Option<ContextEntry> {
        let popped = CONTEXT_STACK.with(|stack| stack.borrow_mut().pop());

        if let Some(entry) = &popped {
            debug_assert_eq!(
                entry.watcher_id, self.watcher_id,
                "WatchContext mismatch: expected {:?}, got {:?}",
                self.watcher_id, entry.watcher_id
            );
        }

        popped
    }
}

impl Drop for WatchContext {
    fn drop(&mut self) {
        if !self.finished {
            // Unwinding or early exit: discard the frame without acquiring.
            self.pop();
        }
    }
}
