//! Transactional changesets with linear undo/redo.
//!
//! While a changeset is active, local writes still apply immediately but
//! their upstream transmission is staged. The changeset then either
//! commits (transmit everything, append to history) or aborts (revert the
//! local effects silently).
//!
//! ```text
//! history:  [c0, c1, c2, c3]
//! cursor:         ^            (c0 and c1 applied, c2 and c3 undone)
//! ```
//!
//! The first push of a new changeset after some undos discards the undone
//! tail, so redo is only ever available for the most recent branch.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::live::{List, Record, RecordId};
use crate::reactive::EntityId;

/// Old and new value of a single field. `None` means absent.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Where a created or deleted record lives locally.
#[derive(Debug, Clone)]
pub struct Membership {
    pub record: Record,
    /// The list holding it, or `None` for a record cached on its own.
    pub list: Option<List>,
    /// Index within `list` when the change was staged.
    pub position: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Delete,
}

/// What a staged entry changed.
#[derive(Debug, Clone)]
pub enum ChangeData {
    Fields(IndexMap<String, FieldChange>),
    Collection {
        action: Action,
        id: RecordId,
        members: Vec<Membership>,
    },
}

impl ChangeData {
    pub fn field(key: impl Into<String>, old: Option<Value>, new: Option<Value>) -> Self {
        let mut changes = IndexMap::new();
        changes.insert(key.into(), FieldChange { old, new });
        ChangeData::Fields(changes)
    }

    /// Fold `other` into `self`, keeping each field's first old value and
    /// last new value. Returns false if the two cannot be merged.
    fn merge(&mut self, other: &ChangeData) -> bool {
        let (ChangeData::Fields(mine), ChangeData::Fields(theirs)) = (self, other) else {
            return false;
        };
        for (key, change) in theirs {
            match mine.get_mut(key) {
                Some(existing) => existing.new = change.new.clone(),
                None => {
                    mine.insert(key.clone(), change.clone());
                }
            }
        }
        true
    }
}

/// Something whose changes can be staged in a changeset.
pub trait Target: Send + Sync {
    fn target_id(&self) -> EntityId;

    /// Revert local effects without notifying anyone.
    fn abort(&self, data: &ChangeData);

    /// Notify listeners and transmit upstream.
    fn commit(&self, data: &ChangeData);

    /// Revert local effects, notify and transmit the compensating change.
    fn undo(&self, data: &ChangeData);

    /// Reapply local effects, notify and transmit.
    fn redo(&self, data: &ChangeData);
}

#[derive(Clone)]
struct Entry {
    target: Arc<dyn Target>,
    data: ChangeData,
}

/// An ordered group of staged changes.
#[derive(Clone, Default)]
pub struct Changeset {
    entries: Vec<Entry>,
    truncated: bool,
}

impl Changeset {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Changeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (e.target.target_id(), &e.data)))
            .finish()
    }
}

#[derive(Default)]
struct State {
    active: Option<Changeset>,
    history: Vec<Changeset>,
    /// Index of the last applied changeset.
    cursor: Option<usize>,
    suppressed: usize,
}

impl State {
    /// Drop undone changesets, leaving the cursor one step back.
    fn truncate(&mut self) {
        let len = self.history.len();
        let at_tail = match self.cursor {
            Some(i) => i + 1 >= len,
            None => len == 0,
        };
        if at_tail {
            return;
        }

        let keep = self.cursor.map_or(0, |i| i + 1);
        trace!(from = len, to = keep, "truncating undo history");
        self.history.truncate(keep);
        self.cursor = self.cursor.and_then(|i| i.checked_sub(1));
    }
}

/// Handle to a changeset history. Clones share the same history.
#[derive(Clone, Default)]
pub struct Tracking {
    state: Arc<Mutex<State>>,
}

impl Tracking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a changeset, aborting any that is already active.
    pub fn start(&self) {
        if self.is_active() {
            self.abort();
        }
        self.state.lock().active = Some(Changeset::default());
        debug!("changeset started");
    }

    /// True while a changeset is open and not suppressed.
    pub fn is_tracking(&self) -> bool {
        let state = self.state.lock();
        state.active.is_some() && state.suppressed == 0
    }

    /// True while a changeset is open.
    pub fn is_active(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Stage a change. Returns false, staging nothing, when not tracking.
    pub fn push(&self, target: Arc<dyn Target>, data: ChangeData) -> bool {
        let mut state = self.state.lock();
        if state.suppressed > 0 {
            return false;
        }

        let needs_truncate = match &state.active {
            None => return false,
            Some(changeset) => !changeset.truncated,
        };
        if needs_truncate {
            state.truncate();
        }

        let Some(changeset) = state.active.as_mut() else {
            return false;
        };
        changeset.truncated = true;

        let id = target.target_id();
        if let Some(entry) = changeset
            .entries
            .iter_mut()
            .find(|e| e.target.target_id() == id)
        {
            if entry.data.merge(&data) {
                return true;
            }
        }
        changeset.entries.push(Entry { target, data });
        true
    }

    /// Revert the active changeset and discard it.
    pub fn abort(&self) {
        let Some(changeset) = self.state.lock().active.take() else {
            return;
        };
        debug!(entries = changeset.len(), "changeset aborted");
        for entry in &changeset.entries {
            entry.target.abort(&entry.data);
        }
    }

    /// Transmit the active changeset and append it to history.
    pub fn commit(&self) {
        let changeset = {
            let mut state = self.state.lock();
            let Some(changeset) = state.active.take() else {
                return;
            };
            state.history.push(changeset.clone());
            state.cursor = Some(state.history.len() - 1);
            changeset
        };
        debug!(entries = changeset.len(), "changeset committed");
        for entry in &changeset.entries {
            entry.target.commit(&entry.data);
        }
    }

    /// Undo the changeset at the cursor. No-op while a changeset is active
    /// or when nothing is left to undo.
    pub fn undo(&self) -> bool {
        let changeset = {
            let mut state = self.state.lock();
            if state.active.is_some() {
                return false;
            }
            let Some(i) = state.cursor else {
                return false;
            };
            state.cursor = i.checked_sub(1);
            state.history[i].clone()
        };
        debug!(entries = changeset.len(), "undo");
        for entry in &changeset.entries {
            entry.target.undo(&entry.data);
        }
        true
    }

    /// Redo the changeset after the cursor.
    pub fn redo(&self) -> bool {
        let changeset = {
            let mut state = self.state.lock();
            if state.active.is_some() {
                return false;
            }
            let next = state.cursor.map_or(0, |i| i + 1);
            if next >= state.history.len() {
                return false;
            }
            state.cursor = Some(next);
            state.history[next].clone()
        };
        debug!(entries = changeset.len(), "redo");
        for entry in &changeset.entries {
            entry.target.redo(&entry.data);
        }
        true
    }

    pub fn has_previous(&self) -> bool {
        let state = self.state.lock();
        state.active.is_none() && state.cursor.is_some()
    }

    pub fn has_next(&self) -> bool {
        let state = self.state.lock();
        let next = state.cursor.map_or(0, |i| i + 1);
        state.active.is_none() && next < state.history.len()
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.state.lock().cursor
    }

    /// Run `f` with staging disabled; writes inside go straight upstream.
    pub fn suppressed<T>(&self, f: impl FnOnce() -> T) -> T {
        struct Resume<'a>(&'a Tracking);

        impl Drop for Resume<'_> {
            fn drop(&mut self) {
                let mut state = self.0.state.lock();
                state.suppressed = state.suppressed.saturating_sub(1);
            }
        }

        self.state.lock().suppressed += 1;
        let _resume = Resume(self);
        f()
    }
}

impl fmt::Debug for Tracking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Tracking")
            .field("active", &state.active.as_ref().map(Changeset::len))
            .field("history", &state.history.len())
            .field("cursor", &state.cursor)
            .finish()
    }
}
