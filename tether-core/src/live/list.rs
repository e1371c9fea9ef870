//! Live lists.
//!
//! A [`List`] is an ordered, id-indexed sequence of [`Record`]s. The index
//! and the sequence are one [`IndexMap`], so they cannot disagree: every id
//! appears at most once and lookup by id is constant time.

use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{Fields, Record, RecordId};
use crate::error::Error;
use crate::query::Compare;
use crate::reactive::{Computation, EntityId};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum ListEvent {
    /// Membership, order or a member's fields changed.
    Change,
    /// A member was removed.
    Delete(RecordId),
    Error(Error),
    Close,
}

/// The reconciler that owns a list.
pub(crate) trait ListOwner: Send + Sync {
    /// Build a member record for this list's tier.
    fn construct(&self, fields: Fields) -> Record;

    /// The consumer closed the list.
    fn close(&self);
}

struct Inner {
    id: EntityId,
    records: RwLock<IndexMap<RecordId, Record>>,
    error: RwLock<Option<Error>>,
    compare: Option<Compare>,
    computation: Option<Computation>,
    owner: RwLock<Option<Weak<dyn ListOwner>>>,
    events: broadcast::Sender<ListEvent>,
}

/// Handle to a live list. Clones share the same list.
#[derive(Clone)]
pub struct List {
    inner: Arc<Inner>,
}

impl List {
    /// A detached list.
    pub fn new(compare: Option<Compare>) -> Self {
        Self::attached(compare, None)
    }

    pub(crate) fn attached(compare: Option<Compare>, computation: Option<Computation>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                id: EntityId::new(),
                records: RwLock::new(IndexMap::new()),
                error: RwLock::new(None),
                compare,
                computation,
                owner: RwLock::new(None),
                events,
            }),
        }
    }

    pub(crate) fn bind(&self, owner: Weak<dyn ListOwner>) {
        *self.inner.owner.write() = Some(owner);
    }

    pub fn entity_id(&self) -> EntityId {
        self.inner.id
    }

    pub fn ptr_eq(&self, other: &List) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.inner.records.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.records.read().contains_key(id)
    }

    /// Position of `id` in the current order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.inner.records.read().get_index_of(id)
    }

    /// Members in order.
    pub fn records(&self) -> Vec<Record> {
        self.inner.records.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.inner.records.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.read().is_empty()
    }

    pub fn error(&self) -> Option<Error> {
        self.inner.error.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListEvent> {
        self.inner.events.subscribe()
    }

    /// Add a member built for this list's tier, then re-sort.
    ///
    /// If a member with the same id exists, the fields are merged into it
    /// and the existing record is returned.
    pub fn add(&self, fields: Fields) -> Record {
        let record = match self.owner() {
            Some(owner) => owner.construct(fields),
            None => Record::new(fields),
        };
        let member = self.push(record);
        self.onchange();
        member
    }

    /// Append `record` unless its id is already present. Returns the member
    /// now stored under that id.
    pub(crate) fn push(&self, record: Record) -> Record {
        let Some(id) = record.id() else {
            return record;
        };
        let mut records = self.inner.records.write();
        if let Some(existing) = records.get(&id) {
            if !existing.ptr_eq(&record) {
                existing.update_quiet(record.fields());
            }
            return existing.clone();
        }
        records.insert(id, record.clone());
        record
    }

    /// Put `record` back at `index`, clamped to the current length. An id
    /// already present is merged as in [`push`](Self::push).
    pub(crate) fn insert_at(&self, index: usize, record: Record) -> Record {
        let Some(id) = record.id() else {
            return record;
        };
        let mut records = self.inner.records.write();
        if let Some(existing) = records.get(&id) {
            if !existing.ptr_eq(&record) {
                existing.update_quiet(record.fields());
            }
            return existing.clone();
        }
        let index = index.min(records.len());
        records.shift_insert(index, id, record.clone());
        record
    }

    /// Replace all members, keeping the given order.
    pub(crate) fn replace(&self, members: Vec<Record>) {
        let mut records = IndexMap::with_capacity(members.len());
        for record in members {
            if let Some(id) = record.id() {
                records.entry(id).or_insert(record);
            }
        }
        *self.inner.records.write() = records;
    }

    /// Remove a member and mark it deleted.
    pub fn delete(&self, id: &str) -> Option<Record> {
        let record = self.inner.records.write().shift_remove(id)?;
        record.mark_deleted(true);
        self.emit(ListEvent::Delete(id.to_string()));
        Some(record)
    }

    /// Re-sort and announce a change, then signal out-of-band work.
    pub fn onchange(&self) {
        self.settle();
        if let Some(computation) = &self.inner.computation {
            computation.asynchronous();
        }
    }

    /// Re-sort and announce a change.
    pub(crate) fn settle(&self) {
        if let Some(compare) = &self.inner.compare {
            self.inner
                .records
                .write()
                .sort_by(|_, a, _, b| compare(a, b));
        }
        self.emit(ListEvent::Change);
    }

    pub(crate) fn set_error(&self, error: Error) {
        *self.inner.error.write() = Some(error.clone());
        self.emit(ListEvent::Error(error));
    }

    /// Release the list's remote subscription.
    pub fn close(&self) {
        self.emit(ListEvent::Close);
        if let Some(owner) = self.owner() {
            owner.close();
        }
    }

    fn owner(&self) -> Option<Arc<dyn ListOwner>> {
        self.inner.owner.read().as_ref().and_then(Weak::upgrade)
    }

    fn emit(&self, event: ListEvent) {
        let _ = self.inner.events.send(event);
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List")
            .field("ids", &self.ids())
            .field("error", &self.error())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{drain, Signal};
    use serde_json::{json, Value};

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("fields must be an object"),
        }
    }

    fn by_n() -> Compare {
        Arc::new(|a: &Record, b: &Record| {
            let n = |r: &Record| r.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            n(a).cmp(&n(b))
        })
    }

    #[test]
    fn add_and_lookup() {
        let list = List::new(None);
        let record = list.add(fields(json!({"id": "a", "n": 1})));

        assert_eq!(list.len(), 1);
        assert!(list.get("a").unwrap().ptr_eq(&record));
        assert_eq!(list.position("a"), Some(0));
        assert!(list.get("b").is_none());
    }

    #[test]
    fn add_existing_id_merges() {
        let list = List::new(None);
        let first = list.add(fields(json!({"id": "a", "n": 1})));
        let again = list.add(fields(json!({"id": "a", "n": 2})));

        assert_eq!(list.len(), 1);
        assert!(first.ptr_eq(&again));
        assert_eq!(first.get("n"), Some(json!(2)));
    }

    #[test]
    fn onchange_sorts() {
        let list = List::new(Some(by_n()));
        list.add(fields(json!({"id": "a", "n": 3})));
        list.add(fields(json!({"id": "b", "n": 1})));
        list.add(fields(json!({"id": "c", "n": 2})));
        assert_eq!(list.ids(), vec!["b", "c", "a"]);

        list.get("b").unwrap().update_quiet(fields(json!({"n": 9})));
        list.onchange();
        assert_eq!(list.ids(), vec!["c", "a", "b"]);
        assert_eq!(list.position("b"), Some(2));
    }

    #[test]
    fn delete_removes_and_marks() {
        let list = List::new(None);
        let record = list.add(fields(json!({"id": "a"})));
        let mut rx = list.subscribe();

        let removed = list.delete("a").unwrap();
        assert!(removed.ptr_eq(&record));
        assert!(record.is_deleted());
        assert!(list.is_empty());
        assert_eq!(rx.try_recv().unwrap(), ListEvent::Delete("a".into()));

        assert!(list.delete("a").is_none());
    }

    #[test]
    fn insert_at_restores_position() {
        let list = List::new(None);
        for id in ["a", "b", "c"] {
            list.add(fields(json!({ "id": id })));
        }
        let b = list.delete("b").unwrap();

        list.insert_at(1, b.clone());
        assert_eq!(list.ids(), vec!["a", "b", "c"]);
        assert!(list.get("b").unwrap().ptr_eq(&b));

        let z = Record::new(fields(json!({"id": "z"})));
        list.insert_at(99, z);
        assert_eq!(list.ids(), vec!["a", "b", "c", "z"]);
    }

    #[test]
    fn replace_keeps_order_and_dedups() {
        let list = List::new(None);
        list.replace(vec![
            Record::new(fields(json!({"id": "x"}))),
            Record::new(fields(json!({"id": "y"}))),
            Record::new(fields(json!({"id": "x", "dup": true}))),
            Record::new(fields(json!({"no": "id"}))),
        ]);
        assert_eq!(list.ids(), vec!["x", "y"]);
        assert_eq!(list.get("x").unwrap().get("dup"), None);
    }

    #[test]
    fn onchange_signals_async() {
        let computation = Computation::new();
        let mut rx = computation.subscribe();
        let list = List::attached(None, Some(computation));

        list.onchange();
        assert_eq!(drain(&mut rx), vec![Signal::Async]);

        list.settle();
        assert!(drain(&mut rx).is_empty());
    }
}
