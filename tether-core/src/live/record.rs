//! Live records.
//!
//! A [`Record`] is a field map with stable identity. Remote events merge
//! into it quietly (the reconciler announces them with a `Change` event);
//! local writes through [`Record::set`] and [`Record::update`] announce a
//! `LocalChange` and are sent upstream, or staged in the active changeset
//! when tracking is on.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use super::{fields_key, Fields, RecordId};
use crate::error::{Error, Result};
use crate::live::List;
use crate::query::Query;
use crate::reactive::EntityId;
use crate::relations::Relation;
use crate::tracking::{ChangeData, FieldChange, Target, Tracking};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    /// A local write was applied.
    LocalChange,
    /// A remote change was merged.
    Change,
    Delete,
    Error(Error),
    Close,
}

/// A named function callable on every record of a collection.
pub type Method = Arc<dyn Fn(&Record, Value) -> Value + Send + Sync>;

/// Methods and relations shared by all records of a collection.
#[derive(Default)]
pub struct Extensions {
    methods: RwLock<HashMap<String, Method>>,
    relations: RwLock<HashMap<String, Relation>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_method(&self, name: impl Into<String>, method: Method) {
        self.methods.write().insert(name.into(), method);
    }

    pub fn define_relation(&self, name: impl Into<String>, relation: Relation) {
        self.relations.write().insert(name.into(), relation);
    }

    fn method(&self, name: &str) -> Option<Method> {
        self.methods.read().get(name).cloned()
    }

    fn relation(&self, name: &str) -> Option<Relation> {
        self.relations.read().get(name).cloned()
    }
}

/// The reconciler a record reports local writes to.
pub(crate) trait Upstream: Send + Sync {
    /// Transmit the record's current state.
    fn push(&self, record: &Record);

    /// The consumer closed the record.
    fn close(&self, record: &Record);
}

#[derive(Default)]
struct State {
    fields: Fields,
    deleted: bool,
    error: Option<Error>,
}

struct Inner {
    id: EntityId,
    state: RwLock<State>,
    upstream: RwLock<Option<Weak<dyn Upstream>>>,
    tracking: Option<Tracking>,
    extensions: Option<Arc<Extensions>>,
    events: broadcast::Sender<RecordEvent>,
}

/// Handle to a live record. Clones share the same record.
#[derive(Clone)]
pub struct Record {
    inner: Arc<Inner>,
}

impl Record {
    /// A detached record: writes only notify local listeners.
    pub fn new(fields: Fields) -> Self {
        Self::attached(fields, None, None)
    }

    pub(crate) fn attached(
        fields: Fields,
        tracking: Option<Tracking>,
        extensions: Option<Arc<Extensions>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                id: EntityId::new(),
                state: RwLock::new(State {
                    fields,
                    ..State::default()
                }),
                upstream: RwLock::new(None),
                tracking,
                extensions,
                events,
            }),
        }
    }

    pub(crate) fn bind(&self, upstream: Weak<dyn Upstream>) {
        *self.inner.upstream.write() = Some(upstream);
    }

    /// Unique per record object, not per server id.
    pub fn entity_id(&self) -> EntityId {
        self.inner.id
    }

    /// True when both handles point at the same record.
    pub fn ptr_eq(&self, other: &Record) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The server id, stringified.
    pub fn id(&self) -> Option<RecordId> {
        fields_key(&self.inner.state.read().fields)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.state.read().fields.get(key).cloned()
    }

    /// A snapshot of all fields.
    pub fn fields(&self) -> Fields {
        self.inner.state.read().fields.clone()
    }

    /// The fields as a JSON object.
    pub fn serialize(&self) -> Value {
        Value::Object(self.fields())
    }

    /// Swap in a whole field map, silently.
    pub(crate) fn replace_fields(&self, fields: Fields) {
        self.inner.state.write().fields = fields;
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.state.read().deleted
    }

    /// The last error reported for this record.
    pub fn error(&self) -> Option<Error> {
        self.inner.state.read().error.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.inner.events.subscribe()
    }

    /// Write one field.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        let old = self
            .inner
            .state
            .write()
            .fields
            .insert(key.clone(), value.clone());
        self.written(ChangeData::field(key, old, Some(value)));
    }

    /// Merge a patch into the fields.
    pub fn update(&self, patch: Fields) {
        let mut changes = IndexMap::new();
        {
            let mut state = self.inner.state.write();
            for (key, value) in patch {
                let old = state.fields.insert(key.clone(), value.clone());
                let new = Some(value);
                changes.insert(key, FieldChange { old, new });
            }
        }
        if !changes.is_empty() {
            self.written(ChangeData::Fields(changes));
        }
    }

    /// Merge a patch without notifying or transmitting anything.
    pub(crate) fn update_quiet(&self, patch: Fields) {
        let mut state = self.inner.state.write();
        for (key, value) in patch {
            state.fields.insert(key, value);
        }
    }

    fn written(&self, data: ChangeData) {
        if let Some(tracking) = &self.inner.tracking {
            if tracking.push(Arc::new(self.clone()), data) {
                trace!(record = ?self.id(), "write staged");
                return;
            }
        }
        self.local_change();
    }

    /// Announce a local write and send it upstream.
    fn local_change(&self) {
        self.emit(RecordEvent::LocalChange);
        if let Some(upstream) = self.upstream() {
            upstream.push(self);
        }
    }

    /// Announce a merged remote change.
    pub(crate) fn changed(&self) {
        self.emit(RecordEvent::Change);
    }

    pub(crate) fn mark_deleted(&self, deleted: bool) {
        let was = std::mem::replace(&mut self.inner.state.write().deleted, deleted);
        if deleted && !was {
            self.emit(RecordEvent::Delete);
        }
    }

    pub(crate) fn set_error(&self, error: Error) {
        self.inner.state.write().error = Some(error.clone());
        self.emit(RecordEvent::Error(error));
    }

    /// Release the record's remote subscription.
    pub fn close(&self) {
        self.emit(RecordEvent::Close);
        if let Some(upstream) = self.upstream() {
            upstream.close(self);
        }
    }

    /// Invoke a collection method with this record as receiver.
    pub fn call(&self, name: &str, args: Value) -> Result<Value> {
        let method = self
            .inner
            .extensions
            .as_ref()
            .and_then(|ext| ext.method(name))
            .ok_or_else(|| Error::UnknownMethod(name.to_string()))?;
        Ok(method(self, args))
    }

    /// Resolve a relation into a live list.
    pub fn related(&self, name: &str, query: Query) -> Result<List> {
        let relation = self
            .inner
            .extensions
            .as_ref()
            .and_then(|ext| ext.relation(name))
            .ok_or_else(|| Error::UnknownRelation(name.to_string()))?;
        relation.resolve(self, query)
    }

    fn upstream(&self) -> Option<Arc<dyn Upstream>> {
        self.inner.upstream.read().as_ref().and_then(Weak::upgrade)
    }

    fn emit(&self, event: RecordEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Put each field back to one side of a change.
    fn restore(&self, data: &ChangeData, take_new: bool) {
        let ChangeData::Fields(changes) = data else {
            return;
        };
        let mut state = self.inner.state.write();
        for (key, change) in changes {
            let value = if take_new { &change.new } else { &change.old };
            match value {
                Some(value) => state.fields.insert(key.clone(), value.clone()),
                None => state.fields.remove(key),
            };
        }
    }
}

impl Target for Record {
    fn target_id(&self) -> EntityId {
        self.inner.id
    }

    fn abort(&self, data: &ChangeData) {
        self.restore(data, false);
    }

    fn commit(&self, _data: &ChangeData) {
        self.local_change();
    }

    fn undo(&self, data: &ChangeData) {
        self.restore(data, false);
        self.local_change();
    }

    fn redo(&self, data: &ChangeData) {
        self.restore(data, true);
        self.local_change();
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Record")
            .field("fields", &state.fields)
            .field("deleted", &state.deleted)
            .field("error", &state.error)
            .finish()
    }
}
