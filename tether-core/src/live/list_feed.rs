//! Reconciler for a query-backed list.
//!
//! Besides the record protocol, list channels carry `insert` for new
//! members, and in the sync tier every member has its own document, keyed
//! by id. Pulls for ids the list does not hold are ignored.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use super::feed::{as_fields, send_update, target_key, FeedContext, FeedState, Link};
use super::list::ListOwner;
use super::record::Upstream;
use super::{
    fields_key, Channel, ChannelEvent, DocumentFactory, Extensions, Fields, List, Operation, Record,
    RecordId, Reply, Response, Service, SyncDocument, Tier,
};
use crate::error::Error;
use crate::query::{Query, QueryKey};
use crate::reactive::{Computation, EntityId, References, Watched};
use crate::tracking::Tracking;

#[derive(Default)]
struct Core {
    link: Link,
    documents: HashMap<RecordId, Box<dyn SyncDocument>>,
}

pub(crate) struct ListFeed {
    entity: EntityId,
    references: References,
    query: Query,
    key: QueryKey,
    tier: Tier,
    list: List,
    service: Arc<dyn Service>,
    computation: Computation,
    tracking: Tracking,
    extensions: Arc<Extensions>,
    documents: Option<Arc<dyn DocumentFactory>>,
    core: Mutex<Core>,
    this: Weak<ListFeed>,
}

impl ListFeed {
    pub(crate) fn new(context: &FeedContext, query: Query) -> Arc<Self> {
        let list = List::attached(query.compare.clone(), Some(context.computation.clone()));
        let key = query.key();
        let tier = query.tier;

        Arc::new_cyclic(|this: &Weak<ListFeed>| {
            let owner: Weak<dyn ListOwner> = this.clone();
            list.bind(owner);
            ListFeed {
                entity: EntityId::new(),
                references: References::new(),
                query,
                key,
                tier,
                list,
                service: context.service.clone(),
                computation: context.computation.clone(),
                tracking: context.tracking.clone(),
                extensions: context.extensions.clone(),
                documents: context.documents.clone(),
                core: Mutex::new(Core::default()),
                this: this.clone(),
            }
        })
    }

    pub(crate) fn list(&self) -> &List {
        &self.list
    }

    pub(crate) fn query(&self) -> &Query {
        &self.query
    }

    pub(crate) fn tier(&self) -> Tier {
        self.tier
    }

    pub(crate) fn state(&self) -> FeedState {
        self.core.lock().link.state
    }

    /// Remove a member locally, along with its document.
    pub(crate) fn remove(&self, id: &str) -> Option<Record> {
        let record = self.list.delete(id)?;
        self.core.lock().documents.remove(id);
        Some(record)
    }

    fn on_reply(&self, generation: u64, reply: Reply) {
        match reply {
            Err(err) => {
                {
                    let mut core = self.core.lock();
                    if !core.link.is_current(generation) {
                        return;
                    }
                    core.link.fail();
                }
                warn!(query = %self.key, tier = ?self.tier, error = %err, "find failed");
                self.list.set_error(Error::Transport(err));
                self.computation.end();
            }
            Ok(Response::Value(value)) => {
                if !self.core.lock().link.is_current(generation) {
                    return;
                }
                self.on_initial(value);
            }
            Ok(Response::Channel(channel)) => {
                {
                    let mut core = self.core.lock();
                    if !core.link.is_current(generation) {
                        drop(core);
                        debug!(query = %self.key, "closing channel for stale subscription");
                        channel.close();
                        return;
                    }
                    core.link.channel = Some(channel.clone());
                }
                let this = self.this.clone();
                channel.on(Arc::new(move |event| {
                    if let Some(feed) = this.upgrade() {
                        feed.on_event(generation, event);
                    }
                }));
            }
        }
    }

    fn on_event(&self, generation: u64, event: ChannelEvent) {
        if !self.core.lock().link.is_current(generation) {
            trace!(query = %self.key, event = event.name(), "dropping stale event");
            return;
        }

        match event {
            ChannelEvent::Initial(value) => self.on_initial(value),
            ChannelEvent::Update(value) => self.on_update(value),
            ChannelEvent::Insert(value) => self.on_insert(value),
            ChannelEvent::Delete(value) => {
                let Some(id) = target_key(&value) else {
                    return;
                };
                if self.remove(&id).is_some() {
                    self.computation.asynchronous();
                } else {
                    trace!(query = %self.key, id = %id, "delete for unknown member");
                }
            }
            ChannelEvent::Error(err) => {
                let was_live = self.core.lock().link.fail();
                warn!(query = %self.key, error = %err, "channel error");
                self.list.set_error(Error::Channel(err));
                if was_live {
                    self.computation.asynchronous();
                } else {
                    self.computation.end();
                }
            }
            ChannelEvent::Pull(value) => self.on_pull(value),
        }
    }

    fn on_initial(&self, value: Value) {
        let Value::Array(items) = value else {
            warn!(query = %self.key, "initial snapshot is not an array");
            return;
        };

        let mut members = Vec::with_capacity(items.len());
        let mut documents = HashMap::new();
        for item in items {
            let Some(fields) = as_fields(item) else {
                continue;
            };
            let Some(id) = fields_key(&fields) else {
                warn!(query = %self.key, "skipping member without id");
                continue;
            };
            if let (Tier::Sync, Some(factory)) = (self.tier, &self.documents) {
                documents.insert(id.clone(), factory.construct(&fields));
            }
            let record = match self.list.get(&id) {
                Some(existing) => {
                    existing.update_quiet(fields);
                    existing.changed();
                    existing
                }
                None => self.construct(fields),
            };
            members.push(record);
        }

        self.list.replace(members);
        {
            let mut core = self.core.lock();
            core.link.state = FeedState::Live;
            core.documents = documents;
        }
        debug!(query = %self.key, tier = ?self.tier, len = self.list.len(), "list live");

        self.list.settle();
        self.computation.end();
    }

    fn on_update(&self, value: Value) {
        let Some(fields) = as_fields(value) else {
            return;
        };
        let Some(record) = fields_key(&fields).and_then(|id| self.list.get(&id)) else {
            trace!(query = %self.key, "update for unknown member");
            return;
        };
        record.update_quiet(fields);
        record.changed();
        self.list.onchange();
    }

    fn on_insert(&self, value: Value) {
        let Some(fields) = as_fields(value) else {
            return;
        };
        let Some(id) = fields_key(&fields) else {
            warn!(query = %self.key, "insert without id");
            return;
        };

        let document = match (self.tier, &self.documents) {
            (Tier::Sync, Some(factory)) => Some(factory.construct(&fields)),
            _ => None,
        };
        let record = match self.list.get(&id) {
            Some(existing) => {
                existing.update_quiet(fields);
                existing.changed();
                existing
            }
            None => self.list.push(self.construct(fields)),
        };

        if let Some(document) = document {
            self.core.lock().documents.insert(id, document);
            // An optimistic local member may hold edits the server lacks.
            self.flush(&record);
        }
        self.list.onchange();
    }

    fn on_pull(&self, value: Value) {
        let id = value.get("id").and_then(super::record_key);
        let edits = value.get("edits").and_then(Value::as_array);
        let (Some(id), Some(edits)) = (id, edits) else {
            return;
        };
        let Some(record) = self.list.get(&id) else {
            trace!(query = %self.key, id = %id, "pull for unknown member");
            return;
        };

        let Some((generation, mut document)) = self.take_document(&id) else {
            return;
        };
        let mut fields = record.fields();
        for edit in edits {
            document.pull(edit, &mut fields);
        }
        record.replace_fields(fields);
        let outstanding = document.edits();

        // Answer once with whatever is still outstanding.
        if let Some(channel) = self.put_document(generation, id.clone(), document) {
            if !outstanding.is_empty() {
                channel.emit(ChannelEvent::Pull(json!({"id": id, "edits": outstanding})));
            }
        }
        record.changed();
        self.list.onchange();
    }

    /// Diff a member against its document and send pending edits.
    fn flush(&self, record: &Record) {
        let Some(id) = record.id() else {
            return;
        };
        let Some((generation, mut document)) = self.take_document(&id) else {
            return;
        };
        document.push(&record.fields());
        let edits = document.edits();

        if let Some(channel) = self.put_document(generation, id.clone(), document) {
            if !edits.is_empty() {
                channel.emit(ChannelEvent::Pull(json!({"id": id, "edits": edits})));
            }
        }
    }

    /// Detach a member's document so it can run without the lock held.
    fn take_document(&self, id: &str) -> Option<(u64, Box<dyn SyncDocument>)> {
        let mut core = self.core.lock();
        let generation = core.link.generation;
        core.documents.remove(id).map(|document| (generation, document))
    }

    /// Reattach a document unless the feed stopped or the member was
    /// replaced meanwhile. Returns the channel to answer on.
    fn put_document(
        &self,
        generation: u64,
        id: RecordId,
        document: Box<dyn SyncDocument>,
    ) -> Option<Arc<dyn Channel>> {
        let mut core = self.core.lock();
        if !core.link.is_current(generation) || core.documents.contains_key(&id) {
            return None;
        }
        core.documents.insert(id, document);
        core.link.channel.clone()
    }
}

impl ListOwner for ListFeed {
    fn construct(&self, fields: Fields) -> Record {
        let record = Record::attached(
            fields,
            Some(self.tracking.clone()),
            Some(self.extensions.clone()),
        );
        let upstream: Weak<dyn Upstream> = self.this.clone();
        record.bind(upstream);
        record
    }

    fn close(&self) {
        self.stop();
    }
}

impl Upstream for ListFeed {
    fn push(&self, record: &Record) {
        match self.tier {
            Tier::Sync => self.flush(record),
            Tier::Plain | Tier::Watch => {
                send_update(self.service.as_ref(), &self.computation, record)
            }
        }
    }

    // Closing one member leaves the list subscribed.
    fn close(&self, _record: &Record) {}
}

impl Watched for ListFeed {
    fn entity_id(&self) -> EntityId {
        self.entity
    }

    fn references(&self) -> &References {
        &self.references
    }

    fn start(&self) {
        let Some(generation) = self.core.lock().link.begin() else {
            return;
        };
        debug!(query = %self.key, tier = ?self.tier, "list subscribing");
        self.computation.start();

        let this = self.this.clone();
        self.service.call(
            Operation::Find,
            self.query.payload(),
            Box::new(move |reply| {
                if let Some(feed) = this.upgrade() {
                    feed.on_reply(generation, reply);
                }
            }),
        );
    }

    fn stop(&self) {
        let channel = {
            let mut core = self.core.lock();
            let Some(channel) = core.link.end() else {
                return;
            };
            core.documents.clear();
            channel
        };
        debug!(query = %self.key, tier = ?self.tier, "list stopped");
        if let Some(channel) = channel {
            channel.close();
        }
    }
}
