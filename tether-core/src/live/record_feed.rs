//! Reconciler for a single record.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use super::feed::{as_fields, send_update, target_key, FeedContext, FeedState, Link};
use super::record::Upstream;
use super::{
    Channel, ChannelEvent, DocumentFactory, Operation, Record, RecordId, Reply, Response, Service,
    SyncDocument, Tier,
};
use crate::error::Error;
use crate::reactive::{Computation, EntityId, References, Watched};

#[derive(Default)]
struct Core {
    link: Link,
    document: Option<Box<dyn SyncDocument>>,
}

pub(crate) struct RecordFeed {
    entity: EntityId,
    references: References,
    key: RecordId,
    id: Value,
    tier: Tier,
    record: Record,
    service: Arc<dyn Service>,
    computation: Computation,
    documents: Option<Arc<dyn DocumentFactory>>,
    core: Mutex<Core>,
    this: Weak<RecordFeed>,
}

impl RecordFeed {
    /// Build a feed whose record starts out with `fields`.
    pub(crate) fn new(
        context: &FeedContext,
        tier: Tier,
        key: RecordId,
        id: Value,
        fields: Map<String, Value>,
    ) -> Arc<Self> {
        let record = Record::attached(
            fields,
            Some(context.tracking.clone()),
            Some(context.extensions.clone()),
        );

        Arc::new_cyclic(|this: &Weak<RecordFeed>| {
            let upstream: Weak<dyn Upstream> = this.clone();
            record.bind(upstream);
            RecordFeed {
                entity: EntityId::new(),
                references: References::new(),
                key,
                id,
                tier,
                record,
                service: context.service.clone(),
                computation: context.computation.clone(),
                documents: context.documents.clone(),
                core: Mutex::new(Core::default()),
                this: this.clone(),
            }
        })
    }

    pub(crate) fn record(&self) -> &Record {
        &self.record
    }

    pub(crate) fn state(&self) -> FeedState {
        self.core.lock().link.state
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
                warn!(id = %self.key, tier = ?self.tier, error = %err, "get failed");
                self.record.set_error(Error::Transport(err));
                self.computation.end();
            }
            Ok(Response::Value(value)) => {
                {
                    let mut core = self.core.lock();
                    if !core.link.is_current(generation) {
                        return;
                    }
                    core.link.state = FeedState::Live;
                }
                if let Some(fields) = as_fields(value) {
                    self.record.update_quiet(fields);
                }
                self.record.changed();
                self.computation.end();
            }
            Ok(Response::Channel(channel)) => {
                {
                    let mut core = self.core.lock();
                    if !core.link.is_current(generation) {
                        drop(core);
                        debug!(id = %self.key, "closing channel for stale subscription");
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
            trace!(id = %self.key, event = event.name(), "dropping stale event");
            return;
        }

        match event {
            ChannelEvent::Initial(value) => self.on_initial(value),
            ChannelEvent::Update(value) => {
                let Some(fields) = as_fields(value) else {
                    return;
                };
                if let Some(other) = fields.get("id").and_then(super::record_key) {
                    if other != self.key {
                        trace!(id = %self.key, other = %other, "update for another record");
                        return;
                    }
                }
                self.record.update_quiet(fields);
                self.record.changed();
                self.computation.asynchronous();
            }
            ChannelEvent::Delete(value) => {
                if let Some(other) = target_key(&value) {
                    if other != self.key {
                        return;
                    }
                }
                self.record.mark_deleted(true);
                self.computation.asynchronous();
            }
            ChannelEvent::Error(err) => {
                let was_live = self.core.lock().link.fail();
                warn!(id = %self.key, error = %err, "channel error");
                self.record.set_error(Error::Channel(err));
                if was_live {
                    self.computation.asynchronous();
                } else {
                    self.computation.end();
                }
            }
            ChannelEvent::Pull(edits) => self.on_pull(edits),
            ChannelEvent::Insert(_) => {
                trace!(id = %self.key, "ignoring insert on a record channel");
            }
        }
    }

    fn on_initial(&self, value: Value) {
        let Some(fields) = as_fields(value) else {
            warn!(id = %self.key, "initial snapshot is not an object");
            return;
        };

        let document = match (self.tier, &self.documents) {
            (Tier::Sync, Some(factory)) => Some(factory.construct(&fields)),
            _ => None,
        };
        self.record.update_quiet(fields);

        {
            let mut core = self.core.lock();
            core.link.state = FeedState::Live;
            core.document = document;
        }
        debug!(id = %self.key, tier = ?self.tier, "record live");

        if self.tier == Tier::Sync {
            // Local writes made before the snapshot arrived.
            self.flush();
        }
        self.record.changed();
        self.computation.end();
    }

    fn on_pull(&self, edits: Value) {
        let Value::Array(edits) = edits else {
            return;
        };
        let Some((generation, mut document)) = self.take_document() else {
            trace!(id = %self.key, "pull before document exists");
            return;
        };
        let mut fields = self.record.fields();
        for edit in &edits {
            document.pull(edit, &mut fields);
        }
        self.record.replace_fields(fields);
        let outstanding = document.edits();

        // Answer once with whatever is still outstanding.
        if let Some(channel) = self.put_document(generation, document) {
            if !outstanding.is_empty() {
                channel.emit(ChannelEvent::Pull(Value::Array(outstanding)));
            }
        }
        self.record.changed();
        self.computation.asynchronous();
    }

    /// Diff the record against its document and send pending edits.
    fn flush(&self) {
        let Some((generation, mut document)) = self.take_document() else {
            return;
        };
        document.push(&self.record.fields());
        let edits = document.edits();

        if let Some(channel) = self.put_document(generation, document) {
            if !edits.is_empty() {
                channel.emit(ChannelEvent::Pull(Value::Array(edits)));
            }
        }
    }

    /// Detach the document so it can run without the lock held.
    fn take_document(&self) -> Option<(u64, Box<dyn SyncDocument>)> {
        let mut core = self.core.lock();
        let generation = core.link.generation;
        core.document.take().map(|document| (generation, document))
    }

    /// Reattach the document unless the feed stopped or a new snapshot
    /// replaced it meanwhile. Returns the channel to answer on.
    fn put_document(
        &self,
        generation: u64,
        document: Box<dyn SyncDocument>,
    ) -> Option<Arc<dyn Channel>> {
        let mut core = self.core.lock();
        if !core.link.is_current(generation) || core.document.is_some() {
            return None;
        }
        core.document = Some(document);
        core.link.channel.clone()
    }

    fn payload(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".into(), self.id.clone());
        self.tier.write_flag(&mut map);
        Value::Object(map)
    }
}

impl Watched for RecordFeed {
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
        debug!(id = %self.key, tier = ?self.tier, "record subscribing");
        self.computation.start();

        let this = self.this.clone();
        self.service.call(
            Operation::Get,
            self.payload(),
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
            core.document = None;
            channel
        };
        debug!(id = %self.key, tier = ?self.tier, "record stopped");
        if let Some(channel) = channel {
            channel.close();
        }
    }
}

impl Upstream for RecordFeed {
    fn push(&self, record: &Record) {
        match self.tier {
            Tier::Sync => self.flush(),
            Tier::Plain | Tier::Watch => {
                send_update(self.service.as_ref(), &self.computation, record)
            }
        }
    }

    fn close(&self, _record: &Record) {
        self.stop();
    }
}
