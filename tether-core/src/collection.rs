//! Collections
//!
//! A [`Collection`] is the entry point for one remote resource type. It
//! keeps six caches (records and lists, one of each per [`Tier`]) so that
//! asking twice for the same id, or for equivalent queries, returns the
//! same live object.
//!
//! # Optimistic writes
//!
//! [`Collection::create`] shows the new record locally before the server
//! has confirmed it: every cached list whose query the record satisfies
//! (see [`matchfind`]) gets a member for it. [`Collection::delete`] likewise
//! removes the record from every cached list at once. The remote call is
//! either sent immediately or staged in the active [`Tracking`] changeset.
//!
//! # Example
//!
//! ```ignore
//! let posts = Collection::builder(service).build()?;
//!
//! let watcher = watch(|| {
//!     let post = posts.get("p1").unwrap();
//!     let drafts = posts.find(Query::new().index("state").value("draft")).unwrap();
//! });
//!
//! posts.create(fields);   // appears in `drafts` right away if it matches
//! drop(watcher);          // closes both channels
//! ```

use std::cmp::Reverse;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::live::{
    record_key, DocumentFactory, Extensions, FeedContext, FeedState, Fields, List, ListFeed,
    Method, Operation, Record, RecordFeed, RecordId, Response, Service, Tier,
};
use crate::query::{matchfind, Query, QueryKey};
use crate::reactive::{Computation, EntityId, WatchContext, Watched};
use crate::relations::Relation;
use crate::tracking::{Action, ChangeData, Membership, Target, Tracking};

/// Completion callback for [`Collection::create_with`] and
/// [`Collection::delete_with`].
pub type Done = Box<dyn FnOnce(Result<Value>) + Send>;

pub struct CollectionBuilder {
    service: Arc<dyn Service>,
    computation: Option<Computation>,
    tracking: Option<Tracking>,
    documents: Option<Arc<dyn DocumentFactory>>,
    extensions: Extensions,
    default_tier: Tier,
}

impl CollectionBuilder {
    /// Share a signal bus with other collections.
    pub fn computation(mut self, computation: Computation) -> Self {
        self.computation = Some(computation);
        self
    }

    /// Share an undo history with other collections.
    pub fn tracking(mut self, tracking: Tracking) -> Self {
        self.tracking = Some(tracking);
        self
    }

    /// Enable the sync tier.
    pub fn documents(mut self, factory: impl DocumentFactory + 'static) -> Self {
        self.documents = Some(Arc::new(factory));
        self
    }

    pub fn method<F>(self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&Record, Value) -> Value + Send + Sync + 'static,
    {
        self.extensions.define_method(name, Arc::new(method));
        self
    }

    pub fn relation(self, name: impl Into<String>, relation: Relation) -> Self {
        self.extensions.define_relation(name, relation);
        self
    }

    /// Tier used by [`Collection::get`].
    pub fn default_tier(mut self, tier: Tier) -> Self {
        self.default_tier = tier;
        self
    }

    pub fn build(self) -> Result<Collection> {
        if self.default_tier == Tier::Sync && self.documents.is_none() {
            return Err(Error::Configuration(
                "the sync tier requires a document factory".into(),
            ));
        }

        let context = FeedContext {
            service: self.service,
            computation: self.computation.unwrap_or_default(),
            tracking: self.tracking.unwrap_or_default(),
            documents: self.documents,
            extensions: Arc::new(self.extensions),
        };

        let inner = Arc::new(Inner {
            context,
            default_tier: self.default_tier,
            records: DashMap::new(),
            lists: DashMap::new(),
        });
        Ok(Collection { inner })
    }
}

struct Inner {
    context: FeedContext,
    default_tier: Tier,
    records: DashMap<(Tier, RecordId), Arc<RecordFeed>>,
    lists: DashMap<(Tier, QueryKey), Arc<ListFeed>>,
}

impl Inner {
    fn check_tier(&self, tier: Tier) -> Result<()> {
        if tier == Tier::Sync && self.context.documents.is_none() {
            return Err(Error::Configuration(
                "the sync tier requires a document factory".into(),
            ));
        }
        Ok(())
    }

    /// The best tier this collection can construct records in.
    fn highest_tier(&self) -> Tier {
        if self.context.documents.is_some() {
            Tier::Sync
        } else {
            Tier::Watch
        }
    }

    /// The cached record feed for `key`, created with `fields` on a miss.
    fn record_feed(&self, tier: Tier, key: RecordId, id: Value, fields: Fields) -> Arc<RecordFeed> {
        match self.records.entry((tier, key.clone())) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                trace!(id = %key, tier = ?tier, "record cache miss");
                let feed = RecordFeed::new(&self.context, tier, key, id, fields);
                entry.insert(feed.clone());
                feed
            }
        }
    }

    fn list_feeds(&self) -> Vec<Arc<ListFeed>> {
        self.lists.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Collected first: stopping must not run under a shard lock.
        let lists = self.list_feeds();
        let records: Vec<_> = self.records.iter().map(|e| e.value().clone()).collect();
        for feed in lists {
            feed.stop();
        }
        for feed in records {
            feed.stop();
        }
    }
}

/// Handle to a collection. Clones share the same caches.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<Inner>,
}

/// A non-owning collection handle, used by relations.
#[derive(Clone)]
pub struct WeakCollection(Weak<Inner>);

impl WeakCollection {
    pub fn upgrade(&self) -> Option<Collection> {
        self.0.upgrade().map(|inner| Collection { inner })
    }
}

impl Collection {
    pub fn builder(service: impl Service + 'static) -> CollectionBuilder {
        Self::builder_shared(Arc::new(service))
    }

    pub fn builder_shared(service: Arc<dyn Service>) -> CollectionBuilder {
        CollectionBuilder {
            service,
            computation: None,
            tracking: None,
            documents: None,
            extensions: Extensions::new(),
            default_tier: Tier::default(),
        }
    }

    pub fn downgrade(&self) -> WeakCollection {
        WeakCollection(Arc::downgrade(&self.inner))
    }

    pub fn computation(&self) -> &Computation {
        &self.inner.context.computation
    }

    pub fn tracking(&self) -> &Tracking {
        &self.inner.context.tracking
    }

    pub fn define_method<F>(&self, name: impl Into<String>, method: F)
    where
        F: Fn(&Record, Value) -> Value + Send + Sync + 'static,
    {
        let method: Method = Arc::new(method);
        self.inner.context.extensions.define_method(name, method);
    }

    pub fn define_relation(&self, name: impl Into<String>, relation: Relation) {
        self.inner.context.extensions.define_relation(name, relation);
    }

    /// The live record for `id` in the default tier.
    pub fn get(&self, id: impl Into<Value>) -> Result<Record> {
        self.get_tier(id, self.inner.default_tier)
    }

    /// The live record for `id` in `tier`.
    ///
    /// Returns at once. Inside a [`watch`] scope the record is registered
    /// with the watcher, which subscribes it once the scope closes; fields
    /// then arrive asynchronously. Outside a scope the record is only
    /// cached.
    ///
    /// [`watch`]: crate::reactive::watch
    pub fn get_tier(&self, id: impl Into<Value>, tier: Tier) -> Result<Record> {
        self.inner.check_tier(tier)?;
        let id = id.into();
        let key = record_key(&id).ok_or_else(|| {
            Error::Configuration(format!("record id must be a string or number, got {id}"))
        })?;

        let mut fields = Map::new();
        fields.insert("id".into(), id.clone());
        let feed = self.inner.record_feed(tier, key, id, fields);

        WatchContext::track(feed.clone());
        Ok(feed.record().clone())
    }

    /// The live list for `query`, in the query's tier. Subscribed the same
    /// way as [`get_tier`](Self::get_tier).
    pub fn find(&self, query: Query) -> Result<List> {
        let tier = query.tier;
        self.inner.check_tier(tier)?;

        let feed = match self.inner.lists.entry((tier, query.key())) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                trace!(query = %entry.key().1, tier = ?tier, "list cache miss");
                let feed = ListFeed::new(&self.inner.context, query);
                entry.insert(feed.clone());
                feed
            }
        };

        WatchContext::track(feed.clone());
        Ok(feed.list().clone())
    }

    /// Cached lists, all tiers, subscribed or not.
    pub fn lists(&self) -> Vec<List> {
        self.inner
            .list_feeds()
            .iter()
            .map(|feed| feed.list().clone())
            .collect()
    }

    /// Reconciler state of a cached record.
    pub fn record_state(&self, id: impl Into<Value>, tier: Tier) -> Option<FeedState> {
        let key = record_key(&id.into())?;
        self.inner.records.get(&(tier, key)).map(|feed| feed.state())
    }

    /// Reconciler state of a cached list.
    pub fn list_state(&self, query: &Query) -> Option<FeedState> {
        self.inner
            .lists
            .get(&(query.tier, query.key()))
            .map(|feed| feed.state())
    }

    pub fn create(&self, fields: Fields) -> Record {
        self.create_with(fields, |_| {})
    }

    /// Create a record optimistically.
    ///
    /// An `id` is generated when missing. The record is added to every
    /// cached list it matches (highest tier first) and the returned handle
    /// is the member of the first of them; with no match it is cached on
    /// its own at the highest tier available. `done` receives the outcome
    /// of the single remote `create`.
    pub fn create_with(
        &self,
        mut fields: Fields,
        done: impl FnOnce(Result<Value>) + Send + 'static,
    ) -> Record {
        let existing = fields
            .get("id")
            .and_then(|id| record_key(id).map(|key| (id.clone(), key)));
        let (id, key) = match existing {
            Some(pair) => pair,
            None => {
                let key = Uuid::new_v4().to_string();
                fields.insert("id".into(), Value::String(key.clone()));
                (Value::String(key.clone()), key)
            }
        };

        let mut feeds = self.inner.list_feeds();
        feeds.retain(|feed| match matchfind(&fields, feed.query()) {
            Ok(matched) => matched,
            Err(err) => {
                warn!(query = ?feed.query(), error = %err, "cannot route create");
                false
            }
        });
        feeds.sort_by_key(|feed| Reverse(feed.tier()));

        let mut members: Vec<Membership> = feeds
            .iter()
            .map(|feed| {
                let record = feed.list().add(fields.clone());
                Membership {
                    position: feed.list().position(&key),
                    record,
                    list: Some(feed.list().clone()),
                }
            })
            .collect();

        let record = match members.first() {
            Some(member) => member.record.clone(),
            None => {
                let tier = self.inner.highest_tier();
                let feed = self.inner.record_feed(tier, key.clone(), id.clone(), fields.clone());
                feed.record().update_quiet(fields);
                feed.record().mark_deleted(false);
                let record = feed.record().clone();
                members.push(Membership {
                    record: record.clone(),
                    list: None,
                    position: None,
                });
                record
            }
        };
        debug!(id = %key, lists = feeds.len(), "optimistic create");
        self.inner.context.computation.asynchronous();

        let data = ChangeData::Collection {
            action: Action::Create,
            id: key,
            members,
        };
        self.stage(id, Box::new(done), data);
        record
    }

    pub fn delete(&self, id: impl Into<Value>) -> Result<()> {
        self.delete_with(id, |_| {})
    }

    /// Delete a record optimistically from every cached list and record
    /// cache. `done` receives the outcome of the remote `delete`.
    pub fn delete_with(
        &self,
        id: impl Into<Value>,
        done: impl FnOnce(Result<Value>) + Send + 'static,
    ) -> Result<()> {
        let id = id.into();
        let key = record_key(&id).ok_or_else(|| {
            Error::Configuration(format!("record id must be a string or number, got {id}"))
        })?;

        let mut members = Vec::new();
        for feed in self.inner.list_feeds() {
            let position = feed.list().position(&key);
            if let Some(record) = feed.remove(&key) {
                members.push(Membership {
                    record,
                    list: Some(feed.list().clone()),
                    position,
                });
            }
        }
        for tier in Tier::BY_FIDELITY {
            let feed = self
                .inner
                .records
                .get(&(tier, key.clone()))
                .map(|entry| entry.value().clone());
            if let Some(feed) = feed {
                feed.record().mark_deleted(true);
                members.push(Membership {
                    record: feed.record().clone(),
                    list: None,
                    position: None,
                });
            }
        }
        debug!(id = %key, members = members.len(), "optimistic delete");
        self.inner.context.computation.asynchronous();

        let data = ChangeData::Collection {
            action: Action::Delete,
            id: key,
            members,
        };
        self.stage(id, Box::new(done), data);
        Ok(())
    }

    /// Stage the remote half of a create/delete, or send it right away.
    fn stage(&self, id: Value, done: Done, data: ChangeData) {
        let pending = Arc::new(Pending {
            entity: EntityId::new(),
            id,
            service: self.inner.context.service.clone(),
            computation: self.inner.context.computation.clone(),
            done: Arc::new(Mutex::new(Some(done))),
        });
        let target: Arc<dyn Target> = pending.clone();
        if !self.inner.context.tracking.push(target, data.clone()) {
            pending.commit(&data);
        }
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("records", &self.inner.records.len())
            .field("lists", &self.inner.lists.len())
            .field("default_tier", &self.inner.default_tier)
            .finish()
    }
}

/// The remote half of one optimistic create or delete.
struct Pending {
    entity: EntityId,
    id: Value,
    service: Arc<dyn Service>,
    computation: Computation,
    /// Fired by the first remote call only.
    done: Arc<Mutex<Option<Done>>>,
}

impl Pending {
    fn remove(&self, key: &str, members: &[Membership]) {
        for member in members {
            match &member.list {
                Some(list) => {
                    list.delete(key);
                }
                None => member.record.mark_deleted(true),
            }
        }
        self.computation.asynchronous();
    }

    fn restore(&self, members: &[Membership]) {
        for member in members {
            member.record.mark_deleted(false);
            if let Some(list) = &member.list {
                match member.position {
                    Some(index) => list.insert_at(index, member.record.clone()),
                    None => list.push(member.record.clone()),
                };
                list.settle();
            }
        }
        self.computation.asynchronous();
    }

    fn send_create(&self, members: &[Membership]) {
        let Some(first) = members.first() else {
            return;
        };
        let records: Vec<Record> = members.iter().map(|m| m.record.clone()).collect();
        let computation = self.computation.clone();
        let done = self.done.clone();
        let id = self.id.clone();

        self.service.call(
            Operation::Create,
            first.record.serialize(),
            Box::new(move |reply| {
                let outcome = match reply {
                    Ok(Response::Value(Value::Object(fields))) => {
                        for record in &records {
                            record.update_quiet(fields.clone());
                            record.changed();
                        }
                        Ok(Value::Object(fields))
                    }
                    Ok(Response::Value(value)) => Ok(value),
                    Ok(Response::Channel(channel)) => {
                        channel.close();
                        Ok(Value::Null)
                    }
                    Err(err) => {
                        warn!(id = %id, error = %err, "create rejected");
                        for record in &records {
                            record.set_error(Error::Remote(err.clone()));
                        }
                        Err(Error::Remote(err))
                    }
                };
                computation.asynchronous();
                finish(&done, outcome);
            }),
        );
    }

    fn send_delete(&self, members: &[Membership]) {
        let records: Vec<Record> = members.iter().map(|m| m.record.clone()).collect();
        let computation = self.computation.clone();
        let done = self.done.clone();
        let id = self.id.clone();

        self.service.call(
            Operation::Delete,
            json!({"id": self.id}),
            Box::new(move |reply| {
                let outcome = match reply {
                    Ok(_) => Ok(id),
                    Err(err) => {
                        warn!(id = %id, error = %err, "delete rejected");
                        for record in &records {
                            record.set_error(Error::Remote(err.clone()));
                        }
                        computation.asynchronous();
                        Err(Error::Remote(err))
                    }
                };
                finish(&done, outcome);
            }),
        );
    }
}

fn finish(done: &Mutex<Option<Done>>, outcome: Result<Value>) {
    let done = done.lock().take();
    if let Some(done) = done {
        done(outcome);
    }
}

impl Target for Pending {
    fn target_id(&self) -> EntityId {
        self.entity
    }

    fn abort(&self, data: &ChangeData) {
        let ChangeData::Collection { action, id, members } = data else {
            return;
        };
        match action {
            Action::Create => self.remove(id, members),
            Action::Delete => self.restore(members),
        }
    }

    fn commit(&self, data: &ChangeData) {
        let ChangeData::Collection { action, members, .. } = data else {
            return;
        };
        match action {
            Action::Create => self.send_create(members),
            Action::Delete => self.send_delete(members),
        }
    }

    fn undo(&self, data: &ChangeData) {
        let ChangeData::Collection { action, id, members } = data else {
            return;
        };
        match action {
            Action::Create => {
                self.remove(id, members);
                self.send_delete(members);
            }
            Action::Delete => {
                self.restore(members);
                self.send_create(members);
            }
        }
    }

    fn redo(&self, data: &ChangeData) {
        let ChangeData::Collection { action, id, members } = data else {
            return;
        };
        match action {
            Action::Create => {
                self.restore(members);
                self.send_create(members);
            }
            Action::Delete => {
                self.remove(id, members);
                self.send_delete(members);
            }
        }
    }
}
