//! Shared fixtures: a recording service, a scriptable channel and a
//! field-diff sync document.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use tether_core::live::{Callback, Handler};
use tether_core::{
    try_watch, Channel, ChannelEvent, Collection, DocumentFactory, Fields, Operation, Response,
    Service, SyncDocument, Watcher,
};

pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// Run `f` in a watch scope, keeping the watcher so its reads stay
/// subscribed.
pub fn watched<T>(f: impl FnOnce() -> tether_core::Result<T>) -> (Watcher, T) {
    try_watch(f).expect("tracked function succeeds")
}

/// How the fake service answers a call.
#[derive(Debug, Clone)]
pub enum Answer {
    /// Open a new [`FakeChannel`].
    Channel,
    /// Reply with the request payload.
    Echo,
    Value(Value),
    Fail(Value),
    /// Keep the callback until [`FakeService::resolve`] is called.
    Defer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub operation: Operation,
    pub payload: Value,
}

/// Records every call and answers reads with channels, writes with echoes.
pub struct FakeService {
    calls: Mutex<Vec<Call>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    reads: Mutex<Answer>,
    writes: Mutex<Answer>,
    deferred: Mutex<Vec<Callback>>,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            reads: Mutex::new(Answer::Channel),
            writes: Mutex::new(Answer::Echo),
            deferred: Mutex::new(Vec::new()),
        })
    }

    /// Answer future `get`/`find` calls with `answer`.
    pub fn answer_reads(&self, answer: Answer) {
        *self.reads.lock() = answer;
    }

    /// Answer future `create`/`update`/`delete` calls with `answer`.
    pub fn answer_writes(&self, answer: Answer) {
        *self.writes.lock() = answer;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, operation: Operation) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.operation == operation)
            .map(|call| call.payload.clone())
            .collect()
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().clone()
    }

    /// The most recently opened channel.
    pub fn channel(&self) -> Arc<FakeChannel> {
        self.channels
            .lock()
            .last()
            .cloned()
            .expect("no channel was opened")
    }

    /// Answer the oldest deferred call.
    pub fn resolve(&self, answer: Answer) {
        let callback = {
            let mut deferred = self.deferred.lock();
            assert!(!deferred.is_empty(), "no deferred call");
            deferred.remove(0)
        };
        let reply = match answer {
            Answer::Channel => Ok(Response::Channel(self.open())),
            Answer::Echo => Ok(Response::Value(Value::Null)),
            Answer::Value(value) => Ok(Response::Value(value)),
            Answer::Fail(err) => Err(err),
            Answer::Defer => panic!("cannot defer a deferred call"),
        };
        callback(reply);
    }

    pub fn pending(&self) -> usize {
        self.deferred.lock().len()
    }

    fn open(&self) -> Arc<FakeChannel> {
        let channel = Arc::new(FakeChannel::default());
        self.channels.lock().push(channel.clone());
        channel
    }
}

impl Service for FakeService {
    fn call(&self, operation: Operation, payload: Value, callback: Callback) {
        self.calls.lock().push(Call {
            operation,
            payload: payload.clone(),
        });

        let answer = match operation {
            Operation::Get | Operation::Find => self.reads.lock().clone(),
            _ => self.writes.lock().clone(),
        };
        match answer {
            Answer::Channel => callback(Ok(Response::Channel(self.open()))),
            Answer::Echo => callback(Ok(Response::Value(payload))),
            Answer::Value(value) => callback(Ok(Response::Value(value))),
            Answer::Fail(err) => callback(Err(err)),
            Answer::Defer => self.deferred.lock().push(callback),
        }
    }
}

/// A channel driven by the test.
#[derive(Default)]
pub struct FakeChannel {
    handler: Mutex<Option<Handler>>,
    emitted: Mutex<Vec<ChannelEvent>>,
    closed: AtomicBool,
}

impl FakeChannel {
    /// Deliver an inbound event, as the server would.
    pub fn send(&self, event: ChannelEvent) {
        if self.is_closed() {
            return;
        }
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    /// Deliver an event even after close, like a racing transport.
    pub fn send_late(&self, event: ChannelEvent) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    pub fn emitted(&self) -> Vec<ChannelEvent> {
        self.emitted.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Channel for FakeChannel {
    fn on(&self, handler: Handler) {
        *self.handler.lock() = Some(handler);
    }

    fn emit(&self, event: ChannelEvent) {
        self.emitted.lock().push(event);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A last-writer-wins document over flat fields.
///
/// Edits look like `{"set": key, "value": v}` or `{"unset": key}`. Pulling
/// an edit identical to a pending one acknowledges it.
pub struct DiffDocument {
    shadow: Fields,
    pending: Vec<Value>,
}

impl DiffDocument {
    pub fn new(snapshot: Fields) -> Self {
        Self {
            shadow: snapshot,
            pending: Vec::new(),
        }
    }
}

impl SyncDocument for DiffDocument {
    fn pull(&mut self, edit: &Value, fields: &mut Fields) {
        self.pending.retain(|pending| pending != edit);

        if let Some(key) = edit.get("set").and_then(Value::as_str) {
            let value = edit.get("value").cloned().unwrap_or(Value::Null);
            self.shadow.insert(key.to_string(), value.clone());
            fields.insert(key.to_string(), value);
        } else if let Some(key) = edit.get("unset").and_then(Value::as_str) {
            self.shadow.remove(key);
            fields.remove(key);
        }
    }

    fn push(&mut self, fields: &Fields) {
        for (key, value) in fields {
            if self.shadow.get(key) != Some(value) {
                self.pending.push(json!({"set": key, "value": value}));
                self.shadow.insert(key.clone(), value.clone());
            }
        }
        let removed: Vec<String> = self
            .shadow
            .keys()
            .filter(|key| !fields.contains_key(*key))
            .cloned()
            .collect();
        for key in removed {
            self.pending.push(json!({"unset": key}));
            self.shadow.remove(&key);
        }
    }

    fn edits(&self) -> Vec<Value> {
        self.pending.clone()
    }
}

pub struct DiffDocuments;

impl DocumentFactory for DiffDocuments {
    fn construct(&self, snapshot: &Fields) -> Box<dyn SyncDocument> {
        Box::new(DiffDocument::new(snapshot.clone()))
    }
}

/// A collection over `service` with the default configuration.
pub fn collection(service: &Arc<FakeService>) -> Collection {
    let shared: Arc<dyn Service> = service.clone();
    Collection::builder_shared(shared)
        .build()
        .expect("default configuration is valid")
}

/// A collection over `service` with the sync tier enabled.
pub fn sync_collection(service: &Arc<FakeService>) -> Collection {
    let shared: Arc<dyn Service> = service.clone();
    Collection::builder_shared(shared)
        .documents(DiffDocuments)
        .build()
        .expect("sync configuration is valid")
}
