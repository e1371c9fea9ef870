//! The remote side, as seen from a collection.
//!
//! A [`Service`] answers `get`/`find`/`create`/`update`/`delete` calls
//! through a callback. For the watch and sync tiers it answers with a
//! [`Channel`]: a bidirectional event stream that closes when released.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Find,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Find => "find",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful answer from the service.
#[derive(Clone)]
pub enum Response {
    /// A one-shot result.
    Value(Value),
    /// A live event stream.
    Channel(Arc<dyn Channel>),
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Response::Channel(_) => f.write_str("Channel(..)"),
        }
    }
}

/// Outcome of a service call. Errors carry the raw remote payload.
pub type Reply = std::result::Result<Response, Value>;

pub type Callback = Box<dyn FnOnce(Reply) + Send>;

/// Remote operations backing a collection.
///
/// The callback may run synchronously inside `call` or later on any thread.
pub trait Service: Send + Sync {
    fn call(&self, operation: Operation, payload: Value, callback: Callback);
}

impl<F> Service for F
where
    F: Fn(Operation, Value, Callback) + Send + Sync,
{
    fn call(&self, operation: Operation, payload: Value, callback: Callback) {
        self(operation, payload, callback)
    }
}

/// One message on a channel, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Full snapshot: a field map for records, an array for lists.
    Initial(Value),
    /// Field changes for one record, keyed by `id`.
    Update(Value),
    /// A new list member.
    Insert(Value),
    /// Removal of a record, by id or by a map carrying `id`.
    Delete(Value),
    Error(Value),
    /// Sync edits. Records carry the edits; list members carry `{id, edits}`.
    Pull(Value),
}

impl ChannelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Initial(_) => "initial",
            ChannelEvent::Update(_) => "update",
            ChannelEvent::Insert(_) => "insert",
            ChannelEvent::Delete(_) => "delete",
            ChannelEvent::Error(_) => "error",
            ChannelEvent::Pull(_) => "pull",
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            ChannelEvent::Initial(v)
            | ChannelEvent::Update(v)
            | ChannelEvent::Insert(v)
            | ChannelEvent::Delete(v)
            | ChannelEvent::Error(v)
            | ChannelEvent::Pull(v) => v,
        }
    }

    /// Build an event from its wire name. Unknown names yield `None`.
    pub fn from_parts(name: &str, payload: Value) -> Option<Self> {
        let event = match name {
            "initial" => ChannelEvent::Initial(payload),
            "update" => ChannelEvent::Update(payload),
            "insert" => ChannelEvent::Insert(payload),
            "delete" => ChannelEvent::Delete(payload),
            "error" => ChannelEvent::Error(payload),
            "pull" => ChannelEvent::Pull(payload),
            _ => return None,
        };
        Some(event)
    }
}

pub type Handler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// A live event stream opened by a `get` or `find`.
pub trait Channel: Send + Sync {
    /// Register the handler for inbound events.
    fn on(&self, handler: Handler);

    /// Send an event upstream.
    fn emit(&self, event: ChannelEvent);

    /// Release the stream. No events are delivered afterwards.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn event_names_round_trip() {
        for name in ["initial", "update", "insert", "delete", "error", "pull"] {
            let event = ChannelEvent::from_parts(name, json!(null)).unwrap();
            assert_eq!(event.name(), name);
        }
        assert!(ChannelEvent::from_parts("patch", json!(null)).is_none());
    }

    #[test]
    fn closures_are_services() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let service = move |op: Operation, payload: Value, done: Callback| {
            seen.lock().push((op, payload.clone()));
            done(Ok(Response::Value(payload)));
        };

        let answer = Arc::new(Mutex::new(None));
        let slot = answer.clone();
        service.call(
            Operation::Get,
            json!({"id": 1}),
            Box::new(move |reply| *slot.lock() = Some(reply)),
        );

        assert_eq!(calls.lock().as_slice(), &[(Operation::Get, json!({"id": 1}))]);
        assert!(matches!(
            answer.lock().take(),
            Some(Ok(Response::Value(v))) if v == json!({"id": 1})
        ));
    }
}
