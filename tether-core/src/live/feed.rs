//! Pieces shared by the record and list reconcilers.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::{Channel, DocumentFactory, Extensions, Fields, Operation, Record, Response, Service};
use crate::error::Error;
use crate::reactive::Computation;
use crate::tracking::Tracking;

/// Everything a feed needs from its collection.
pub(crate) struct FeedContext {
    pub(crate) service: Arc<dyn Service>,
    pub(crate) computation: Computation,
    pub(crate) tracking: Tracking,
    pub(crate) documents: Option<Arc<dyn DocumentFactory>>,
    pub(crate) extensions: Arc<Extensions>,
}

/// Lifecycle of a reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FeedState {
    #[default]
    Unsubscribed,
    /// The initiating call is in flight, or the channel has not sent
    /// `initial` yet.
    Subscribing,
    Live,
    /// The round failed before reaching `Live`.
    Errored,
}

/// Subscription bookkeeping guarded by the reconciler's lock.
///
/// Every start bumps the generation. Callbacks capture the generation they
/// were issued under and are dropped once it is stale, so a slow reply can
/// never revive a stopped feed.
#[derive(Default)]
pub(crate) struct Link {
    pub(crate) state: FeedState,
    pub(crate) generation: u64,
    pub(crate) channel: Option<Arc<dyn Channel>>,
}

impl Link {
    /// Begin a round. `None` if one is already running.
    pub(crate) fn begin(&mut self) -> Option<u64> {
        if self.state != FeedState::Unsubscribed {
            return None;
        }
        self.state = FeedState::Subscribing;
        self.generation += 1;
        Some(self.generation)
    }

    /// Tear the round down, handing back the channel to close. `None` if
    /// nothing was running.
    pub(crate) fn end(&mut self) -> Option<Option<Arc<dyn Channel>>> {
        if self.state == FeedState::Unsubscribed {
            return None;
        }
        self.state = FeedState::Unsubscribed;
        self.generation += 1;
        Some(self.channel.take())
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.state != FeedState::Unsubscribed
    }

    /// Record an error. Returns true if the feed was already live.
    pub(crate) fn fail(&mut self) -> bool {
        if self.state == FeedState::Live {
            return true;
        }
        self.state = FeedState::Errored;
        false
    }
}

/// Unwrap a field map from a payload.
pub(crate) fn as_fields(value: Value) -> Option<Fields> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// The id a `delete` event refers to: a bare id or a map carrying one.
pub(crate) fn target_key(payload: &Value) -> Option<String> {
    match payload {
        Value::Object(map) => map.get("id").and_then(super::record_key),
        other => super::record_key(other),
    }
}

/// Send a record's full field map as a remote `update`.
///
/// A rejection is attached to the record; nothing is rolled back.
pub(crate) fn send_update(service: &dyn Service, computation: &Computation, record: &Record) {
    if record.is_deleted() {
        return;
    }
    let record = record.clone();
    let computation = computation.clone();
    let payload = record.serialize();

    service.call(
        Operation::Update,
        payload,
        Box::new(move |reply| match reply {
            Ok(Response::Value(Value::Object(fields))) => {
                record.update_quiet(fields);
                record.changed();
                computation.asynchronous();
            }
            Ok(_) => {}
            Err(err) => {
                warn!(record = ?record.id(), error = %err, "update rejected");
                record.set_error(Error::Remote(err));
                computation.asynchronous();
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generations_advance() {
        let mut link = Link::default();
        let first = link.begin().unwrap();
        assert!(link.begin().is_none());
        assert!(link.is_current(first));

        assert!(link.end().is_some());
        assert!(!link.is_current(first));
        assert!(link.end().is_none());

        let second = link.begin().unwrap();
        assert_ne!(first, second);
        assert!(!link.is_current(first));
    }

    #[test]
    fn errors_before_live_are_terminal() {
        let mut link = Link::default();
        link.begin();
        assert!(!link.fail());
        assert_eq!(link.state, FeedState::Errored);

        link.state = FeedState::Live;
        assert!(link.fail());
        assert_eq!(link.state, FeedState::Live);
    }

    #[test]
    fn delete_targets() {
        assert_eq!(target_key(&json!("a")), Some("a".into()));
        assert_eq!(target_key(&json!(4)), Some("4".into()));
        assert_eq!(target_key(&json!({"id": "b"})), Some("b".into()));
        assert_eq!(target_key(&json!({"name": "b"})), None);
    }
}
