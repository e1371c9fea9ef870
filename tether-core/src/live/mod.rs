//! Live Records and Lists
//!
//! This module holds the objects a UI keeps references to, and the
//! reconcilers that keep them converged with the server.
//!
//! # Identity
//!
//! A [`Record`] or [`List`] is a cheap handle around shared state. Remote
//! events mutate that state in place, so a handle obtained once stays valid
//! (and keeps showing fresh data) for as long as the consumer holds it.
//!
//! # Reconcilers
//!
//! Each cached record or list is owned by a feed that walks
//!
//! ```text
//! Unsubscribed -> Subscribing -> Live
//!                      |           |
//!                      +-> Errored +-> (error events keep it Live)
//! ```
//!
//! and back to `Unsubscribed` on stop. Feeds translate the channel protocol
//! (`initial`, `update`, `insert`, `delete`, `error`, `pull`) into in-place
//! mutations and emit computation signals.
//!
//! # Tiers
//!
//! - [`Tier::Plain`]: one-shot `get`/`find`, no channel.
//! - [`Tier::Watch`]: a channel streams server changes.
//! - [`Tier::Sync`]: a channel plus a sync document that exchanges edits.

mod document;
mod feed;
mod list;
mod list_feed;
mod record;
mod record_feed;
mod service;

pub use document::{DocumentFactory, SyncDocument};
pub use feed::FeedState;
pub use list::{List, ListEvent};
pub use record::{Extensions, Method, Record, RecordEvent};
pub use service::{Callback, Channel, ChannelEvent, Handler, Operation, Reply, Response, Service};

pub(crate) use feed::FeedContext;
pub(crate) use list_feed::ListFeed;
pub(crate) use record_feed::RecordFeed;

use serde_json::{Map, Value};

/// The field map of a record.
pub type Fields = Map<String, Value>;

/// Cache key derived from a record's `id` field.
pub type RecordId = String;

/// Subscription strategy for a record or list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Tier {
    Plain,
    #[default]
    Watch,
    Sync,
}

impl Tier {
    /// All tiers, highest fidelity first.
    pub const BY_FIDELITY: [Tier; 3] = [Tier::Sync, Tier::Watch, Tier::Plain];

    /// Read and strip `watch` / `sync` flags from a descriptor.
    ///
    /// `sync: true` wins; `watch: false` without `sync` selects the plain
    /// tier; anything else is the default watch tier.
    pub fn from_flags(map: &mut Map<String, Value>) -> Tier {
        let sync = map.remove("sync");
        let watch = map.remove("watch");

        if sync == Some(Value::Bool(true)) {
            Tier::Sync
        } else if watch == Some(Value::Bool(false)) {
            Tier::Plain
        } else {
            Tier::Watch
        }
    }

    /// Add this tier's flag to a request payload.
    pub fn write_flag(&self, map: &mut Map<String, Value>) {
        match self {
            Tier::Plain => {}
            Tier::Watch => {
                map.insert("watch".into(), Value::Bool(true));
            }
            Tier::Sync => {
                map.insert("sync".into(), Value::Bool(true));
            }
        }
    }
}

/// Turn an `id` value into a cache key. Strings and numbers are accepted.
pub fn record_key(id: &Value) -> Option<RecordId> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The cache key of a field map, if it carries a usable `id`.
pub fn fields_key(fields: &Fields) -> Option<RecordId> {
    fields.get("id").and_then(record_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tier_flags() {
        let mut map = Map::new();
        map.insert("sync".into(), json!(true));
        map.insert("watch".into(), json!(true));
        assert_eq!(Tier::from_flags(&mut map), Tier::Sync);
        assert!(map.is_empty());

        let mut map = Map::new();
        map.insert("watch".into(), json!(false));
        assert_eq!(Tier::from_flags(&mut map), Tier::Plain);

        assert_eq!(Tier::from_flags(&mut Map::new()), Tier::Watch);
    }

    #[test]
    fn write_flag_round_trips() {
        for tier in Tier::BY_FIDELITY {
            let mut map = Map::new();
            tier.write_flag(&mut map);
            if tier == Tier::Plain {
                map.insert("watch".into(), json!(false));
            }
            assert_eq!(Tier::from_flags(&mut map), tier);
        }
    }

    #[test]
    fn keys_from_ids() {
        assert_eq!(record_key(&json!("abc")), Some("abc".to_string()));
        assert_eq!(record_key(&json!(123)), Some("123".to_string()));
        assert_eq!(record_key(&json!(null)), None);
        assert_eq!(record_key(&json!({"id": 1})), None);
    }
}
