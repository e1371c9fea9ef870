//! Query Descriptors
//!
//! A [`Query`] describes a server-side `find`: an equality on one or more
//! indexed fields, a range over a single index, or no filter at all. The
//! same descriptor drives three things:
//!
//! - the payload of the remote `find` call,
//! - the canonical cache key used to deduplicate lists,
//! - [`matchfind`], which routes optimistic local creates into open lists.
//!
//! # Canonical keys
//!
//! Two queries that differ only in the order their fields were added, or in
//! their `compare` function, share a cache entry. The key is the descriptor
//! serialized with object keys sorted at every depth. The tier is not part
//! of the key; each tier has its own cache.

mod matchfind;

pub use matchfind::{matchfind, INDEX_SEPARATOR};

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::live::{Record, Tier};

/// Ordering applied to a list after every change.
pub type Compare = Arc<dyn Fn(&Record, &Record) -> Ordering + Send + Sync>;

/// Whether a range endpoint is included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bound {
    Open,
    Closed,
}

impl Bound {
    fn as_str(&self) -> &'static str {
        match self {
            Bound::Open => "open",
            Bound::Closed => "closed",
        }
    }
}

/// A `find` descriptor.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Query {
    /// Field names joined by [`INDEX_SEPARATOR`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,

    /// Scalar, or a tuple aligned with a compound index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Value>,

    /// Left bound; closed when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<Bound>,

    /// Right bound; open when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Bound>,

    /// Extra filter fields forwarded to the service untouched.
    #[serde(flatten)]
    pub filter: Map<String, Value>,

    #[serde(skip)]
    pub tier: Tier,

    #[serde(skip)]
    pub compare: Option<Compare>,
}

impl Query {
    /// An unfiltered query in the default tier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON descriptor. `watch: true` or `sync: true` select the tier.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::Configuration(
                "query descriptor must be an object".into(),
            ));
        };

        let tier = Tier::from_flags(&mut map);
        let mut query: Query = serde_json::from_value(Value::Object(map))
            .map_err(|e| Error::Configuration(format!("invalid query: {e}")))?;
        query.tier = tier;
        Ok(query)
    }

    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn start(mut self, start: impl Into<Value>) -> Self {
        self.start = Some(start.into());
        self
    }

    pub fn end(mut self, end: impl Into<Value>) -> Self {
        self.end = Some(end.into());
        self
    }

    pub fn left(mut self, bound: Bound) -> Self {
        self.left = Some(bound);
        self
    }

    pub fn right(mut self, bound: Bound) -> Self {
        self.right = Some(bound);
        self
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Add a free-form filter field.
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    pub fn compare<F>(mut self, compare: F) -> Self
    where
        F: Fn(&Record, &Record) -> Ordering + Send + Sync + 'static,
    {
        self.compare = Some(Arc::new(compare));
        self
    }

    /// True when the query carries a range.
    pub fn is_range(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    /// The descriptor as a JSON object, without tier flags.
    pub fn descriptor(&self) -> Map<String, Value> {
        let mut map = self.filter.clone();

        if let Some(index) = &self.index {
            map.insert("index".into(), Value::String(index.clone()));
        }
        for (key, value) in [("value", &self.value), ("start", &self.start), ("end", &self.end)] {
            if let Some(value) = value {
                map.insert(key.to_string(), value.clone());
            }
        }
        for (key, bound) in [("left", self.left), ("right", self.right)] {
            if let Some(bound) = bound {
                map.insert(key.to_string(), Value::String(bound.as_str().into()));
            }
        }
        map
    }

    /// The payload of the remote `find` call, tier flag included.
    pub fn payload(&self) -> Value {
        let mut map = self.descriptor();
        self.tier.write_flag(&mut map);
        Value::Object(map)
    }

    /// Order-independent cache key.
    pub fn key(&self) -> QueryKey {
        let mut out = String::new();
        canonical(&Value::Object(self.descriptor()), &mut out);
        QueryKey(out)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("descriptor", &self.descriptor())
            .field("tier", &self.tier)
            .field("compare", &self.compare.is_some())
            .finish()
    }
}

/// Canonical cache key for a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(String);

impl QueryKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize `value` with object keys sorted at every depth.
pub(crate) fn canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&leaf.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_ignores_insertion_order() {
        let a = Query::new().filter("foo", "bar").filter("baz", 1);
        let b = Query::new().filter("baz", 1).filter("foo", "bar");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn key_ignores_nested_order() {
        let a = Query::new().value(json!({"x": 1, "y": {"b": 2, "a": 1}}));
        let b = Query::from_value(json!({"value": {"y": {"a": 1, "b": 2}, "x": 1}})).unwrap();
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn key_ignores_compare_and_tier() {
        let plain = Query::new().index("a").value(1);
        let sorted = Query::new()
            .index("a")
            .value(1)
            .tier(Tier::Sync)
            .compare(|a, b| a.id().cmp(&b.id()));
        assert_eq!(plain.key(), sorted.key());
    }

    #[test]
    fn different_queries_have_different_keys() {
        let a = Query::new().index("a").value(1);
        let b = Query::new().index("a").value(2);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn from_value_reads_tier_flags() {
        let query = Query::from_value(json!({"foo": "bar", "sync": true})).unwrap();
        assert_eq!(query.tier, Tier::Sync);
        assert_eq!(query.filter.get("foo"), Some(&json!("bar")));
        assert!(!query.filter.contains_key("sync"));

        let query = Query::from_value(json!({"index": "a", "right": "closed"})).unwrap();
        assert_eq!(query.tier, Tier::Watch);
        assert_eq!(query.right, Some(Bound::Closed));
    }

    #[test]
    fn from_value_rejects_non_objects() {
        assert!(matches!(
            Query::from_value(json!([1, 2])),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn payload_carries_tier_flag() {
        let watch = Query::new().filter("foo", "bar");
        assert_eq!(watch.payload(), json!({"foo": "bar", "watch": true}));

        let sync = Query::new().filter("foo", "bar").tier(Tier::Sync);
        assert_eq!(sync.payload(), json!({"foo": "bar", "sync": true}));

        let plain = Query::new().index("a").start(0).left(Bound::Open).tier(Tier::Plain);
        assert_eq!(
            plain.payload(),
            json!({"index": "a", "start": 0, "left": "open"})
        );
    }
}
