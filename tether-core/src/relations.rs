//! Relations between collections.
//!
//! A relation turns a record into a live list in another (or the same)
//! collection. Only has-many is supported: the target list is the set of
//! records whose `target_field` equals the source record's `source_field`.

use std::fmt;

use serde_json::Value;

use crate::collection::{Collection, WeakCollection};
use crate::error::{Error, Result};
use crate::live::{List, Record};
use crate::query::Query;

#[derive(Clone)]
pub enum Relation {
    HasMany {
        target: WeakCollection,
        target_field: String,
        source_field: String,
    },
}

impl Relation {
    /// Records of `target` whose `target_field` equals this record's
    /// `source_field`.
    pub fn has_many(
        target: &Collection,
        target_field: impl Into<String>,
        source_field: impl Into<String>,
    ) -> Self {
        Relation::HasMany {
            target: target.downgrade(),
            target_field: target_field.into(),
            source_field: source_field.into(),
        }
    }

    /// Has-many keyed on the source record's `id`.
    pub fn has_many_by_id(target: &Collection, target_field: impl Into<String>) -> Self {
        Self::has_many(target, target_field, "id")
    }

    /// Run the relation for `record`, narrowing `query` to the related
    /// records. The list is watched like any other `find`.
    pub fn resolve(&self, record: &Record, query: Query) -> Result<List> {
        match self {
            Relation::HasMany {
                target,
                target_field,
                source_field,
            } => {
                let collection = target.upgrade().ok_or(Error::CollectionDropped)?;
                let value = record.get(source_field).unwrap_or(Value::Null);
                collection.find(query.index(target_field.clone()).value(value))
            }
        }
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relation::HasMany {
                target_field,
                source_field,
                ..
            } => f
                .debug_struct("HasMany")
                .field("target_field", target_field)
                .field("source_field", source_field)
                .finish(),
        }
    }
}
