//! Query matching.
//!
//! [`matchfind`] decides whether a set of fields would be returned by the
//! server for a given [`Query`]. It has to agree with the server's own
//! evaluation, so the comparison rules are deliberately literal:
//!
//! - RFC 3339 timestamps compare as epoch milliseconds.
//! - Arrays (and compound indexes) compare as the concatenation of their
//!   JSON-encoded members, i.e. lexicographically as strings.
//! - Everything else compares by strict equality; ordering is only defined
//!   between two numbers, two strings or two booleans.

use std::cmp::Ordering;

use chrono::DateTime;
use serde_json::{Map, Value};

use super::{canonical, Bound, Query};
use crate::error::{Error, Result};

/// Separator between the field names of a compound index.
pub const INDEX_SEPARATOR: char = '$';

/// A normalized comparison key.
#[derive(Debug, Clone, PartialEq)]
enum Key {
    /// The field is missing.
    Absent,
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    /// An object, compared structurally.
    Object(String),
}

impl Key {
    fn of(value: Option<&Value>) -> Key {
        match value {
            None => Key::Absent,
            Some(Value::Null) => Key::Null,
            Some(Value::Bool(b)) => Key::Bool(*b),
            Some(Value::Number(n)) => n.as_f64().map_or(Key::Null, Key::Number),
            Some(Value::String(s)) => match DateTime::parse_from_rfc3339(s) {
                Ok(date) => Key::Number(date.timestamp_millis() as f64),
                Err(_) => Key::Text(s.clone()),
            },
            Some(Value::Array(items)) => Key::compound(items.iter().map(Some)),
            Some(object @ Value::Object(_)) => {
                let mut out = String::new();
                canonical(object, &mut out);
                Key::Object(out)
            }
        }
    }

    /// Concatenate the JSON encodings of normalized members.
    fn compound<'a>(members: impl Iterator<Item = Option<&'a Value>>) -> Key {
        let mut out = String::new();
        for member in members {
            Key::of(member).encode(&mut out);
        }
        Key::Text(out)
    }

    fn encode(&self, out: &mut String) {
        match self {
            // An absent member contributes nothing to the compound key.
            Key::Absent => {}
            Key::Null => out.push_str("null"),
            Key::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Key::Number(n) => out.push_str(&format_number(*n)),
            Key::Text(s) => out.push_str(&Value::String(s.clone()).to_string()),
            Key::Object(s) => out.push_str(s),
        }
    }

    fn compare(&self, other: &Key) -> Option<Ordering> {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.partial_cmp(b),
            (Key::Text(a), Key::Text(b)) => Some(a.cmp(b)),
            (Key::Bool(a), Key::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    fn lt(&self, other: &Key) -> bool {
        self.compare(other) == Some(Ordering::Less)
    }

    fn le(&self, other: &Key) -> bool {
        matches!(self.compare(other), Some(Ordering::Less | Ordering::Equal))
    }
}

/// Integral numbers print without a fraction, like JSON encoders do.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Resolve one index component, falling back to a dotted path.
fn lookup<'a>(fields: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    if let Some(value) = fields.get(name) {
        return Some(value);
    }

    let mut parts = name.split('.');
    let mut current = fields.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Check whether `fields` satisfies `query`.
///
/// Returns [`Error::MissingIndex`] for a range query without an index.
pub fn matchfind(fields: &Map<String, Value>, query: &Query) -> Result<bool> {
    if query.is_range() {
        between(fields, query)
    } else {
        Ok(equals(fields, query))
    }
}

fn between(fields: &Map<String, Value>, query: &Query) -> Result<bool> {
    let index = query.index.as_deref().ok_or(Error::MissingIndex)?;
    let names: Vec<&str> = index.split(INDEX_SEPARATOR).collect();

    let value = if names.len() > 1 {
        Key::compound(names.iter().map(|name| lookup(fields, name)))
    } else {
        Key::of(lookup(fields, names[0]))
    };

    let mut matched = true;

    if let Some(start) = &query.start {
        let start = Key::of(Some(start));
        matched = match query.left.unwrap_or(Bound::Closed) {
            Bound::Open => start.lt(&value),
            Bound::Closed => start.le(&value),
        };
    }

    if let Some(end) = &query.end {
        let end = Key::of(Some(end));
        matched = matched
            && match query.right.unwrap_or(Bound::Open) {
                Bound::Closed => value.le(&end),
                Bound::Open => value.lt(&end),
            };
    }

    Ok(matched)
}

fn equals(fields: &Map<String, Value>, query: &Query) -> bool {
    let (Some(index), Some(expected)) = (&query.index, &query.value) else {
        return true;
    };

    let names: Vec<&str> = index.split(INDEX_SEPARATOR).collect();

    if names.len() == 1 {
        return Key::of(lookup(fields, names[0])) == Key::of(Some(expected));
    }

    names.iter().enumerate().all(|(i, name)| {
        let component = expected.as_array().and_then(|items| items.get(i));
        Key::of(lookup(fields, name)) == Key::of(component)
    })
}
