//! Error types for live collections.
//!
//! Errors fall into three families:
//!
//! - Remote failures (`Transport`, `Channel`, `Remote`). These never unwind
//!   the reconciliation loop; they are attached to the affected record or
//!   list and surfaced through the computation bus.
//! - Configuration failures (`Configuration`, `MissingIndex`). These are
//!   returned synchronously to the caller that supplied the bad input.
//! - Extension lookups (`UnknownMethod`, `UnknownRelation`,
//!   `CollectionDropped`).

use serde_json::Value;
use thiserror::Error;

/// All possible errors from the live-data layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// The initiating `get`/`find` call failed before a channel existed.
    #[error("transport error: {0}")]
    Transport(Value),

    /// An `error` event arrived on an established channel.
    #[error("channel error: {0}")]
    Channel(Value),

    /// A `create`, `update` or `delete` call was rejected by the service.
    #[error("remote call rejected: {0}")]
    Remote(Value),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("range query requires an index")]
    MissingIndex,

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("unknown relation: {0}")]
    UnknownRelation(String),

    #[error("target collection has been dropped")]
    CollectionDropped,
}

impl Error {
    /// The raw payload carried by a remote error, if any.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Error::Transport(v) | Error::Channel(v) | Error::Remote(v) => Some(v),
            _ => None,
        }
    }
}

/// Result type for live-data operations.
pub type Result<T> = std::result::Result<T, Error>;
