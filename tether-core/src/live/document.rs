//! Sync documents.
//!
//! The sync tier delegates conflict resolution to an external CRDT. The
//! crate only needs three capabilities from it: merge a remote edit into a
//! field map, diff a field map against the document, and list the edits
//! still waiting to be acknowledged.
//!
//! Documents are called with no lock of the record or its feed held, so a
//! document may read the record or its collection while it runs.

use super::Fields;

pub trait SyncDocument: Send {
    /// Apply one remote edit to the document and mirror it into `fields`.
    fn pull(&mut self, edit: &serde_json::Value, fields: &mut Fields);

    /// Record local changes made to `fields` since the last push.
    fn push(&mut self, fields: &Fields);

    /// Edits not yet acknowledged by the server.
    fn edits(&self) -> Vec<serde_json::Value>;
}

/// Builds a document seeded from an initial snapshot.
pub trait DocumentFactory: Send + Sync {
    fn construct(&self, snapshot: &Fields) -> Box<dyn SyncDocument>;
}

impl<F> DocumentFactory for F
where
    F: Fn(&Fields) -> Box<dyn SyncDocument> + Send + Sync,
{
    fn construct(&self, snapshot: &Fields) -> Box<dyn SyncDocument> {
        self(snapshot)
    }
}
