//! Delayed insertion buffer.
//!
//! A save walks the object graph depth-first. When it reaches an object that
//! is already being saved further up the same walk, that object has no id yet,
//! so the foreign key pointing at it cannot be written. The buffer records a
//! deferred entry instead; once the awaited object is assigned its id, the
//! entries waiting on it are drained and written as `UPDATE`s plus ownership
//! edges.
//!
//! The buffer also carries the per-save marks that detect re-entry: an object
//! reached twice in one save is written once.

use std::collections::HashMap;

use relstash_core::ObjectId;

use crate::types::StoredRef;

/// Where a deferred foreign key must be written once it is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredWrite {
    /// A reference column of one class level table, on the owner's row.
    Column { table: String, column: String },
    /// A member row of an array, on the owning array's id.
    Member { table: String, position: i64 },
}

/// A postponed foreign-key write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredEntry {
    pub write: DeferredWrite,
    /// The node whose row receives the foreign key.
    pub owner: ObjectId,
    /// Relation recorded on the ownership edge; `None` for array members.
    pub relation: Option<String>,
}

/// Per-save progress of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveMark {
    /// Being saved, no id yet.
    Pending,
    /// Has its id; further visits reuse it.
    Assigned(StoredRef),
}

/// Buffer scoped to one top-level save call.
#[derive(Debug, Default)]
pub struct DelayedInsertionBuffer {
    marks: HashMap<ObjectId, SaveMark>,
    waiting: HashMap<ObjectId, Vec<DeferredEntry>>,
}

impl DelayedInsertionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, node: ObjectId) -> Option<&SaveMark> {
        self.marks.get(&node)
    }

    pub fn begin(&mut self, node: ObjectId) {
        self.marks.insert(node, SaveMark::Pending);
    }

    pub fn assign(&mut self, node: ObjectId, key: StoredRef) {
        self.marks.insert(node, SaveMark::Assigned(key));
    }

    /// The id assigned to `node` during this save, if any.
    pub fn assigned(&self, node: ObjectId) -> Option<&StoredRef> {
        match self.marks.get(&node) {
            Some(SaveMark::Assigned(key)) => Some(key),
            _ => None,
        }
    }

    /// Defers a foreign key to `awaited` until it is assigned an id.
    pub fn defer(&mut self, awaited: ObjectId, entry: DeferredEntry) {
        self.waiting.entry(awaited).or_default().push(entry);
    }

    /// Removes and returns every entry waiting on `awaited`.
    pub fn take_waiting(&mut self, awaited: ObjectId) -> Vec<DeferredEntry> {
        self.waiting.remove(&awaited).unwrap_or_default()
    }

    /// Number of unresolved entries.
    pub fn pending_entries(&self) -> usize {
        self.waiting.values().map(Vec::len).sum()
    }

    /// Nodes with unresolved entries waiting on them.
    pub fn awaited(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.waiting.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(owner: u32, column: &str) -> DeferredEntry {
        DeferredEntry {
            write: DeferredWrite::Column {
                table: "Node".into(),
                column: column.into(),
            },
            owner: ObjectId(owner),
            relation: Some(column.into()),
        }
    }

    #[test]
    fn marks_track_progress() {
        let mut buffer = DelayedInsertionBuffer::new();
        assert_eq!(buffer.mark(ObjectId(0)), None);
        buffer.begin(ObjectId(0));
        assert_eq!(buffer.mark(ObjectId(0)), Some(&SaveMark::Pending));
        assert_eq!(buffer.assigned(ObjectId(0)), None);
        buffer.assign(ObjectId(0), StoredRef::new("Node", 1));
        assert_eq!(buffer.assigned(ObjectId(0)), Some(&StoredRef::new("Node", 1)));
    }

    #[test]
    fn entries_drain_per_awaited_node() {
        let mut buffer = DelayedInsertionBuffer::new();
        buffer.defer(ObjectId(0), entry(1, "next"));
        buffer.defer(ObjectId(0), entry(2, "prev"));
        buffer.defer(ObjectId(5), entry(1, "other"));
        assert_eq!(buffer.pending_entries(), 3);

        let drained = buffer.take_waiting(ObjectId(0));
        assert_eq!(drained, vec![entry(1, "next"), entry(2, "prev")]);
        assert_eq!(buffer.pending_entries(), 1);
        assert!(buffer.take_waiting(ObjectId(0)).is_empty());
        assert_eq!(buffer.awaited().collect::<Vec<_>>(), vec![ObjectId(5)]);
    }
}
