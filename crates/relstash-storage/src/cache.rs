//! Session cache / identity map.
//!
//! Maps each stored row address to the one in-memory node that represents it,
//! and back. Entries are stored the moment an object obtains its id, before
//! its properties are filled, so cycles resolve to the same (partially
//! populated) node instead of looping.
//!
//! Mutations made during a transaction are journaled; [`SessionCache::rollback`]
//! undoes them so a failed call leaves no trace in the cache.

use std::collections::HashMap;

use relstash_core::ObjectId;

use crate::types::StoredRef;

#[derive(Debug)]
enum Undo {
    Ref(StoredRef, Option<ObjectId>),
    Node(ObjectId, Option<StoredRef>),
}

/// Identity map between stored rows and arena nodes.
#[derive(Debug, Default)]
pub struct SessionCache {
    by_ref: HashMap<StoredRef, ObjectId>,
    by_node: HashMap<ObjectId, StoredRef>,
    journal: Option<Vec<Undo>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The node cached for a stored row, if any.
    pub fn lookup(&self, key: &StoredRef) -> Option<ObjectId> {
        self.by_ref.get(key).copied()
    }

    /// The stored row a node was saved as or loaded from, if any.
    pub fn key_of(&self, node: ObjectId) -> Option<&StoredRef> {
        self.by_node.get(&node)
    }

    pub fn store(&mut self, key: StoredRef, node: ObjectId) {
        let prev_node = self.by_ref.insert(key.clone(), node);
        let prev_key = self.by_node.insert(node, key.clone());
        self.record(Undo::Ref(key, prev_node));
        self.record(Undo::Node(node, prev_key));
    }

    /// Evicts a row. Returns the node that was cached for it.
    pub fn purge(&mut self, key: &StoredRef) -> Option<ObjectId> {
        let node = self.by_ref.remove(key)?;
        let prev_key = self.by_node.remove(&node);
        self.record(Undo::Ref(key.clone(), Some(node)));
        self.record(Undo::Node(node, prev_key));
        Some(node)
    }

    pub fn len(&self) -> usize {
        self.by_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ref.is_empty()
    }

    /// Starts journaling mutations.
    pub fn begin(&mut self) {
        self.journal = Some(Vec::new());
    }

    /// Keeps every mutation since [`begin`](Self::begin).
    pub fn commit(&mut self) {
        self.journal = None;
    }

    /// Reverts every mutation since [`begin`](Self::begin).
    pub fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::Ref(key, Some(node)) => {
                    self.by_ref.insert(key, node);
                }
                Undo::Ref(key, None) => {
                    self.by_ref.remove(&key);
                }
                Undo::Node(node, Some(key)) => {
                    self.by_node.insert(node, key);
                }
                Undo::Node(node, None) => {
                    self.by_node.remove(&node);
                }
            }
        }
    }

    fn record(&mut self, undo: Undo) {
        if let Some(journal) = &mut self.journal {
            journal.push(undo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_lookup_both_directions() {
        let mut cache = SessionCache::new();
        let key = StoredRef::new("Person", 7);
        cache.store(key.clone(), ObjectId(3));
        assert_eq!(cache.lookup(&key), Some(ObjectId(3)));
        assert_eq!(cache.key_of(ObjectId(3)), Some(&key));
        assert_eq!(cache.lookup(&StoredRef::new("Pet", 7)), None);
    }

    #[test]
    fn purge_evicts_both_directions() {
        let mut cache = SessionCache::new();
        let key = StoredRef::new("Person", 7);
        cache.store(key.clone(), ObjectId(3));
        assert_eq!(cache.purge(&key), Some(ObjectId(3)));
        assert!(cache.is_empty());
        assert_eq!(cache.key_of(ObjectId(3)), None);
        assert_eq!(cache.purge(&key), None);
    }

    #[test]
    fn rollback_restores_state_before_begin() {
        let mut cache = SessionCache::new();
        let kept = StoredRef::new("Person", 1);
        cache.store(kept.clone(), ObjectId(0));

        cache.begin();
        cache.store(StoredRef::new("Person", 2), ObjectId(1));
        cache.purge(&kept);
        cache.rollback();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&kept), Some(ObjectId(0)));
        assert_eq!(cache.key_of(ObjectId(1)), None);
    }

    #[test]
    fn commit_keeps_changes() {
        let mut cache = SessionCache::new();
        cache.begin();
        cache.store(StoredRef::new("Person", 2), ObjectId(1));
        cache.commit();
        cache.rollback();
        assert_eq!(cache.len(), 1);
    }
}
