//! The [`ObjectStore`] trait: the public contract of a persistence session.
//!
//! Every method runs as one atomic unit: either everything it wrote is
//! committed, or nothing is and the session's caches are as they were.

use relstash_core::ObjectId;

use crate::error::StorageError;
use crate::filter::Filter;
use crate::types::StoredRef;

/// Persistence operations over an object graph.
pub trait ObjectStore {
    // -------------------------------------------------------------------
    // Object lifecycle
    // -------------------------------------------------------------------

    /// Saves `node` and everything reachable from it, anchoring `node` as a
    /// root. Returns the address it is stored under.
    fn save(&mut self, node: ObjectId) -> Result<StoredRef, StorageError>;

    /// Loads `class`#`id` (or the subclass instance stored under that id).
    ///
    /// Returns the node already in the session graph if this session has
    /// seen the row before, and `None` if there is no such row.
    fn load(&mut self, class: &str, id: i64) -> Result<Option<ObjectId>, StorageError>;

    /// Like [`load`](Self::load), but bypasses the session cache: every node
    /// of the returned graph is newly materialized.
    fn load_fresh(&mut self, class: &str, id: i64) -> Result<Option<ObjectId>, StorageError>;

    /// Deletes `class`#`id` if nothing anchored still owns it, cascading to
    /// whatever only it owned. Returns true iff any row was removed.
    fn delete(&mut self, class: &str, id: i64) -> Result<bool, StorageError>;

    /// Deletes every `class` row matching `filter`. Returns the number of
    /// matching rows removed.
    fn delete_objects(&mut self, class: &str, filter: &Filter) -> Result<usize, StorageError>;

    // -------------------------------------------------------------------
    // Ownership edges
    // -------------------------------------------------------------------

    fn protect_internal(
        &mut self,
        owner: &StoredRef,
        relation: &str,
        property: &StoredRef,
        property_class: &str,
    ) -> Result<(), StorageError>;

    /// Adds the edge only if an equivalent one is absent. Returns true if
    /// it was added.
    fn protect_internal_conditional(
        &mut self,
        owner: &StoredRef,
        relation: &str,
        property: &StoredRef,
        property_class: &str,
    ) -> Result<bool, StorageError>;

    fn protect_external(&mut self, property: &StoredRef, class: &str) -> Result<(), StorageError>;

    fn is_protected_external(&mut self, property: &StoredRef) -> Result<bool, StorageError>;

    /// Removes the edges from `owner` to `property`. Returns how many were
    /// removed.
    fn unprotect_internal(
        &mut self,
        owner: &StoredRef,
        property: &StoredRef,
    ) -> Result<usize, StorageError>;

    /// True iff any edge, internal or external, names `property`.
    fn is_protected(&mut self, property: &StoredRef) -> Result<bool, StorageError>;

    // -------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------

    /// Destroys every stored object no external anchor reaches. Returns the
    /// number destroyed.
    fn collect_garbage(&mut self) -> Result<usize, StorageError>;

    /// True if the stored graph under `node` differs from the in-memory one.
    fn has_changed(&mut self, node: ObjectId) -> Result<bool, StorageError>;
}
