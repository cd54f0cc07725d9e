//! Ownership graph: the `HAS_A` edge table.
//!
//! Each stored reference (object property or array member) is mirrored by an
//! edge `owner --relation--> property`. An edge with no owner is an external
//! anchor, created for objects handed directly to a top-level save. Rows are
//! reclaimed by walking these edges rather than by any in-process reference
//! counting, so the decision is the same across restarts and connections.
//!
//! Tables, relations and classes are stored as interned numbers (see
//! [`crate::names`]).

use std::collections::{HashSet, VecDeque};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;
use crate::names::{NameMaps, Namespace};
use crate::types::StoredRef;

/// One decoded `HAS_A` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipEdge {
    /// `None` for an external anchor.
    pub owner: Option<StoredRef>,
    pub relation: Option<String>,
    pub property: StoredRef,
    pub property_class: String,
}

/// Outcome of walking edges backwards from an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    /// Some chain of owners ends at an external anchor.
    Anchored,
    /// No anchor is reachable. Holds the object and every transitive owner;
    /// all of them are garbage.
    Orphaned(Vec<StoredRef>),
}

/// Edge operations bound to one connection (normally the active transaction).
pub struct Ownership<'a> {
    conn: &'a Connection,
    names: &'a mut NameMaps,
}

impl<'a> Ownership<'a> {
    pub fn new(conn: &'a Connection, names: &'a mut NameMaps) -> Self {
        Ownership { conn, names }
    }

    fn table_number(&mut self, table: &str) -> Result<i64, StorageError> {
        self.names.number_of(self.conn, Namespace::Table, table)
    }

    fn find_table(&mut self, table: &str) -> Result<Option<i64>, StorageError> {
        self.names.find_number(self.conn, Namespace::Table, table)
    }

    fn relation_number(&mut self, relation: Option<&str>) -> Result<Option<i64>, StorageError> {
        relation
            .map(|r| self.names.number_of(self.conn, Namespace::Column, r))
            .transpose()
    }

    fn decode_ref(&mut self, table: i64, id: i64) -> Result<StoredRef, StorageError> {
        let table = self.names.name_of(self.conn, Namespace::Table, table)?;
        Ok(StoredRef::new(table, id))
    }

    /// Records `owner --relation--> property`. Idempotent.
    pub fn protect_internal(
        &mut self,
        owner: &StoredRef,
        relation: Option<&str>,
        property: &StoredRef,
        property_class: &str,
    ) -> Result<(), StorageError> {
        let owner_table = self.table_number(&owner.table)?;
        let relation_id = self.relation_number(relation)?;
        let property_table = self.table_number(&property.table)?;
        let class_id = self.names.number_of(self.conn, Namespace::Class, property_class)?;
        self.conn
            .prepare_cached(
                "INSERT OR IGNORE INTO HAS_A \
                 (OWNER_TABLE, OWNER_ID, RELATION, PROPERTY_TABLE, PROPERTY_ID, PROPERTY_CLASS) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?
            .execute(params![
                owner_table,
                owner.id,
                relation_id,
                property_table,
                property.id,
                class_id
            ])?;
        debug!(%owner, relation, %property, "protect");
        Ok(())
    }

    /// Like [`protect_internal`](Self::protect_internal), but checks for an
    /// equivalent edge first. Returns true if an edge was added.
    pub fn protect_internal_conditional(
        &mut self,
        owner: &StoredRef,
        relation: Option<&str>,
        property: &StoredRef,
        property_class: &str,
    ) -> Result<bool, StorageError> {
        let owner_table = self.table_number(&owner.table)?;
        let relation_id = self.relation_number(relation)?;
        let property_table = self.table_number(&property.table)?;
        let exists: bool = self
            .conn
            .prepare_cached(
                "SELECT EXISTS(SELECT 1 FROM HAS_A WHERE OWNER_TABLE = ?1 AND OWNER_ID = ?2 \
                 AND RELATION IS ?3 AND PROPERTY_TABLE = ?4 AND PROPERTY_ID = ?5)",
            )?
            .query_row(
                params![owner_table, owner.id, relation_id, property_table, property.id],
                |row| row.get(0),
            )?;
        if exists {
            return Ok(false);
        }
        self.protect_internal(owner, relation, property, property_class)?;
        Ok(true)
    }

    /// Anchors `property` as a top-level root.
    pub fn protect_external(&mut self, property: &StoredRef, class: &str) -> Result<(), StorageError> {
        let property_table = self.table_number(&property.table)?;
        let class_id = self.names.number_of(self.conn, Namespace::Class, class)?;
        self.conn
            .prepare_cached(
                "INSERT OR IGNORE INTO HAS_A \
                 (OWNER_TABLE, OWNER_ID, RELATION, PROPERTY_TABLE, PROPERTY_ID, PROPERTY_CLASS) \
                 VALUES (NULL, NULL, NULL, ?1, ?2, ?3)",
            )?
            .execute(params![property_table, property.id, class_id])?;
        debug!(%property, "anchor");
        Ok(())
    }

    pub fn is_protected_external(&mut self, property: &StoredRef) -> Result<bool, StorageError> {
        let Some(property_table) = self.find_table(&property.table)? else {
            return Ok(false);
        };
        let exists: bool = self
            .conn
            .prepare_cached(
                "SELECT EXISTS(SELECT 1 FROM HAS_A WHERE OWNER_ID IS NULL \
                 AND PROPERTY_TABLE = ?1 AND PROPERTY_ID = ?2)",
            )?
            .query_row(params![property_table, property.id], |row| row.get(0))?;
        Ok(exists)
    }

    /// Removes the external anchor of `property`. Returns the number of
    /// edges removed.
    pub fn unprotect_external(&mut self, property: &StoredRef) -> Result<usize, StorageError> {
        let Some(property_table) = self.find_table(&property.table)? else {
            return Ok(0);
        };
        let removed = self
            .conn
            .prepare_cached(
                "DELETE FROM HAS_A WHERE OWNER_ID IS NULL AND PROPERTY_TABLE = ?1 AND PROPERTY_ID = ?2",
            )?
            .execute(params![property_table, property.id])?;
        if removed > 0 {
            debug!(%property, "unanchor");
        }
        Ok(removed)
    }

    /// Removes every edge from `owner` to `property`, whatever its relation.
    pub fn unprotect_internal(
        &mut self,
        owner: &StoredRef,
        property: &StoredRef,
    ) -> Result<usize, StorageError> {
        let (Some(owner_table), Some(property_table)) =
            (self.find_table(&owner.table)?, self.find_table(&property.table)?)
        else {
            return Ok(0);
        };
        let removed = self
            .conn
            .prepare_cached(
                "DELETE FROM HAS_A WHERE OWNER_TABLE = ?1 AND OWNER_ID = ?2 \
                 AND PROPERTY_TABLE = ?3 AND PROPERTY_ID = ?4",
            )?
            .execute(params![owner_table, owner.id, property_table, property.id])?;
        debug!(%owner, %property, removed, "unprotect");
        Ok(removed)
    }

    /// Removes the edges `owner --relation--> *` and returns their targets.
    pub fn release_relation(
        &mut self,
        owner: &StoredRef,
        relation: &str,
    ) -> Result<Vec<StoredRef>, StorageError> {
        let Some(owner_table) = self.find_table(&owner.table)? else {
            return Ok(Vec::new());
        };
        let Some(relation_id) = self.names.find_number(self.conn, Namespace::Column, relation)? else {
            return Ok(Vec::new());
        };
        let targets: Vec<(i64, i64)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT PROPERTY_TABLE, PROPERTY_ID FROM HAS_A \
                 WHERE OWNER_TABLE = ?1 AND OWNER_ID = ?2 AND RELATION = ?3",
            )?;
            let rows = stmt.query_map(params![owner_table, owner.id, relation_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        self.conn
            .prepare_cached("DELETE FROM HAS_A WHERE OWNER_TABLE = ?1 AND OWNER_ID = ?2 AND RELATION = ?3")?
            .execute(params![owner_table, owner.id, relation_id])?;
        let mut released = Vec::with_capacity(targets.len());
        for (table, id) in targets {
            released.push(self.decode_ref(table, id)?);
        }
        debug!(%owner, relation, released = released.len(), "release relation");
        Ok(released)
    }

    /// Removes every edge owned by `owner` and returns their targets.
    pub fn release_all_owned_by(&mut self, owner: &StoredRef) -> Result<Vec<StoredRef>, StorageError> {
        let Some(owner_table) = self.find_table(&owner.table)? else {
            return Ok(Vec::new());
        };
        let targets: Vec<(i64, i64)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT DISTINCT PROPERTY_TABLE, PROPERTY_ID FROM HAS_A \
                 WHERE OWNER_TABLE = ?1 AND OWNER_ID = ?2",
            )?;
            let rows = stmt.query_map(params![owner_table, owner.id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        self.conn
            .prepare_cached("DELETE FROM HAS_A WHERE OWNER_TABLE = ?1 AND OWNER_ID = ?2")?
            .execute(params![owner_table, owner.id])?;
        let mut released = Vec::with_capacity(targets.len());
        for (table, id) in targets {
            released.push(self.decode_ref(table, id)?);
        }
        Ok(released)
    }

    /// Removes every edge naming `property` as its target, anchors included.
    pub fn remove_edges_to(&mut self, property: &StoredRef) -> Result<usize, StorageError> {
        let Some(property_table) = self.find_table(&property.table)? else {
            return Ok(0);
        };
        Ok(self
            .conn
            .prepare_cached("DELETE FROM HAS_A WHERE PROPERTY_TABLE = ?1 AND PROPERTY_ID = ?2")?
            .execute(params![property_table, property.id])?)
    }

    /// True iff any edge, internal or external, names `property`.
    pub fn is_protected(&mut self, property: &StoredRef) -> Result<bool, StorageError> {
        let Some(property_table) = self.find_table(&property.table)? else {
            return Ok(false);
        };
        let exists: bool = self
            .conn
            .prepare_cached(
                "SELECT EXISTS(SELECT 1 FROM HAS_A WHERE PROPERTY_TABLE = ?1 AND PROPERTY_ID = ?2)",
            )?
            .query_row(params![property_table, property.id], |row| row.get(0))?;
        Ok(exists)
    }

    /// Owners of `property`; `None` stands for an external anchor.
    pub fn owners_of(&mut self, property: &StoredRef) -> Result<Vec<Option<StoredRef>>, StorageError> {
        let Some(property_table) = self.find_table(&property.table)? else {
            return Ok(Vec::new());
        };
        let rows: Vec<(Option<i64>, Option<i64>)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT DISTINCT OWNER_TABLE, OWNER_ID FROM HAS_A \
                 WHERE PROPERTY_TABLE = ?1 AND PROPERTY_ID = ?2",
            )?;
            let rows = stmt.query_map(params![property_table, property.id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        let mut owners = Vec::with_capacity(rows.len());
        for row in rows {
            owners.push(match row {
                (Some(table), Some(id)) => Some(self.decode_ref(table, id)?),
                _ => None,
            });
        }
        Ok(owners)
    }

    /// Walks owner edges backwards from `start`.
    ///
    /// Plain "has any edge" checks keep unanchored cycles alive forever; this
    /// walk reports the whole owner closure as garbage instead when none of
    /// it is anchored.
    pub fn reachability(&mut self, start: &StoredRef) -> Result<Reachability, StorageError> {
        let mut seen: HashSet<StoredRef> = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([start.clone()]);
        seen.insert(start.clone());
        while let Some(current) = queue.pop_front() {
            for owner in self.owners_of(&current)? {
                let Some(owner) = owner else {
                    return Ok(Reachability::Anchored);
                };
                if seen.insert(owner.clone()) {
                    queue.push_back(owner);
                }
            }
            order.push(current);
        }
        Ok(Reachability::Orphaned(order))
    }

    /// Lists edges, optionally only those touching `id` as owner or property.
    pub fn edges(&mut self, id: Option<i64>) -> Result<Vec<OwnershipEdge>, StorageError> {
        type RawEdge = (Option<i64>, Option<i64>, Option<i64>, i64, i64, i64);
        let raw: Vec<RawEdge> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT OWNER_TABLE, OWNER_ID, RELATION, PROPERTY_TABLE, PROPERTY_ID, PROPERTY_CLASS \
                 FROM HAS_A WHERE ?1 IS NULL OR OWNER_ID = ?1 OR PROPERTY_ID = ?1 \
                 ORDER BY PROPERTY_ID, OWNER_ID",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        let mut edges = Vec::with_capacity(raw.len());
        for (owner_table, owner_id, relation, property_table, property_id, class) in raw {
            let owner = match (owner_table, owner_id) {
                (Some(table), Some(id)) => Some(self.decode_ref(table, id)?),
                _ => None,
            };
            let relation = relation
                .map(|r| self.names.name_of(self.conn, Namespace::Column, r))
                .transpose()?;
            edges.push(OwnershipEdge {
                owner,
                relation,
                property: self.decode_ref(property_table, property_id)?,
                property_class: self.names.name_of(self.conn, Namespace::Class, class)?,
            });
        }
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::schema::open_in_memory;

    fn person(id: i64) -> StoredRef {
        StoredRef::new("Person", id)
    }

    #[test]
    fn internal_edges_are_idempotent() {
        let conn = open_in_memory(&StoreConfig::default()).unwrap();
        let mut names = NameMaps::new();
        let mut own = Ownership::new(&conn, &mut names);
        own.protect_internal(&person(1), Some("friend"), &person(2), "Person")
            .unwrap();
        own.protect_internal(&person(1), Some("friend"), &person(2), "Person")
            .unwrap();
        assert!(!own
            .protect_internal_conditional(&person(1), Some("friend"), &person(2), "Person")
            .unwrap());
        assert_eq!(own.edges(None).unwrap().len(), 1);
        assert!(own.is_protected(&person(2)).unwrap());
        assert!(!own.is_protected(&person(1)).unwrap());
    }

    #[test]
    fn external_anchor_is_separate_from_internal_edges() {
        let conn = open_in_memory(&StoreConfig::default()).unwrap();
        let mut names = NameMaps::new();
        let mut own = Ownership::new(&conn, &mut names);
        own.protect_external(&person(2), "Person").unwrap();
        own.protect_external(&person(2), "Person").unwrap();
        own.protect_internal(&person(1), Some("friend"), &person(2), "Person")
            .unwrap();
        assert!(own.is_protected_external(&person(2)).unwrap());

        assert_eq!(own.unprotect_internal(&person(1), &person(2)).unwrap(), 1);
        assert!(own.is_protected(&person(2)).unwrap());
        assert_eq!(own.unprotect_external(&person(2)).unwrap(), 1);
        assert!(!own.is_protected(&person(2)).unwrap());
    }

    #[test]
    fn release_relation_returns_old_targets() {
        let conn = open_in_memory(&StoreConfig::default()).unwrap();
        let mut names = NameMaps::new();
        let mut own = Ownership::new(&conn, &mut names);
        own.protect_internal(&person(1), Some("friend"), &person(2), "Person")
            .unwrap();
        own.protect_internal(&person(1), Some("boss"), &person(3), "Person")
            .unwrap();
        assert_eq!(
            own.release_relation(&person(1), "friend").unwrap(),
            vec![person(2)]
        );
        assert!(own.release_relation(&person(1), "unknown").unwrap().is_empty());
        assert_eq!(own.release_all_owned_by(&person(1)).unwrap(), vec![person(3)]);
        assert!(own.edges(None).unwrap().is_empty());
    }

    #[test]
    fn reachability_distinguishes_anchored_from_orphaned_cycles() {
        let conn = open_in_memory(&StoreConfig::default()).unwrap();
        let mut names = NameMaps::new();
        let mut own = Ownership::new(&conn, &mut names);
        // 1 <-> 2 cycle, unanchored
        own.protect_internal(&person(1), Some("next"), &person(2), "Person")
            .unwrap();
        own.protect_internal(&person(2), Some("next"), &person(1), "Person")
            .unwrap();
        match own.reachability(&person(1)).unwrap() {
            Reachability::Orphaned(mut refs) => {
                refs.sort_by_key(|r| r.id);
                assert_eq!(refs, vec![person(1), person(2)]);
            }
            Reachability::Anchored => panic!("cycle should be orphaned"),
        }

        // 3 anchored, owns 1
        own.protect_external(&person(3), "Person").unwrap();
        own.protect_internal(&person(3), Some("next"), &person(1), "Person")
            .unwrap();
        assert_eq!(own.reachability(&person(2)).unwrap(), Reachability::Anchored);
    }

    #[test]
    fn edges_can_be_filtered_by_id() {
        let conn = open_in_memory(&StoreConfig::default()).unwrap();
        let mut names = NameMaps::new();
        let mut own = Ownership::new(&conn, &mut names);
        own.protect_external(&person(1), "Person").unwrap();
        own.protect_internal(&person(1), Some("friend"), &person(2), "Person")
            .unwrap();
        own.protect_internal(&person(4), Some("friend"), &person(5), "Person")
            .unwrap();
        let edges = own.edges(Some(1)).unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].owner, None);
        assert_eq!(edges[1].relation.as_deref(), Some("friend"));
        assert_eq!(edges[1].property_class, "Person");
    }
}
