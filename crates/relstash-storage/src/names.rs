//! Name interning: bidirectional name <-> integer maps.
//!
//! Ownership edges, array entities, and class discriminators store class,
//! table, and column names as small integers. Each namespace is a two-column
//! table; this module caches it per session with load-on-miss and
//! insert-on-unknown semantics. A miss reloads the whole table once before
//! inserting, since another connection may have interned the name first.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;

/// One of the interned name spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Namespace {
    Class,
    Table,
    Column,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Class, Namespace::Table, Namespace::Column];

    /// Backing table.
    pub fn table(self) -> &'static str {
        match self {
            Namespace::Class => "CLASS_NAMES",
            Namespace::Table => "TABLE_NAMES",
            Namespace::Column => "COLUMN_NAMES",
        }
    }
}

#[derive(Debug, Default)]
struct NameCache {
    by_name: HashMap<String, i64>,
    by_number: HashMap<i64, String>,
}

impl NameCache {
    fn insert(&mut self, number: i64, name: String) {
        self.by_name.insert(name.clone(), number);
        self.by_number.insert(number, name);
    }
}

/// Session-level caches for every [`Namespace`].
#[derive(Debug, Default)]
pub struct NameMaps {
    caches: HashMap<Namespace, NameCache>,
}

impl NameMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number interned for `name`, creating it if unknown.
    pub fn number_of(
        &mut self,
        conn: &Connection,
        ns: Namespace,
        name: &str,
    ) -> Result<i64, StorageError> {
        if let Some(number) = self.cached_number(ns, name) {
            return Ok(number);
        }
        self.reload(conn, ns)?;
        if let Some(number) = self.cached_number(ns, name) {
            return Ok(number);
        }

        let table = ns.table();
        conn.prepare_cached(&format!("INSERT OR IGNORE INTO {table} (NAME) VALUES (?1)"))?
            .execute(params![name])?;
        let number: i64 = conn
            .prepare_cached(&format!("SELECT ID FROM {table} WHERE NAME = ?1"))?
            .query_row(params![name], |row| row.get(0))?;
        debug!(namespace = table, name, number, "interned name");
        self.cache(ns).insert(number, name.to_string());
        Ok(number)
    }

    /// The name interned as `number`.
    ///
    /// An unknown number means the stored data references a name this
    /// database never interned, reported as a type resolution failure.
    pub fn name_of(
        &mut self,
        conn: &Connection,
        ns: Namespace,
        number: i64,
    ) -> Result<String, StorageError> {
        if let Some(name) = self.cached_name(ns, number) {
            return Ok(name);
        }
        self.reload(conn, ns)?;
        self.cached_name(ns, number)
            .ok_or_else(|| StorageError::TypeResolution {
                name: format!("{}#{number}", ns.table()),
            })
    }

    /// Looks a name up without interning it.
    pub fn find_number(
        &mut self,
        conn: &Connection,
        ns: Namespace,
        name: &str,
    ) -> Result<Option<i64>, StorageError> {
        if let Some(number) = self.cached_number(ns, name) {
            return Ok(Some(number));
        }
        let found: Option<i64> = conn
            .prepare_cached(&format!("SELECT ID FROM {} WHERE NAME = ?1", ns.table()))?
            .query_row(params![name], |row| row.get(0))
            .optional()?;
        if let Some(number) = found {
            self.cache(ns).insert(number, name.to_string());
        }
        Ok(found)
    }

    /// Drops every cached mapping. Called when a transaction rolls back,
    /// since interned rows written inside it are gone.
    pub fn clear(&mut self) {
        self.caches.clear();
    }

    fn cache(&mut self, ns: Namespace) -> &mut NameCache {
        self.caches.entry(ns).or_default()
    }

    fn cached_number(&self, ns: Namespace, name: &str) -> Option<i64> {
        self.caches.get(&ns)?.by_name.get(name).copied()
    }

    fn cached_name(&self, ns: Namespace, number: i64) -> Option<String> {
        self.caches.get(&ns)?.by_number.get(&number).cloned()
    }

    fn reload(&mut self, conn: &Connection, ns: Namespace) -> Result<(), StorageError> {
        let mut stmt = conn.prepare_cached(&format!("SELECT ID, NAME FROM {}", ns.table()))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        let mut fresh = NameCache::default();
        for row in rows {
            let (number, name) = row?;
            fresh.insert(number, name);
        }
        self.caches.insert(ns, fresh);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::schema::open_in_memory;

    #[test]
    fn interning_is_stable_and_per_namespace() {
        let conn = open_in_memory(&StoreConfig::default()).unwrap();
        let mut names = NameMaps::new();
        let a = names.number_of(&conn, Namespace::Class, "Person").unwrap();
        let b = names.number_of(&conn, Namespace::Class, "Person").unwrap();
        assert_eq!(a, b);
        let other = names.number_of(&conn, Namespace::Class, "Pet").unwrap();
        assert_ne!(a, other);

        names.number_of(&conn, Namespace::Table, "Person").unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM TABLE_NAMES", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(names.name_of(&conn, Namespace::Class, a).unwrap(), "Person");
    }

    #[test]
    fn miss_reloads_names_interned_elsewhere() {
        let conn = open_in_memory(&StoreConfig::default()).unwrap();
        let mut names = NameMaps::new();
        names.number_of(&conn, Namespace::Column, "name").unwrap();

        // Another session interns a name behind this cache's back.
        conn.execute("INSERT INTO COLUMN_NAMES (NAME) VALUES ('age')", [])
            .unwrap();
        let age_id: i64 = conn
            .query_row("SELECT ID FROM COLUMN_NAMES WHERE NAME = 'age'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(names.name_of(&conn, Namespace::Column, age_id).unwrap(), "age");
        assert_eq!(
            names.number_of(&conn, Namespace::Column, "age").unwrap(),
            age_id
        );
    }

    #[test]
    fn unknown_number_is_a_resolution_error() {
        let conn = open_in_memory(&StoreConfig::default()).unwrap();
        let mut names = NameMaps::new();
        assert!(matches!(
            names.name_of(&conn, Namespace::Class, 42),
            Err(StorageError::TypeResolution { .. })
        ));
        assert_eq!(
            names.find_number(&conn, Namespace::Class, "Nobody").unwrap(),
            None
        );
    }
}
