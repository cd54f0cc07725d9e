//! Per-call state shared by the orchestrators.
//!
//! A [`Ctx`] bundles the active transaction with the session's caches for the
//! duration of one top-level call. Every recursive save, load, and delete
//! inside that call goes through the same `Ctx`, so they all see the same
//! transaction and the same identity map.

use rusqlite::{params, Connection, OptionalExtension};

use relstash_core::{Node, ObjectGraph, ObjectId, TypeIntrospector};

use crate::cache::SessionCache;
use crate::delayed::DelayedInsertionBuffer;
use crate::dialect::Dialect;
use crate::error::StorageError;
use crate::names::{NameMaps, Namespace};
use crate::ownership::Ownership;
use crate::schema::{TableManager, ROOT_TABLE};
use crate::types::StoredRef;

pub(crate) struct Ctx<'a> {
    pub conn: &'a Connection,
    pub introspector: &'a dyn TypeIntrospector,
    pub dialect: &'a dyn Dialect,
    pub names: &'a mut NameMaps,
    pub tables: &'a mut TableManager,
    pub cache: &'a mut SessionCache,
    pub graph: &'a mut ObjectGraph,
    pub buffer: DelayedInsertionBuffer,
    /// Rows that lost an owner during this call; collected once the call's
    /// own edges are all in place.
    pub gc_candidates: Vec<StoredRef>,
    pub max_in_list: usize,
}

impl<'a> Ctx<'a> {
    pub fn ownership(&mut self) -> Ownership<'_> {
        Ownership::new(self.conn, &mut *self.names)
    }

    pub fn class_id(&mut self, name: &str) -> Result<i64, StorageError> {
        self.names.number_of(self.conn, Namespace::Class, name)
    }

    pub fn class_name(&mut self, number: i64) -> Result<String, StorageError> {
        self.names.name_of(self.conn, Namespace::Class, number)
    }

    pub fn table_id(&mut self, name: &str) -> Result<i64, StorageError> {
        self.names.number_of(self.conn, Namespace::Table, name)
    }

    pub fn table_name(&mut self, number: i64) -> Result<String, StorageError> {
        self.names.name_of(self.conn, Namespace::Table, number)
    }

    /// Draws a fresh id from the root table's identity column.
    pub fn allocate_id(&mut self, real_class: &str) -> Result<i64, StorageError> {
        self.tables.ensure_root(self.conn, self.dialect)?;
        let class_id = self.class_id(real_class)?;
        let sql = format!(
            "INSERT INTO {} (\"REAL_CLASS\") VALUES (?1)",
            self.dialect.quote(ROOT_TABLE)
        );
        self.conn.prepare_cached(&sql)?.execute(params![class_id])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// True if the root table holds a row for `id`.
    pub fn row_exists(&mut self, id: i64) -> Result<bool, StorageError> {
        if !self.tables.table_exists(self.conn, ROOT_TABLE)? {
            return Ok(false);
        }
        let sql = format!("SELECT 1 FROM {} WHERE \"ID\" = ?1", self.dialect.quote(ROOT_TABLE));
        let found: Option<i64> = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Runtime type name of a node: its class, or its array type name.
    pub fn runtime_type_name(&self, node: ObjectId) -> Result<String, StorageError> {
        Ok(match self.graph.node(node)? {
            Node::Object(instance) => instance.class.clone(),
            Node::Array(array) => array.type_ref().name(),
        })
    }
}
