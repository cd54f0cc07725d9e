//! [`Session`]: the transactional entry point implementing [`ObjectStore`].
//!
//! A session owns one SQLite connection, the in-memory [`ObjectGraph`] its
//! callers build and load into, and the caches that outlive single calls
//! (identity map, interned names, known tables). Each public operation opens
//! a transaction, runs to completion inside it, and commits; on any error the
//! transaction is dropped (rolled back) and the caches are reverted so the
//! session looks as if the call never happened.

use rusqlite::Connection;
use tracing::warn;

use relstash_core::{ObjectGraph, ObjectId, TypeIntrospector};

use crate::cache::SessionCache;
use crate::config::StoreConfig;
use crate::context::Ctx;
use crate::delayed::DelayedInsertionBuffer;
use crate::delete;
use crate::dialect::{Dialect, SqliteDialect};
use crate::error::StorageError;
use crate::filter::Filter;
use crate::hash::fingerprint;
use crate::hierarchy::ClassHierarchy;
use crate::load;
use crate::names::{NameMaps, Namespace};
use crate::ownership::{Ownership, OwnershipEdge};
use crate::save;
use crate::schema::{self, TableManager, ROOT_TABLE};
use crate::traits::ObjectStore;
use crate::types::StoredRef;

/// Which cache and graph a call runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// The session's own cache and graph.
    Shared,
    /// A throwaway cache over the session graph.
    FreshCache,
    /// A throwaway cache and graph.
    Scratch,
}

/// A persistence session over one SQLite database.
pub struct Session {
    conn: Connection,
    config: StoreConfig,
    dialect: Box<dyn Dialect>,
    introspector: Box<dyn TypeIntrospector>,
    names: NameMaps,
    tables: TableManager,
    cache: SessionCache,
    graph: ObjectGraph,
}

impl Session {
    /// Opens (or creates) a database file.
    pub fn open(
        path: &str,
        introspector: impl TypeIntrospector + 'static,
        config: StoreConfig,
    ) -> Result<Self, StorageError> {
        let conn = schema::open_database(path, &config)?;
        Ok(Self::with_connection(conn, introspector, config))
    }

    /// Opens an in-memory database (for testing).
    pub fn in_memory(
        introspector: impl TypeIntrospector + 'static,
        config: StoreConfig,
    ) -> Result<Self, StorageError> {
        let conn = schema::open_in_memory(&config)?;
        Ok(Self::with_connection(conn, introspector, config))
    }

    /// Wraps a connection that already has the bookkeeping migrations
    /// applied.
    pub fn with_connection(
        conn: Connection,
        introspector: impl TypeIntrospector + 'static,
        config: StoreConfig,
    ) -> Self {
        Session {
            conn,
            tables: TableManager::new(config.allow_schema_creation),
            config,
            dialect: Box::new(SqliteDialect),
            introspector: Box::new(introspector),
            names: NameMaps::new(),
            cache: SessionCache::new(),
            graph: ObjectGraph::new(),
        }
    }

    /// Replaces the SQL dialect.
    pub fn with_dialect(mut self, dialect: impl Dialect + 'static) -> Self {
        self.dialect = Box::new(dialect);
        self
    }

    pub fn graph(&self) -> &ObjectGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ObjectGraph {
        &mut self.graph
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The address `node` was saved as or loaded from, if any.
    pub fn stored_ref(&self, node: ObjectId) -> Option<&StoredRef> {
        self.cache.key_of(node)
    }

    /// Drops the identity map; later loads materialize new nodes.
    pub fn clear_cache(&mut self) {
        self.cache = SessionCache::new();
    }

    /// Ownership edges, optionally only those touching `id`.
    pub fn edges(&mut self, id: Option<i64>) -> Result<Vec<OwnershipEdge>, StorageError> {
        Ownership::new(&self.conn, &mut self.names).edges(id)
    }

    /// The persisted class hierarchy.
    pub fn hierarchy(&self) -> Result<ClassHierarchy, StorageError> {
        ClassHierarchy::load(&self.conn)
    }

    /// Row counts of the bookkeeping tables and the root table.
    pub fn stats(&mut self) -> Result<Vec<(String, i64)>, StorageError> {
        let mut tables: Vec<&str> = Namespace::ALL.iter().map(|ns| ns.table()).collect();
        tables.extend(["HAS_A", "ARRAY", "CLASS_HIERARCHY"]);
        if self.tables.table_exists(&self.conn, ROOT_TABLE)? {
            tables.push(ROOT_TABLE);
        }
        let mut counts = Vec::with_capacity(tables.len());
        for table in tables {
            let sql = format!("SELECT COUNT(*) FROM {}", self.dialect.quote(table));
            let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
            counts.push((table.to_string(), count));
        }
        Ok(counts)
    }

    fn run<T>(
        &mut self,
        op: &'static str,
        scope: Scope,
        f: impl FnOnce(&mut Ctx<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut fresh_cache = SessionCache::new();
        let mut scratch_graph = ObjectGraph::new();
        let (cache, graph) = match scope {
            Scope::Shared => (&mut self.cache, &mut self.graph),
            Scope::FreshCache => (&mut fresh_cache, &mut self.graph),
            Scope::Scratch => (&mut fresh_cache, &mut scratch_graph),
        };
        let max_in_list = self
            .config
            .max_in_list
            .unwrap_or_else(|| self.dialect.max_in_list());

        let tx = self.conn.transaction()?;
        cache.begin();
        let result = {
            let mut ctx = Ctx {
                conn: &tx,
                introspector: self.introspector.as_ref(),
                dialect: self.dialect.as_ref(),
                names: &mut self.names,
                tables: &mut self.tables,
                cache: &mut *cache,
                graph,
                buffer: DelayedInsertionBuffer::new(),
                gc_candidates: Vec::new(),
                max_in_list,
            };
            f(&mut ctx)
        };
        let outcome = match result {
            Ok(value) => tx.commit().map(|()| value).map_err(StorageError::from),
            Err(e) => {
                drop(tx);
                Err(e)
            }
        };
        match outcome {
            Ok(value) => {
                cache.commit();
                Ok(value)
            }
            Err(e) => {
                cache.rollback();
                self.names.clear();
                self.tables.forget();
                warn!(op, dialect = self.dialect.name(), error = %e, "rolled back");
                Err(e)
            }
        }
    }
}

impl ObjectStore for Session {
    fn save(&mut self, node: ObjectId) -> Result<StoredRef, StorageError> {
        self.run("save", Scope::Shared, |ctx| save::save_root(ctx, node))
    }

    fn load(&mut self, class: &str, id: i64) -> Result<Option<ObjectId>, StorageError> {
        self.run("load", Scope::Shared, |ctx| load::load_node(ctx, class, id))
    }

    fn load_fresh(&mut self, class: &str, id: i64) -> Result<Option<ObjectId>, StorageError> {
        self.run("load_fresh", Scope::FreshCache, |ctx| load::load_node(ctx, class, id))
    }

    fn delete(&mut self, class: &str, id: i64) -> Result<bool, StorageError> {
        self.run("delete", Scope::Shared, |ctx| delete::delete_object(ctx, class, id))
    }

    fn delete_objects(&mut self, class: &str, filter: &Filter) -> Result<usize, StorageError> {
        self.run("delete_objects", Scope::Shared, |ctx| {
            delete::delete_objects(ctx, class, filter)
        })
    }

    fn protect_internal(
        &mut self,
        owner: &StoredRef,
        relation: &str,
        property: &StoredRef,
        property_class: &str,
    ) -> Result<(), StorageError> {
        self.run("protect_internal", Scope::Shared, |ctx| {
            ctx.ownership()
                .protect_internal(owner, Some(relation), property, property_class)
        })
    }

    fn protect_internal_conditional(
        &mut self,
        owner: &StoredRef,
        relation: &str,
        property: &StoredRef,
        property_class: &str,
    ) -> Result<bool, StorageError> {
        self.run("protect_internal_conditional", Scope::Shared, |ctx| {
            ctx.ownership()
                .protect_internal_conditional(owner, Some(relation), property, property_class)
        })
    }

    fn protect_external(&mut self, property: &StoredRef, class: &str) -> Result<(), StorageError> {
        self.run("protect_external", Scope::Shared, |ctx| {
            ctx.ownership().protect_external(property, class)
        })
    }

    fn is_protected_external(&mut self, property: &StoredRef) -> Result<bool, StorageError> {
        self.run("is_protected_external", Scope::Shared, |ctx| {
            ctx.ownership().is_protected_external(property)
        })
    }

    fn unprotect_internal(
        &mut self,
        owner: &StoredRef,
        property: &StoredRef,
    ) -> Result<usize, StorageError> {
        self.run("unprotect_internal", Scope::Shared, |ctx| {
            ctx.ownership().unprotect_internal(owner, property)
        })
    }

    fn is_protected(&mut self, property: &StoredRef) -> Result<bool, StorageError> {
        self.run("is_protected", Scope::Shared, |ctx| {
            ctx.ownership().is_protected(property)
        })
    }

    fn collect_garbage(&mut self) -> Result<usize, StorageError> {
        self.run("collect_garbage", Scope::Shared, delete::collect_garbage)
    }

    fn has_changed(&mut self, node: ObjectId) -> Result<bool, StorageError> {
        let key = self
            .cache
            .key_of(node)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                what: format!("node {node} has not been saved or loaded"),
            })?;
        let current = fingerprint(&self.graph, node, self.introspector.as_ref())?;
        let class = match self.graph.node(node)? {
            relstash_core::Node::Object(instance) => instance.class.clone(),
            relstash_core::Node::Array(array) => array.type_ref().name(),
        };
        self.run("has_changed", Scope::Scratch, |ctx| {
            let Some(stored) = load::load_node(ctx, &class, key.id)? else {
                return Ok(true);
            };
            Ok(fingerprint(ctx.graph, stored, ctx.introspector)? != current)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relstash_core::{ClassDescriptor, ClassRegistry, Instance, PrimitiveType, TypeRef};

    fn registry() -> ClassRegistry {
        let mut reg = ClassRegistry::new();
        reg.register(
            ClassDescriptor::new("Person")
                .property("name", TypeRef::Primitive(PrimitiveType::Text))
                .property("friend", TypeRef::object("Person"))
                .property("age", TypeRef::Primitive(PrimitiveType::I8)),
        )
        .unwrap();
        reg
    }

    #[test]
    fn failed_save_rolls_back_rows_and_cache() {
        let mut session = Session::in_memory(registry(), StoreConfig::default()).unwrap();
        let ok = session
            .graph_mut()
            .add_object(Instance::new("Person").with("name", "Ann"));
        let bad = session
            .graph_mut()
            .add_object(Instance::new("Person").with("age", 1000).with("friend", ok));

        let err = session.save(bad).unwrap_err();
        assert!(matches!(err, StorageError::TypeMismatch { .. }));
        // `ok` was saved as part of the failed call and must not linger.
        assert_eq!(session.stored_ref(ok), None);
        assert!(session.edges(None).unwrap().is_empty());

        let key = session.save(ok).unwrap();
        assert_eq!(session.stored_ref(ok), Some(&key));
    }

    #[test]
    fn has_changed_requires_a_stored_node() {
        let mut session = Session::in_memory(registry(), StoreConfig::default()).unwrap();
        let node = session.graph_mut().add_object(Instance::new("Person"));
        assert!(matches!(
            session.has_changed(node),
            Err(StorageError::NotFound { .. })
        ));
        session.save(node).unwrap();
        assert!(!session.has_changed(node).unwrap());
        session.graph_mut().set(node, "name", "Bob").unwrap();
        assert!(session.has_changed(node).unwrap());
    }

    #[test]
    fn stats_count_bookkeeping_rows() {
        let mut session = Session::in_memory(registry(), StoreConfig::default()).unwrap();
        let node = session
            .graph_mut()
            .add_object(Instance::new("Person").with("name", "Ann"));
        session.save(node).unwrap();
        let stats = session.stats().unwrap();
        let count = |name: &str| stats.iter().find(|(t, _)| t == name).map(|(_, c)| *c);
        assert_eq!(count("HAS_A"), Some(1));
        assert_eq!(count("Object"), Some(1));
    }
}
