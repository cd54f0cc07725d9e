//! Schema setup for the SQLite backend.
//!
//! Bookkeeping tables (name maps, ownership edges, array entities, class
//! hierarchy) are managed by `rusqlite_migration` via SQLite's `user_version`
//! pragma, with migrations embedded at compile time via `include_str!`.
//!
//! Class tables cannot be migrated ahead of time because the set of classes
//! is discovered from the objects being saved. [`TableManager`] creates them
//! lazily, one table per class level, and refuses to when the session was
//! opened with schema creation disabled.

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension};
use rusqlite_migration::{Migrations, M};
use tracing::debug;

use relstash_core::{ClassDescriptor, TypeIntrospector, TypeRef, ROOT_CLASS};

use crate::config::StoreConfig;
use crate::dialect::Dialect;
use crate::error::StorageError;
use crate::values::sql_type;

/// Table of the universal supertype; carries the identity column.
pub const ROOT_TABLE: &str = "Object";

/// Array entity table.
pub const ARRAY_TABLE: &str = "ARRAY";

/// Surrogate id column present in every class table.
pub const ID_COLUMN: &str = "ID";

/// Discriminator column naming the immediate subtype of a row.
pub const REAL_CLASS_COLUMN: &str = "REAL_CLASS";

const BOOKKEEPING_TABLES: [&str; 7] = [
    "CLASS_NAMES",
    "TABLE_NAMES",
    "COLUMN_NAMES",
    "HAS_A",
    ARRAY_TABLE,
    "CLASS_HIERARCHY",
    ROOT_TABLE,
];

/// All schema migrations, applied in order via `user_version` tracking.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(include_str!("migrations/001_initial_schema.sql")),
        // Future migrations added here as new M::up(...) entries.
    ])
}

/// Opens (or creates) a SQLite database at `path` with the configured journal
/// mode and all pending migrations applied.
pub fn open_database(path: &str, config: &StoreConfig) -> Result<Connection, StorageError> {
    let mut conn = Connection::open(path)?;
    configure_and_migrate(&mut conn, config)?;
    Ok(conn)
}

/// Opens an in-memory SQLite database with all pending migrations applied.
pub fn open_in_memory(config: &StoreConfig) -> Result<Connection, StorageError> {
    let mut conn = Connection::open_in_memory()?;
    configure_and_migrate(&mut conn, config)?;
    Ok(conn)
}

/// Configures pragmas and applies pending migrations.
fn configure_and_migrate(conn: &mut Connection, config: &StoreConfig) -> Result<(), StorageError> {
    // journal_mode answers with a row, so it cannot go through execute().
    let _mode: String =
        conn.query_row(&format!("PRAGMA journal_mode = {}", config.journal_mode), [], |row| {
            row.get(0)
        })?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    migrations()
        .to_latest(conn)
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    Ok(())
}

/// Hex digits of the name hash appended to rewritten identifiers.
const NAME_HASH_LEN: usize = 12;

fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `name` with anything outside `[A-Za-z0-9_]` replaced by `_`, suffixed
/// with a hash of the original name so that distinct names never map to
/// the same identifier.
fn hashed_identifier(prefix: &str, name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let hash = blake3::hash(name.as_bytes()).to_hex();
    format!("{prefix}{sanitized}_{}", &hash.as_str()[..NAME_HASH_LEN])
}

/// Table name for a class. Plain identifiers are used as they are; names
/// that need rewriting, or that would collide with a bookkeeping or member
/// table, get a hashed suffix.
pub fn table_name_for(class: &str) -> String {
    if class == ROOT_CLASS {
        return ROOT_TABLE.to_string();
    }
    let reserved = BOOKKEEPING_TABLES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(class))
        || class.to_ascii_uppercase().starts_with("ARRAY_OF_");
    if reserved {
        hashed_identifier("C_", class)
    } else if is_plain_identifier(class) {
        class.to_string()
    } else {
        hashed_identifier("", class)
    }
}

/// Member table for arrays with the given component type.
pub fn member_table_for(component: &TypeRef) -> String {
    let name = component.name();
    if is_plain_identifier(&name) {
        format!("ARRAY_OF_{name}")
    } else {
        hashed_identifier("ARRAY_OF_", &name.replace("[]", "_ARR"))
    }
}

/// `CREATE TABLE` statement for one class level.
pub fn class_table_ddl(dialect: &dyn Dialect, descriptor: &ClassDescriptor) -> String {
    let mut columns = vec![
        format!("{} INTEGER PRIMARY KEY", dialect.quote(ID_COLUMN)),
        format!("{} INTEGER", dialect.quote(REAL_CLASS_COLUMN)),
    ];
    for prop in descriptor.stored_properties() {
        columns.push(format!("{} {}", dialect.quote(&prop.name), sql_type(&prop.ty)));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        dialect.quote(&table_name_for(&descriptor.name)),
        columns.join(", ")
    )
}

/// `CREATE TABLE` statement for the root table.
pub fn root_table_ddl(dialect: &dyn Dialect) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({} {}, {} INTEGER)",
        dialect.quote(ROOT_TABLE),
        dialect.quote(ID_COLUMN),
        dialect.identity_column(),
        dialect.quote(REAL_CLASS_COLUMN)
    )
}

/// `CREATE TABLE` statement for an array member table.
pub fn member_table_ddl(dialect: &dyn Dialect, table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({} INTEGER NOT NULL, \"POSITION\" INTEGER NOT NULL, \
         \"COMPONENT_CLASS\" INTEGER, \"VALUE\", PRIMARY KEY ({}, \"POSITION\"))",
        dialect.quote(table),
        dialect.quote(ID_COLUMN),
        dialect.quote(ID_COLUMN)
    )
}

/// Lazily creates class and array member tables.
///
/// Remembers which tables it has seen so each check hits `sqlite_master` at
/// most once per session. The memory must be dropped with [`forget`] when a
/// transaction rolls back, since the DDL rolls back with it.
///
/// [`forget`]: TableManager::forget
#[derive(Debug)]
pub struct TableManager {
    allow_create: bool,
    known_tables: HashSet<String>,
    prepared_classes: HashSet<String>,
}

impl TableManager {
    pub fn new(allow_create: bool) -> Self {
        TableManager {
            allow_create,
            known_tables: HashSet::new(),
            prepared_classes: HashSet::new(),
        }
    }

    /// Drops all remembered tables.
    pub fn forget(&mut self) {
        self.known_tables.clear();
        self.prepared_classes.clear();
    }

    /// True if the table exists in the database.
    pub fn table_exists(&mut self, conn: &Connection, table: &str) -> Result<bool, StorageError> {
        if self.known_tables.contains(table) {
            return Ok(true);
        }
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_some() {
            self.known_tables.insert(table.to_string());
        }
        Ok(found.is_some())
    }

    /// Checks a table before reading from it.
    ///
    /// Returns `Ok(false)` when the table is missing and could be created
    /// later (nothing has been stored in it yet), and a
    /// [`StorageError::SchemaPermission`] when it is missing and the session
    /// may never create it.
    pub fn require_readable(&mut self, conn: &Connection, table: &str) -> Result<bool, StorageError> {
        if self.table_exists(conn, table)? {
            return Ok(true);
        }
        if self.allow_create {
            Ok(false)
        } else {
            Err(StorageError::SchemaPermission {
                table: table.to_string(),
            })
        }
    }

    fn create(&mut self, conn: &Connection, table: &str, ddl: &str) -> Result<(), StorageError> {
        if self.table_exists(conn, table)? {
            return Ok(());
        }
        if !self.allow_create {
            return Err(StorageError::SchemaPermission {
                table: table.to_string(),
            });
        }
        debug!(table, "creating table");
        conn.execute(ddl, [])?;
        self.known_tables.insert(table.to_string());
        Ok(())
    }

    /// Ensures the root table exists.
    pub fn ensure_root(&mut self, conn: &Connection, dialect: &dyn Dialect) -> Result<(), StorageError> {
        self.create(conn, ROOT_TABLE, &root_table_ddl(dialect))
    }

    /// Ensures every table an instance of `class` is written to exists: one per
    /// class level, one per implemented interface, and the root. Records the
    /// corresponding class hierarchy edges.
    pub fn ensure_class(
        &mut self,
        conn: &Connection,
        dialect: &dyn Dialect,
        introspector: &dyn TypeIntrospector,
        class: &str,
    ) -> Result<(), StorageError> {
        if self.prepared_classes.contains(class) {
            return Ok(());
        }
        self.ensure_root(conn, dialect)?;
        let chain = introspector.chain(class)?;
        for level in &chain {
            let table = table_name_for(&level.name);
            self.create(conn, &table, &class_table_ddl(dialect, level))?;
            let superclass = level.superclass.as_deref().unwrap_or(ROOT_CLASS);
            record_hierarchy_edge(conn, superclass, &level.name)?;
        }
        for interface in introspector.interfaces_of(class)? {
            let descriptor = introspector.require_class(&interface)?;
            let table = table_name_for(&interface);
            self.create(conn, &table, &class_table_ddl(dialect, descriptor))?;
            record_hierarchy_edge(conn, &interface, class)?;
            for parent in descriptor.interfaces.iter().chain(descriptor.superclass.iter()) {
                record_hierarchy_edge(conn, parent, &interface)?;
            }
        }
        self.prepared_classes.insert(class.to_string());
        Ok(())
    }

    /// Ensures the member table for `component` exists and returns its name.
    pub fn ensure_member_table(
        &mut self,
        conn: &Connection,
        dialect: &dyn Dialect,
        component: &TypeRef,
    ) -> Result<String, StorageError> {
        self.ensure_root(conn, dialect)?;
        let table = member_table_for(component);
        self.create(conn, &table, &member_table_ddl(dialect, &table))?;
        Ok(table)
    }
}

fn record_hierarchy_edge(conn: &Connection, superclass: &str, subclass: &str) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR IGNORE INTO CLASS_HIERARCHY (SUPERCLASS, SUBCLASS) VALUES (?1, ?2)",
        params![superclass, subclass],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqliteDialect;
    use relstash_core::{ClassRegistry, PrimitiveType};

    fn person() -> ClassDescriptor {
        ClassDescriptor::new("Person")
            .property("name", TypeRef::Primitive(PrimitiveType::Text))
            .property("age", TypeRef::Primitive(PrimitiveType::I32))
            .property("friend", TypeRef::object("Person"))
            .transient_property("scratch", TypeRef::Primitive(PrimitiveType::I64))
    }

    #[test]
    fn class_ddl_skips_transient_properties() {
        insta::assert_snapshot!(
            class_table_ddl(&SqliteDialect, &person()),
            @r#"CREATE TABLE IF NOT EXISTS "Person" ("ID" INTEGER PRIMARY KEY, "REAL_CLASS" INTEGER, "name" TEXT, "age" INTEGER, "friend" INTEGER)"#
        );
    }

    #[test]
    fn root_ddl_uses_dialect_identity() {
        insta::assert_snapshot!(
            root_table_ddl(&SqliteDialect),
            @r#"CREATE TABLE IF NOT EXISTS "Object" ("ID" INTEGER PRIMARY KEY AUTOINCREMENT, "REAL_CLASS" INTEGER)"#
        );
    }

    #[test]
    fn plain_class_names_are_table_names() {
        assert_eq!(table_name_for("Person"), "Person");
        assert_eq!(table_name_for("app__Person"), "app__Person");
        assert_eq!(table_name_for(ROOT_CLASS), ROOT_TABLE);
        assert_eq!(
            member_table_for(&TypeRef::Primitive(PrimitiveType::I64)),
            "ARRAY_OF_i64"
        );
    }

    #[test]
    fn rewritten_names_never_collide() {
        let scoped = table_name_for("app::Person");
        assert!(scoped.starts_with("app__Person_"));
        assert_ne!(scoped, table_name_for("app__Person"));
        assert_ne!(scoped, table_name_for("app:;Person"));

        let array = table_name_for("Array");
        assert!(array.starts_with("C_Array_"));
        assert_ne!(array, table_name_for("C_Array"));
        assert_ne!(table_name_for("array"), array);
        assert!(table_name_for("ARRAY_OF_i64").starts_with("C_"));

        let matrix = member_table_for(&TypeRef::array_of(TypeRef::Primitive(PrimitiveType::I64)));
        assert!(matrix.starts_with("ARRAY_OF_i64_ARR_"));
        assert_ne!(matrix, member_table_for(&TypeRef::object("i64_ARR")));
    }

    #[test]
    fn migrations_are_valid() {
        migrations().validate().unwrap();
    }

    #[test]
    fn ensure_class_creates_every_level_and_records_hierarchy() {
        let conn = open_in_memory(&StoreConfig::default()).unwrap();
        let mut reg = ClassRegistry::new();
        reg.register(ClassDescriptor::interface("Named")).unwrap();
        reg.register(person().implements("Named")).unwrap();
        reg.register(ClassDescriptor::new("Employee").extends("Person"))
            .unwrap();

        let mut tables = TableManager::new(true);
        tables
            .ensure_class(&conn, &SqliteDialect, &reg, "Employee")
            .unwrap();
        for table in ["Object", "Person", "Employee", "Named"] {
            assert!(tables.table_exists(&conn, table).unwrap(), "{table} missing");
        }

        let edges: i64 = conn
            .query_row("SELECT COUNT(*) FROM CLASS_HIERARCHY", [], |row| row.get(0))
            .unwrap();
        // Object->Person, Person->Employee, Named->Employee
        assert_eq!(edges, 3);
    }

    #[test]
    fn disabled_creation_is_a_schema_permission_error() {
        let conn = open_in_memory(&StoreConfig::default()).unwrap();
        let mut reg = ClassRegistry::new();
        reg.register(person()).unwrap();
        let mut tables = TableManager::new(false);
        let err = tables
            .ensure_class(&conn, &SqliteDialect, &reg, "Person")
            .unwrap_err();
        assert!(matches!(err, StorageError::SchemaPermission { .. }));
        assert!(matches!(
            tables.require_readable(&conn, "Person"),
            Err(StorageError::SchemaPermission { .. })
        ));
    }
}
