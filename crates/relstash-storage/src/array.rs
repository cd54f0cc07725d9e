//! Array codec.
//!
//! An array is stored as one row in the `ARRAY` entity table, naming its
//! component type, plus one member row per element in the member table for
//! that component (`ARRAY_OF_<component>`). A member row holds either the
//! inline value or the id of the referenced object or inner array, and
//! names the element's runtime type in `COMPONENT_CLASS` (NULL for a null
//! element). Multidimensional arrays are arrays whose members are arrays.
//!
//! Arrays draw their id from the root table like any object and are cached
//! by that id, so two owners of the same array id observe the same node.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use relstash_core::{ArrayNode, ObjectId, TypeRef, Value, ROOT_CLASS};

use crate::context::Ctx;
use crate::delayed::{DeferredEntry, DeferredWrite};
use crate::error::StorageError;
use crate::load;
use crate::save::{assign, check_reference, save_node};
use crate::schema::{ARRAY_TABLE, ROOT_TABLE};
use crate::types::StoredRef;
use crate::values::{decode_inline, describe, encode_inline, inline_type_of};

/// Inserts a new array entity and its members.
pub(crate) fn insert(ctx: &mut Ctx<'_>, node: ObjectId) -> Result<StoredRef, StorageError> {
    ctx.buffer.begin(node);
    let array = ctx.graph.array(node)?.clone();
    let type_name = array.type_ref().name();
    let id = ctx.allocate_id(&type_name)?;

    let member_table = ctx
        .tables
        .ensure_member_table(ctx.conn, ctx.dialect, &array.component)?;
    let component_table = ctx.table_id(&member_table)?;
    let component_class = ctx.class_id(&array.component.name())?;
    ctx.conn
        .prepare_cached(
            "INSERT INTO \"ARRAY\" (ID, COMPONENT_TABLE, COMPONENT_CLASS) VALUES (?1, ?2, ?3)",
        )?
        .execute(params![id, component_table, component_class])?;

    let key = StoredRef::array(id);
    assign(ctx, node, &key)?;
    write_members(ctx, node, &key, &array, &member_table)?;
    debug!(%key, array_type = %type_name, len = array.elements.len(), "inserted array");
    Ok(key)
}

/// Rewrites the members of an already stored array.
///
/// Every old member edge is released; elements that lose their last owner
/// are collected at the end of the save.
pub(crate) fn update(ctx: &mut Ctx<'_>, node: ObjectId, key: &StoredRef) -> Result<(), StorageError> {
    let array = ctx.graph.array(node)?.clone();
    let old_table = member_table_of(ctx, key.id)?;

    let released = ctx.ownership().release_all_owned_by(key)?;
    ctx.gc_candidates.extend(released);
    if let Some(old_table) = &old_table {
        delete_members(ctx, old_table, key.id)?;
    }

    let member_table = ctx
        .tables
        .ensure_member_table(ctx.conn, ctx.dialect, &array.component)?;
    if old_table.as_deref() != Some(member_table.as_str()) {
        let component_table = ctx.table_id(&member_table)?;
        let component_class = ctx.class_id(&array.component.name())?;
        let real_class = ctx.class_id(&array.type_ref().name())?;
        ctx.conn
            .prepare_cached("UPDATE \"ARRAY\" SET COMPONENT_TABLE = ?1, COMPONENT_CLASS = ?2 WHERE ID = ?3")?
            .execute(params![component_table, component_class, key.id])?;
        let sql = format!(
            "UPDATE {} SET \"REAL_CLASS\" = ?1 WHERE \"ID\" = ?2",
            ctx.dialect.quote(ROOT_TABLE)
        );
        ctx.conn.prepare_cached(&sql)?.execute(params![real_class, key.id])?;
    }
    write_members(ctx, node, key, &array, &member_table)?;
    debug!(%key, len = array.elements.len(), "updated array");
    Ok(())
}

fn write_members(
    ctx: &mut Ctx<'_>,
    node: ObjectId,
    key: &StoredRef,
    array: &ArrayNode,
    member_table: &str,
) -> Result<(), StorageError> {
    let sql = format!(
        "INSERT INTO {} (\"ID\", \"POSITION\", \"COMPONENT_CLASS\", \"VALUE\") VALUES (?1, ?2, ?3, ?4)",
        ctx.dialect.quote(member_table)
    );
    for (position, element) in array.elements.iter().enumerate() {
        let position = position as i64;
        let (class, value) = match element {
            Value::Null => (None, SqlValue::Null),
            Value::Ref(target) => {
                check_reference(ctx, &array.component, *target)?;
                let target_class = ctx.runtime_type_name(*target)?;
                let class_id = ctx.class_id(&target_class)?;
                match save_node(ctx, *target)? {
                    Some(target_key) => {
                        ctx.ownership()
                            .protect_internal(key, None, &target_key, &target_class)?;
                        (Some(class_id), SqlValue::Integer(target_key.id))
                    }
                    None => {
                        ctx.buffer.defer(
                            *target,
                            DeferredEntry {
                                write: DeferredWrite::Member {
                                    table: member_table.to_string(),
                                    position,
                                },
                                owner: node,
                                relation: None,
                            },
                        );
                        (Some(class_id), SqlValue::Null)
                    }
                }
            }
            inline => {
                let ty = if array.component.is_inline() {
                    array.component.clone()
                } else if array.component == TypeRef::object(ROOT_CLASS) {
                    inline_type_of(inline).ok_or_else(|| StorageError::TypeMismatch {
                        expected: array.component.name(),
                        found: describe(inline),
                    })?
                } else {
                    return Err(StorageError::TypeMismatch {
                        expected: array.component.name(),
                        found: describe(inline),
                    });
                };
                let value = encode_inline(&ty, inline, ctx.introspector)?;
                (Some(ctx.class_id(&ty.name())?), value)
            }
        };
        let inserted = ctx
            .conn
            .prepare_cached(&sql)?
            .execute(params![key.id, position, class, value])?;
        if inserted != 1 {
            return Err(StorageError::UpdateCount {
                table: member_table.to_string(),
                id: key.id,
                expected: 1,
                actual: inserted,
            });
        }
    }
    Ok(())
}

/// Member table recorded for an array id, or `None` if there is no entity.
fn member_table_of(ctx: &mut Ctx<'_>, id: i64) -> Result<Option<String>, StorageError> {
    let table: Option<i64> = ctx
        .conn
        .prepare_cached("SELECT COMPONENT_TABLE FROM \"ARRAY\" WHERE ID = ?1")?
        .query_row(params![id], |row| row.get(0))
        .optional()?;
    table.map(|t| ctx.table_name(t)).transpose()
}

fn delete_members(ctx: &mut Ctx<'_>, member_table: &str, id: i64) -> Result<usize, StorageError> {
    if !ctx.tables.table_exists(ctx.conn, member_table)? {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM {} WHERE \"ID\" = ?1",
        ctx.dialect.quote(member_table)
    );
    Ok(ctx.conn.prepare_cached(&sql)?.execute(params![id])?)
}

/// Loads an array by entity id. Returns `None` if no such array exists.
pub(crate) fn read(ctx: &mut Ctx<'_>, id: i64) -> Result<Option<ObjectId>, StorageError> {
    let key = StoredRef::array(id);
    if let Some(node) = ctx.cache.lookup(&key) {
        return Ok(Some(node));
    }
    let entity: Option<(i64, i64)> = ctx
        .conn
        .prepare_cached("SELECT COMPONENT_TABLE, COMPONENT_CLASS FROM \"ARRAY\" WHERE ID = ?1")?
        .query_row(params![id], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;
    let Some((component_table, component_class)) = entity else {
        return Ok(None);
    };
    let member_table = ctx.table_name(component_table)?;
    let component_name = ctx.class_name(component_class)?;
    let component = parse_type(ctx, &component_name)?;
    let rank = component.rank() + 1;

    let node = ctx
        .graph
        .add_array(ArrayNode::new(component.clone(), Vec::new()));
    ctx.cache.store(key, node);

    if !ctx.tables.require_readable(ctx.conn, &member_table)? {
        return Ok(Some(node));
    }
    let members: Vec<(i64, Option<i64>, SqlValue)> = {
        let sql = format!(
            "SELECT \"POSITION\", \"COMPONENT_CLASS\", \"VALUE\" FROM {} WHERE \"ID\" = ?1 ORDER BY \"POSITION\"",
            ctx.dialect.quote(&member_table)
        );
        let mut stmt = ctx.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut elements = Vec::with_capacity(members.len());
    for (position, class, value) in members {
        if position != elements.len() as i64 {
            return Err(StorageError::integrity(format!(
                "array {id} has a gap before position {position}"
            )));
        }
        let element = match class {
            None => Value::Null,
            Some(class) => {
                let name = ctx.class_name(class)?;
                decode_member(ctx, &name, value)?
            }
        };
        // Members of a rank-n array are arrays of rank n - 1.
        if let Some(inner) = element.as_ref_id().filter(|_| rank > 1) {
            let inner_rank = ctx.graph.array(inner)?.type_ref().rank();
            if inner_rank + 1 != rank {
                return Err(StorageError::integrity(format!(
                    "array {id} has rank {rank} but its member at {position} has rank {inner_rank}"
                )));
            }
        }
        elements.push(element);
    }
    ctx.graph.array_mut(node)?.elements = elements;
    debug!(id, rank, "read array");
    Ok(Some(node))
}

fn parse_type(ctx: &Ctx<'_>, name: &str) -> Result<TypeRef, StorageError> {
    TypeRef::parse(name, ctx.introspector).map_err(|_| StorageError::TypeResolution {
        name: name.to_string(),
    })
}

fn decode_member(ctx: &mut Ctx<'_>, runtime_type: &str, value: SqlValue) -> Result<Value, StorageError> {
    let ty = parse_type(ctx, runtime_type)?;
    if ty.is_inline() {
        return decode_inline(&ty, value, ctx.introspector);
    }
    let target = match value {
        // A deferred member that was never patched.
        SqlValue::Null => return Ok(Value::Null),
        SqlValue::Integer(target) => target,
        other => {
            return Err(StorageError::TypeMismatch {
                expected: format!("reference to {runtime_type}"),
                found: format!("stored {:?}", other.data_type()),
            })
        }
    };
    let loaded = match &ty {
        TypeRef::Array(_) => read(ctx, target)?,
        _ => load::load_node(ctx, runtime_type, target)?,
    };
    loaded.map(Value::Ref).ok_or_else(|| {
        StorageError::integrity(format!("array member refers to missing {runtime_type}#{target}"))
    })
}

/// Removes an array's entity, member, and root rows. Returns true if any
/// row was removed.
pub(crate) fn destroy_rows(ctx: &mut Ctx<'_>, id: i64) -> Result<bool, StorageError> {
    let mut removed = 0;
    if let Some(member_table) = member_table_of(ctx, id)? {
        removed += delete_members(ctx, &member_table, id)?;
    }
    removed += ctx
        .conn
        .prepare_cached("DELETE FROM \"ARRAY\" WHERE ID = ?1")?
        .execute(params![id])?;
    if ctx.tables.table_exists(ctx.conn, ROOT_TABLE)? {
        let sql = format!("DELETE FROM {} WHERE \"ID\" = ?1", ctx.dialect.quote(ROOT_TABLE));
        removed += ctx.conn.prepare_cached(&sql)?.execute(params![id])?;
    }
    debug!(table = ARRAY_TABLE, id, removed, "deleted array rows");
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SessionCache;
    use crate::config::StoreConfig;
    use crate::delayed::DelayedInsertionBuffer;
    use crate::dialect::SqliteDialect;
    use crate::names::NameMaps;
    use crate::schema::{member_table_for, open_in_memory, TableManager};
    use relstash_core::{ClassRegistry, ObjectGraph, PrimitiveType};

    fn i64_ty() -> TypeRef {
        TypeRef::Primitive(PrimitiveType::I64)
    }

    struct Fixture {
        conn: rusqlite::Connection,
        registry: ClassRegistry,
        names: NameMaps,
        tables: TableManager,
        cache: SessionCache,
        graph: ObjectGraph,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                conn: open_in_memory(&StoreConfig::default()).unwrap(),
                registry: ClassRegistry::new(),
                names: NameMaps::new(),
                tables: TableManager::new(true),
                cache: SessionCache::new(),
                graph: ObjectGraph::new(),
            }
        }

        fn ctx(&mut self) -> Ctx<'_> {
            Ctx {
                conn: &self.conn,
                introspector: &self.registry,
                dialect: &SqliteDialect,
                names: &mut self.names,
                tables: &mut self.tables,
                cache: &mut self.cache,
                graph: &mut self.graph,
                buffer: DelayedInsertionBuffer::new(),
                gc_candidates: Vec::new(),
                max_in_list: 999,
            }
        }
    }

    #[test]
    fn inline_members_keep_position_and_nulls() {
        let mut fx = Fixture::new();
        let node = fx.graph.add_array(ArrayNode::new(
            i64_ty(),
            vec![Value::Int(3), Value::Null, Value::Int(-1)],
        ));
        let key = insert(&mut fx.ctx(), node).unwrap();
        assert!(key.is_array());

        let rows: i64 = fx
            .conn
            .query_row("SELECT COUNT(*) FROM \"ARRAY_OF_i64\"", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 3);

        // Read back through an empty cache.
        fx.cache = SessionCache::new();
        let loaded = read(&mut fx.ctx(), key.id).unwrap().unwrap();
        assert_ne!(loaded, node);
        assert_eq!(
            fx.graph.array(loaded).unwrap().elements,
            vec![Value::Int(3), Value::Null, Value::Int(-1)]
        );
    }

    #[test]
    fn object_arrays_accept_inline_values() {
        let mut fx = Fixture::new();
        let node = fx.graph.add_array(ArrayNode::new(
            TypeRef::object(ROOT_CLASS),
            vec![Value::Text("a".into()), Value::Bool(true), Value::Float(1.5)],
        ));
        let key = insert(&mut fx.ctx(), node).unwrap();
        fx.cache = SessionCache::new();
        let loaded = read(&mut fx.ctx(), key.id).unwrap().unwrap();
        assert_eq!(
            fx.graph.array(loaded).unwrap().elements,
            vec![Value::Text("a".into()), Value::Bool(true), Value::Float(1.5)]
        );
    }

    #[test]
    fn typed_arrays_reject_foreign_inline_values() {
        let mut fx = Fixture::new();
        let node = fx
            .graph
            .add_array(ArrayNode::new(i64_ty(), vec![Value::Text("x".into())]));
        assert!(matches!(
            insert(&mut fx.ctx(), node),
            Err(StorageError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn nested_members_must_be_one_rank_lower() {
        let mut fx = Fixture::new();
        let inner = fx.graph.add_array(ArrayNode::new(i64_ty(), vec![Value::Int(7)]));
        let outer = fx.graph.add_array(ArrayNode::new(
            TypeRef::array_of(i64_ty()),
            vec![Value::Ref(inner)],
        ));
        let outer_key = insert(&mut fx.ctx(), outer).unwrap();
        let deeper = fx
            .graph
            .add_array(ArrayNode::new(TypeRef::array_of(i64_ty()), Vec::new()));
        let deeper_key = insert(&mut fx.ctx(), deeper).unwrap();

        fx.cache = SessionCache::new();
        let loaded = read(&mut fx.ctx(), outer_key.id).unwrap().unwrap();
        let loaded_inner = fx.graph.array(loaded).unwrap().elements[0]
            .as_ref_id()
            .unwrap();
        assert_eq!(
            fx.graph.array(loaded_inner).unwrap().elements,
            vec![Value::Int(7)]
        );

        // Repoint the member at a rank-2 array.
        let table = member_table_for(&TypeRef::array_of(i64_ty()));
        fx.conn
            .execute(
                &format!("UPDATE \"{table}\" SET \"VALUE\" = ?1 WHERE \"ID\" = ?2"),
                params![deeper_key.id, outer_key.id],
            )
            .unwrap();
        fx.cache = SessionCache::new();
        assert!(matches!(
            read(&mut fx.ctx(), outer_key.id),
            Err(StorageError::IntegrityError { .. })
        ));
    }

    #[test]
    fn missing_array_reads_as_none() {
        let mut fx = Fixture::new();
        assert_eq!(read(&mut fx.ctx(), 99).unwrap(), None);
    }

    #[test]
    fn destroy_removes_entity_members_and_root_row() {
        let mut fx = Fixture::new();
        let node = fx
            .graph
            .add_array(ArrayNode::new(i64_ty(), vec![Value::Int(1), Value::Int(2)]));
        let key = insert(&mut fx.ctx(), node).unwrap();
        assert!(destroy_rows(&mut fx.ctx(), key.id).unwrap());
        assert!(!destroy_rows(&mut fx.ctx(), key.id).unwrap());
        let objects: i64 = fx
            .conn
            .query_row("SELECT COUNT(*) FROM \"Object\"", [], |row| row.get(0))
            .unwrap();
        assert_eq!(objects, 0);
    }
}
