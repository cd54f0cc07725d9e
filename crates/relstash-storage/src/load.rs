//! Load orchestrator.
//!
//! Rows are decoded the way a tagged variant is: read the discriminator at
//! the requested class level, descend into the level it names, and repeat
//! until a level has none. The leaf class is then instantiated empty,
//! registered in the session cache, and only afterwards filled in, so a
//! reference cycle back to it resolves to the same node.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use relstash_core::{Collection, ObjectId, TypeRef, Value, ITEMS_PROPERTY, ROOT_CLASS};

use crate::array;
use crate::context::Ctx;
use crate::error::StorageError;
use crate::schema::{table_name_for, ID_COLUMN, REAL_CLASS_COLUMN};
use crate::types::StoredRef;
use crate::values::decode_inline;

/// Upper bound on discriminator hops; deeper chains mean corrupt rows.
const MAX_DESCENT: usize = 256;

/// The concrete runtime type of the row `id` seen from `class`, or `None`
/// if there is no such row. Array types are returned by name (`T[]`).
pub(crate) fn resolve_leaf(ctx: &mut Ctx<'_>, class: &str, id: i64) -> Result<Option<String>, StorageError> {
    if class.ends_with("[]") {
        return Ok(array_exists(ctx, id)?.then(|| class.to_string()));
    }
    let mut current = class.to_string();
    for _ in 0..MAX_DESCENT {
        let table = table_name_for(&current);
        if !ctx.tables.require_readable(ctx.conn, &table)? {
            return Ok(None);
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            ctx.dialect.quote(REAL_CLASS_COLUMN),
            ctx.dialect.quote(&table),
            ctx.dialect.quote(ID_COLUMN)
        );
        let discriminator: Option<Option<i64>> = ctx
            .conn
            .prepare_cached(&sql)?
            .query_row(params![id], |row| row.get(0))
            .optional()?;
        let next = match discriminator {
            None => return Ok(None),
            Some(None) => return Ok(Some(current)),
            Some(Some(number)) => ctx.class_name(number)?,
        };
        if next.ends_with("[]") {
            return Ok(Some(next));
        }
        if next != ROOT_CLASS && ctx.introspector.class(&next).is_none() {
            return Err(StorageError::TypeResolution { name: next });
        }
        if next == current {
            return Ok(Some(current));
        }
        current = next;
    }
    Err(StorageError::integrity(format!(
        "discriminator chain for {class}#{id} does not terminate"
    )))
}

fn array_exists(ctx: &Ctx<'_>, id: i64) -> Result<bool, StorageError> {
    let found: Option<i64> = ctx
        .conn
        .prepare_cached("SELECT 1 FROM \"ARRAY\" WHERE ID = ?1")?
        .query_row(params![id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Loads the object (or array) stored as `class`#`id` into the graph.
pub(crate) fn load_node(ctx: &mut Ctx<'_>, class: &str, id: i64) -> Result<Option<ObjectId>, StorageError> {
    // Fast path: the requested class is the leaf and already cached.
    if !class.ends_with("[]") {
        if let Some(node) = ctx.cache.lookup(&StoredRef::new(table_name_for(class), id)) {
            return Ok(Some(node));
        }
    }
    let Some(leaf) = resolve_leaf(ctx, class, id)? else {
        return Ok(None);
    };
    if leaf.ends_with("[]") {
        return array::read(ctx, id);
    }
    let key = StoredRef::new(table_name_for(&leaf), id);
    if let Some(node) = ctx.cache.lookup(&key) {
        return Ok(Some(node));
    }

    let instance = ctx.introspector.instantiate(&leaf)?;
    let node = ctx.graph.add_object(instance);
    ctx.cache.store(key.clone(), node);

    let levels: Vec<_> = ctx
        .introspector
        .chain(&leaf)?
        .into_iter()
        .cloned()
        .collect();
    for level in &levels {
        let props: Vec<_> = level.stored_properties().cloned().collect();
        let row = read_level(ctx, &table_name_for(&level.name), props.iter().map(|p| p.name.as_str()), id)?;
        for (prop, sql) in props.iter().zip(row) {
            let value = if prop.ty.is_reference() {
                load_reference(ctx, &prop.ty, sql)?
            } else {
                decode_inline(&prop.ty, sql, ctx.introspector)?
            };
            ctx.graph.set(node, prop.name.clone(), value)?;
        }
    }
    refill_collection(ctx, node)?;
    debug!(%key, "loaded object");
    Ok(Some(node))
}

fn read_level<'p>(
    ctx: &mut Ctx<'_>,
    table: &str,
    columns: impl Iterator<Item = &'p str>,
    id: i64,
) -> Result<Vec<SqlValue>, StorageError> {
    let columns: Vec<String> = columns.map(|c| ctx.dialect.quote(c)).collect();
    if columns.is_empty() {
        return Ok(Vec::new());
    }
    if !ctx.tables.require_readable(ctx.conn, table)? {
        return Err(StorageError::integrity(format!("level table {table} missing for row {id}")));
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        columns.join(", "),
        ctx.dialect.quote(table),
        ctx.dialect.quote(ID_COLUMN)
    );
    let width = columns.len();
    let row: Option<Vec<SqlValue>> = ctx
        .conn
        .prepare_cached(&sql)?
        .query_row(params![id], |row| (0..width).map(|i| row.get(i)).collect())
        .optional()?;
    row.ok_or_else(|| StorageError::integrity(format!("row {id} missing from level table {table}")))
}

fn load_reference(ctx: &mut Ctx<'_>, declared: &TypeRef, sql: SqlValue) -> Result<Value, StorageError> {
    let target = match sql {
        SqlValue::Null => return Ok(Value::Null),
        SqlValue::Integer(target) => target,
        other => {
            return Err(StorageError::TypeMismatch {
                expected: declared.name(),
                found: format!("stored {:?}", other.data_type()),
            })
        }
    };
    let loaded = match declared {
        TypeRef::Array(_) => array::read(ctx, target)?,
        TypeRef::Object(class) => load_node(ctx, class, target)?,
        _ => None,
    };
    loaded.map(Value::Ref).ok_or_else(|| {
        StorageError::integrity(format!("dangling {} reference to id {target}", declared.name()))
    })
}

/// Pushes the loaded backing array into the live collection, element-wise
/// for lists and pairwise for maps.
fn refill_collection(ctx: &mut Ctx<'_>, node: ObjectId) -> Result<(), StorageError> {
    let Some(items) = ctx.graph.get(node, ITEMS_PROPERTY)?.as_ref_id() else {
        return Ok(());
    };
    let elements = ctx.graph.array(items)?.elements.clone();
    let instance = ctx.graph.object_mut(node)?;
    let Some(contents) = &mut instance.contents else {
        return Ok(());
    };
    if matches!(contents, Collection::Map(_)) {
        for pair in elements.chunks(2) {
            if let [key, value] = pair {
                contents.insert(key.clone(), value.clone());
            }
        }
    } else {
        for element in elements {
            contents.push(element);
        }
    }
    Ok(())
}
