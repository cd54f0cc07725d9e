//! Save orchestrator.
//!
//! `save` walks the object graph depth-first from a root node. A node never
//! seen by this session is inserted one row per class level, all levels
//! sharing the id drawn from the root table once the leaf level's references
//! are resolved. A node already known to the session cache whose row still
//! exists is updated in place, with its reference columns diffed against the
//! stored foreign keys so only changed ownership edges are touched.
//!
//! References to nodes still waiting for their id (cycles back to an
//! ancestor of the walk) are written as NULL and recorded in the
//! [`DelayedInsertionBuffer`](crate::delayed::DelayedInsertionBuffer); they
//! are patched as soon as the awaited node is assigned its id.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension};
use tracing::debug;

use relstash_core::{
    ArrayNode, ClassDescriptor, ClassKind, CoreError, Node, ObjectId, TypeRef, Value,
    ITEMS_PROPERTY, ROOT_CLASS,
};

use crate::array;
use crate::context::Ctx;
use crate::delayed::{DeferredEntry, DeferredWrite, SaveMark};
use crate::delete;
use crate::error::StorageError;
use crate::schema::{table_name_for, ID_COLUMN, REAL_CLASS_COLUMN};
use crate::types::StoredRef;
use crate::values::{describe, encode_inline};

/// Saves `root` and everything reachable from it, then anchors `root`
/// externally.
pub(crate) fn save_root(ctx: &mut Ctx<'_>, root: ObjectId) -> Result<StoredRef, StorageError> {
    let key = save_node(ctx, root)?.ok_or_else(|| {
        StorageError::integrity(format!("node {root} was still pending after its own save"))
    })?;
    let class = ctx.runtime_type_name(root)?;
    ctx.ownership().protect_external(&key, &class)?;

    let unresolved = ctx.buffer.pending_entries();
    if unresolved > 0 {
        let awaited: Vec<String> = ctx.buffer.awaited().map(|n| n.to_string()).collect();
        return Err(StorageError::integrity(format!(
            "{unresolved} deferred references never resolved (awaiting {})",
            awaited.join(", ")
        )));
    }

    let candidates = std::mem::take(&mut ctx.gc_candidates);
    for candidate in candidates {
        delete::collect_if_unreachable(ctx, &candidate)?;
    }
    Ok(key)
}

/// Saves one node. Returns `None` if the node is mid-save further up the
/// walk and has no id yet.
pub(crate) fn save_node(ctx: &mut Ctx<'_>, node: ObjectId) -> Result<Option<StoredRef>, StorageError> {
    match ctx.buffer.mark(node) {
        Some(SaveMark::Assigned(key)) => return Ok(Some(key.clone())),
        Some(SaveMark::Pending) => return Ok(None),
        None => {}
    }

    if let Some(key) = ctx.cache.key_of(node).cloned() {
        if ctx.row_exists(key.id)? {
            ctx.buffer.assign(node, key.clone());
            if key.is_array() {
                array::update(ctx, node, &key)?;
            } else {
                update_object(ctx, node, &key)?;
            }
            return Ok(Some(key));
        }
        // Deleted behind this session's back; store it again as new.
        ctx.cache.purge(&key);
    }

    let is_array = matches!(ctx.graph.node(node)?, Node::Array(_));
    let key = if is_array {
        array::insert(ctx, node)?
    } else {
        insert_object(ctx, node)?
    };
    Ok(Some(key))
}

/// Records the id of a node and patches every reference deferred on it.
pub(crate) fn assign(ctx: &mut Ctx<'_>, node: ObjectId, key: &StoredRef) -> Result<(), StorageError> {
    ctx.cache.store(key.clone(), node);
    ctx.buffer.assign(node, key.clone());
    resolve_deferred(ctx, node, key)
}

fn resolve_deferred(ctx: &mut Ctx<'_>, awaited: ObjectId, target: &StoredRef) -> Result<(), StorageError> {
    let entries = ctx.buffer.take_waiting(awaited);
    if entries.is_empty() {
        return Ok(());
    }
    let target_class = ctx.runtime_type_name(awaited)?;
    for entry in entries {
        let owner = ctx.buffer.assigned(entry.owner).cloned().ok_or_else(|| {
            StorageError::integrity(format!(
                "owner {} of a deferred reference to {awaited} has no id",
                entry.owner
            ))
        })?;
        let (table, changed) = match &entry.write {
            DeferredWrite::Column { table, column } => {
                let sql = format!(
                    "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                    ctx.dialect.quote(table),
                    ctx.dialect.quote(column),
                    ctx.dialect.quote(ID_COLUMN)
                );
                let changed = ctx.conn.prepare_cached(&sql)?.execute(params![target.id, owner.id])?;
                (table, changed)
            }
            DeferredWrite::Member { table, position } => {
                let sql = format!(
                    "UPDATE {} SET \"VALUE\" = ?1 WHERE {} = ?2 AND \"POSITION\" = ?3",
                    ctx.dialect.quote(table),
                    ctx.dialect.quote(ID_COLUMN)
                );
                let changed = ctx
                    .conn
                    .prepare_cached(&sql)?
                    .execute(params![target.id, owner.id, position])?;
                (table, changed)
            }
        };
        if changed != 1 {
            return Err(StorageError::UpdateCount {
                table: table.clone(),
                id: owner.id,
                expected: 1,
                actual: changed,
            });
        }
        ctx.ownership()
            .protect_internal(&owner, entry.relation.as_deref(), target, &target_class)?;
        debug!(%owner, %target, "resolved deferred reference");
    }
    Ok(())
}

/// Checks that `target` may be stored where `declared` is expected.
pub(crate) fn check_reference(
    ctx: &Ctx<'_>,
    declared: &TypeRef,
    target: ObjectId,
) -> Result<(), StorageError> {
    let mismatch = |found: String| StorageError::TypeMismatch {
        expected: declared.name(),
        found,
    };
    match (declared, ctx.graph.node(target)?) {
        (TypeRef::Object(class), _) if class == ROOT_CLASS => Ok(()),
        (TypeRef::Object(class), Node::Object(instance)) => {
            if ctx.introspector.is_subtype(&instance.class, class)? {
                Ok(())
            } else {
                Err(mismatch(instance.class.clone()))
            }
        }
        (TypeRef::Array(_), Node::Array(array)) => {
            let actual = array.type_ref();
            if &actual == declared {
                Ok(())
            } else {
                Err(mismatch(actual.name()))
            }
        }
        (_, node) => Err(mismatch(match node {
            Node::Object(instance) => instance.class.clone(),
            Node::Array(array) => array.type_ref().name(),
        })),
    }
}

/// Mirrors a collection's live contents into its `ITEMS` backing array.
fn sync_collection(ctx: &mut Ctx<'_>, node: ObjectId) -> Result<(), StorageError> {
    let instance = ctx.graph.object(node)?;
    let Some(contents) = &instance.contents else {
        return Ok(());
    };
    let elements = contents.flatten();
    let backing = instance.get(ITEMS_PROPERTY).as_ref_id();
    match backing {
        Some(items) if matches!(ctx.graph.node(items)?, Node::Array(_)) => {
            ctx.graph.array_mut(items)?.elements = elements;
        }
        _ => {
            let items = ctx
                .graph
                .add_array(ArrayNode::new(TypeRef::object(ROOT_CLASS), elements));
            ctx.graph.set(node, ITEMS_PROPERTY, items)?;
        }
    }
    Ok(())
}

fn class_levels(ctx: &Ctx<'_>, class: &str) -> Result<Vec<ClassDescriptor>, StorageError> {
    let descriptor = ctx.introspector.require_class(class)?;
    if matches!(descriptor.kind, ClassKind::Abstract | ClassKind::Interface) {
        return Err(CoreError::NotInstantiable {
            name: class.to_string(),
            reason: "only concrete classes can be stored".to_string(),
        }
        .into());
    }
    Ok(ctx
        .introspector
        .chain(class)?
        .into_iter()
        .cloned()
        .collect())
}

/// `REAL_CLASS` of the row at `levels[depth]`: the next level down, NULL at
/// the leaf.
fn real_class_at(
    ctx: &mut Ctx<'_>,
    levels: &[ClassDescriptor],
    depth: usize,
) -> Result<Option<i64>, StorageError> {
    match depth.checked_sub(1) {
        Some(below) => Ok(Some(ctx.class_id(&levels[below].name)?)),
        None => Ok(None),
    }
}

/// One reference column resolved for writing.
enum Resolved {
    Null,
    Key(StoredRef, String),
    Deferred(ObjectId),
}

fn resolve_reference(
    ctx: &mut Ctx<'_>,
    class: &str,
    property: &str,
    declared: &TypeRef,
    value: &Value,
) -> Result<Resolved, StorageError> {
    match value {
        Value::Null => Ok(Resolved::Null),
        Value::Ref(target) => {
            check_reference(ctx, declared, *target)?;
            match save_node(ctx, *target)? {
                Some(key) => {
                    let target_class = ctx.runtime_type_name(*target)?;
                    Ok(Resolved::Key(key, target_class))
                }
                None => Ok(Resolved::Deferred(*target)),
            }
        }
        other => Err(StorageError::TypeMismatch {
            expected: format!("{} reference for {class}.{property}", declared.name()),
            found: describe(other),
        }),
    }
}

fn insert_object(ctx: &mut Ctx<'_>, node: ObjectId) -> Result<StoredRef, StorageError> {
    ctx.buffer.begin(node);
    sync_collection(ctx, node)?;
    let class = ctx.graph.object(node)?.class.clone();
    let levels = class_levels(ctx, &class)?;
    ctx.tables
        .ensure_class(ctx.conn, ctx.dialect, ctx.introspector, &class)?;

    let leaf_table = table_name_for(&class);
    let top_class = levels
        .last()
        .map(|level| level.name.clone())
        .unwrap_or_else(|| class.clone());
    let mut key: Option<StoredRef> = None;

    for (depth, level) in levels.iter().enumerate() {
        let table = table_name_for(&level.name);
        let mut columns = vec![ID_COLUMN.to_string(), REAL_CLASS_COLUMN.to_string()];
        let mut values: Vec<SqlValue> = Vec::new();
        let mut edges: Vec<(String, StoredRef, String)> = Vec::new();
        let mut deferred: Vec<(String, ObjectId)> = Vec::new();

        for prop in level.stored_properties() {
            let value = ctx.graph.get(node, &prop.name)?.clone();
            let sql = if prop.ty.is_reference() {
                match resolve_reference(ctx, &class, &prop.name, &prop.ty, &value)? {
                    Resolved::Null => SqlValue::Null,
                    Resolved::Key(target, target_class) => {
                        let id = target.id;
                        edges.push((prop.name.clone(), target, target_class));
                        SqlValue::Integer(id)
                    }
                    Resolved::Deferred(target) => {
                        deferred.push((prop.name.clone(), target));
                        SqlValue::Null
                    }
                }
            } else {
                encode_inline(&prop.ty, &value, ctx.introspector)?
            };
            columns.push(prop.name.clone());
            values.push(sql);
        }

        let id = match &key {
            Some(key) => key.id,
            None => ctx.allocate_id(&top_class)?,
        };
        let real_class = real_class_at(ctx, &levels, depth)?;
        let mut row = vec![SqlValue::Integer(id), real_class.map_or(SqlValue::Null, SqlValue::Integer)];
        row.extend(values);
        insert_row(ctx, &table, &columns, row, id)?;

        // Deferred entries go in before the id is published, so a reference
        // to the node itself is patched by its own assignment.
        for (column, target) in deferred {
            ctx.buffer.defer(
                target,
                DeferredEntry {
                    write: DeferredWrite::Column {
                        table: table.clone(),
                        column: column.clone(),
                    },
                    owner: node,
                    relation: Some(column),
                },
            );
        }
        let owner = match &key {
            Some(key) => key.clone(),
            None => {
                let new_key = StoredRef::new(leaf_table.clone(), id);
                assign(ctx, node, &new_key)?;
                key = Some(new_key.clone());
                new_key
            }
        };
        for (relation, target, target_class) in edges {
            ctx.ownership()
                .protect_internal(&owner, Some(&relation), &target, &target_class)?;
        }
    }

    let key = key.ok_or_else(|| StorageError::integrity(format!("class {class} has no table levels")))?;

    let leaf_class = ctx.class_id(&class)?;
    for interface in ctx.introspector.interfaces_of(&class)? {
        let table = table_name_for(&interface);
        insert_row(
            ctx,
            &table,
            &[ID_COLUMN.to_string(), REAL_CLASS_COLUMN.to_string()],
            vec![SqlValue::Integer(key.id), SqlValue::Integer(leaf_class)],
            key.id,
        )?;
    }
    debug!(%key, class = %class, "inserted object");
    Ok(key)
}

fn insert_row(
    ctx: &Ctx<'_>,
    table: &str,
    columns: &[String],
    values: Vec<SqlValue>,
    id: i64,
) -> Result<(), StorageError> {
    let quoted: Vec<String> = columns.iter().map(|c| ctx.dialect.quote(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        ctx.dialect.quote(table),
        quoted.join(", "),
        placeholders.join(", ")
    );
    let inserted = ctx.conn.prepare_cached(&sql)?.execute(params_from_iter(values))?;
    if inserted != 1 {
        return Err(StorageError::UpdateCount {
            table: table.to_string(),
            id,
            expected: 1,
            actual: inserted,
        });
    }
    Ok(())
}

fn stored_foreign_key(
    ctx: &Ctx<'_>,
    table: &str,
    column: &str,
    id: i64,
) -> Result<Option<i64>, StorageError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        ctx.dialect.quote(column),
        ctx.dialect.quote(table),
        ctx.dialect.quote(ID_COLUMN)
    );
    let found: Option<Option<i64>> = ctx
        .conn
        .prepare_cached(&sql)?
        .query_row(params![id], |row| row.get(0))
        .optional()?;
    Ok(found.flatten())
}

fn update_object(ctx: &mut Ctx<'_>, node: ObjectId, key: &StoredRef) -> Result<(), StorageError> {
    sync_collection(ctx, node)?;
    let class = ctx.graph.object(node)?.class.clone();
    let levels = class_levels(ctx, &class)?;
    ctx.tables
        .ensure_class(ctx.conn, ctx.dialect, ctx.introspector, &class)?;
    let mut nulled: Vec<String> = Vec::new();

    for (depth, level) in levels.iter().enumerate() {
        let table = table_name_for(&level.name);
        let mut assignments = vec![REAL_CLASS_COLUMN.to_string()];
        let real_class = real_class_at(ctx, &levels, depth)?;
        let mut values = vec![real_class.map_or(SqlValue::Null, SqlValue::Integer)];

        for prop in level.stored_properties() {
            let value = ctx.graph.get(node, &prop.name)?.clone();
            let sql = if prop.ty.is_reference() {
                let old = stored_foreign_key(ctx, &table, &prop.name, key.id)?;
                match resolve_reference(ctx, &class, &prop.name, &prop.ty, &value)? {
                    Resolved::Null => {
                        nulled.push(prop.name.clone());
                        SqlValue::Null
                    }
                    Resolved::Key(target, target_class) => {
                        if old == Some(target.id) {
                            ctx.ownership().protect_internal_conditional(
                                key,
                                Some(&prop.name),
                                &target,
                                &target_class,
                            )?;
                        } else {
                            let released = ctx.ownership().release_relation(key, &prop.name)?;
                            ctx.gc_candidates.extend(released);
                            ctx.ownership()
                                .protect_internal(key, Some(&prop.name), &target, &target_class)?;
                            debug!(%key, relation = %prop.name, %target, "reference changed");
                        }
                        SqlValue::Integer(target.id)
                    }
                    Resolved::Deferred(target) => {
                        let released = ctx.ownership().release_relation(key, &prop.name)?;
                        ctx.gc_candidates.extend(released);
                        ctx.buffer.defer(
                            target,
                            DeferredEntry {
                                write: DeferredWrite::Column {
                                    table: table.clone(),
                                    column: prop.name.clone(),
                                },
                                owner: node,
                                relation: Some(prop.name.clone()),
                            },
                        );
                        SqlValue::Null
                    }
                }
            } else {
                encode_inline(&prop.ty, &value, ctx.introspector)?
            };
            assignments.push(prop.name.clone());
            values.push(sql);
        }

        let set: Vec<String> = assignments
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{} = ?{}", ctx.dialect.quote(column), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            ctx.dialect.quote(&table),
            set.join(", "),
            ctx.dialect.quote(ID_COLUMN),
            assignments.len() + 1
        );
        values.push(SqlValue::Integer(key.id));
        let updated = ctx.conn.prepare_cached(&sql)?.execute(params_from_iter(values))?;
        if updated != 1 {
            return Err(StorageError::UpdateCount {
                table,
                id: key.id,
                expected: 1,
                actual: updated,
            });
        }
    }

    // Null-out pass: a property that became NULL no longer owns anything.
    for relation in nulled {
        let released = ctx.ownership().release_relation(key, &relation)?;
        ctx.gc_candidates.extend(released);
    }
    debug!(%key, class = %class, "updated object");
    Ok(())
}
