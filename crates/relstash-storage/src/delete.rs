//! Delete orchestrator.
//!
//! Deleting an object removes its external anchor and then asks the
//! ownership graph whether anything anchored still reaches it. Objects that
//! are still owned stay; objects that are not are destroyed together with
//! every owner in their unanchored closure, and each destroyed object's own
//! edges are released so its property objects get the same treatment.
//!
//! Bulk deletes take a fast path for classes that cannot own anything: their
//! unowned rows are removed with batched `DELETE ... WHERE ID IN (...)`
//! statements per level table. Everything else matching the filter goes
//! through the single-object algorithm afterwards.

use std::collections::{BTreeMap, HashSet};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter};
use tracing::{debug, info};

use relstash_core::ROOT_CLASS;

use crate::array;
use crate::context::Ctx;
use crate::error::StorageError;
use crate::filter::Filter;
use crate::hierarchy::ClassHierarchy;
use crate::load::resolve_leaf;
use crate::ownership::Reachability;
use crate::schema::{table_name_for, ROOT_TABLE};
use crate::types::StoredRef;

/// Rows kept in memory per page while sweeping the root table.
const SWEEP_PAGE: usize = 500;

/// Address of the row `id` seen from `class`, resolved to its leaf table.
pub(crate) fn leaf_ref(ctx: &mut Ctx<'_>, class: &str, id: i64) -> Result<Option<StoredRef>, StorageError> {
    Ok(resolve_leaf(ctx, class, id)?.map(|leaf| key_for(&leaf, id)))
}

fn key_for(leaf: &str, id: i64) -> StoredRef {
    if leaf.ends_with("[]") {
        StoredRef::array(id)
    } else {
        StoredRef::new(table_name_for(leaf), id)
    }
}

/// Deletes `class`#`id` unless something anchored still owns it.
/// Returns true iff at least one row was removed.
pub(crate) fn delete_object(ctx: &mut Ctx<'_>, class: &str, id: i64) -> Result<bool, StorageError> {
    let Some(key) = leaf_ref(ctx, class, id)? else {
        return Ok(false);
    };
    ctx.ownership().unprotect_external(&key)?;
    Ok(collect_if_unreachable(ctx, &key)? > 0)
}

/// Destroys `key` and its unanchored owner closure if no external anchor
/// reaches it. Returns the number of objects destroyed, cascades included.
pub(crate) fn collect_if_unreachable(ctx: &mut Ctx<'_>, key: &StoredRef) -> Result<usize, StorageError> {
    match ctx.ownership().reachability(key)? {
        Reachability::Anchored => Ok(0),
        Reachability::Orphaned(garbage) => {
            let mut destroyed = 0;
            for key in garbage {
                destroyed += destroy(ctx, &key)?;
            }
            Ok(destroyed)
        }
    }
}

/// Removes every row of `key`, its cache entry and all edges touching it,
/// then collects whatever it owned.
fn destroy(ctx: &mut Ctx<'_>, key: &StoredRef) -> Result<usize, StorageError> {
    let removed = if key.is_array() {
        array::destroy_rows(ctx, key.id)?
    } else {
        destroy_object_rows(ctx, key.id)?
    };
    ctx.cache.purge(key);
    ctx.ownership().remove_edges_to(key)?;
    let released = ctx.ownership().release_all_owned_by(key)?;

    let mut destroyed = usize::from(removed);
    if removed {
        debug!(%key, "destroyed");
    }
    for property in released {
        destroyed += collect_if_unreachable(ctx, &property)?;
    }
    Ok(destroyed)
}

/// Every table holding a row for an instance of `leaf`: its class levels,
/// its interfaces, and the root table.
fn level_tables(ctx: &Ctx<'_>, leaf: &str) -> Result<Vec<String>, StorageError> {
    let mut tables: Vec<String> = ctx
        .introspector
        .chain(leaf)?
        .iter()
        .map(|level| table_name_for(&level.name))
        .collect();
    tables.extend(
        ctx.introspector
            .interfaces_of(leaf)?
            .iter()
            .map(|interface| table_name_for(interface)),
    );
    tables.push(ROOT_TABLE.to_string());
    Ok(tables)
}

fn destroy_object_rows(ctx: &mut Ctx<'_>, id: i64) -> Result<bool, StorageError> {
    let Some(leaf) = resolve_leaf(ctx, ROOT_CLASS, id)? else {
        return Ok(false);
    };
    if leaf.ends_with("[]") {
        return array::destroy_rows(ctx, id);
    }
    let mut removed = 0;
    for table in level_tables(ctx, &leaf)? {
        if !ctx.tables.table_exists(ctx.conn, &table)? {
            continue;
        }
        let sql = format!(
            "DELETE FROM {} WHERE \"ID\" = ?1",
            ctx.dialect.quote(&table)
        );
        removed += ctx.conn.prepare_cached(&sql)?.execute(params![id])?;
    }
    Ok(removed > 0)
}

fn matching_ids(ctx: &mut Ctx<'_>, table: &str, filter: &Filter) -> Result<Vec<i64>, StorageError> {
    let sql = filter.select_ids_sql(ctx.dialect, table);
    let params = filter.sql_params()?;
    let mut stmt = ctx.conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Deletes every `class` row matching `filter`. Returns how many matching
/// rows are gone afterwards.
pub(crate) fn delete_objects(ctx: &mut Ctx<'_>, class: &str, filter: &Filter) -> Result<usize, StorageError> {
    let table = table_name_for(class);
    if !ctx.tables.require_readable(ctx.conn, &table)? {
        return Ok(0);
    }
    let matches = matching_ids(ctx, &table, filter)?;
    if matches.is_empty() {
        return Ok(0);
    }

    let mut by_leaf: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for &id in &matches {
        let Some(leaf) = resolve_leaf(ctx, class, id)? else {
            continue;
        };
        ctx.ownership().unprotect_external(&key_for(&leaf, id))?;
        by_leaf.entry(leaf).or_default().push(id);
    }

    let hierarchy = ClassHierarchy::load(ctx.conn)?;
    let mut candidates: HashSet<String> = hierarchy.subclasses(class).into_iter().collect();
    candidates.insert(class.to_string());

    let mut fast = 0;
    for (leaf, ids) in &by_leaf {
        if fast_path_eligible(ctx, &candidates, leaf)? {
            fast += fast_delete(ctx, leaf, ids)?;
        }
    }

    // Exhaustive pass: whatever still matches, including rows skipped above
    // because something owns them.
    let remaining = matching_ids(ctx, &table, filter)?;
    let mut slow = 0;
    for id in remaining {
        if let Some(key) = leaf_ref(ctx, class, id)? {
            slow += collect_if_unreachable(ctx, &key)?;
        }
    }

    let survivors = matching_ids(ctx, &table, filter)?.len();
    let count = matches.len().saturating_sub(survivors);
    info!(class, matched = matches.len(), fast, slow, deleted = count, "bulk delete");
    Ok(count)
}

fn fast_path_eligible(
    ctx: &Ctx<'_>,
    candidates: &HashSet<String>,
    leaf: &str,
) -> Result<bool, StorageError> {
    if leaf.ends_with("[]") || !candidates.contains(leaf) {
        return Ok(false);
    }
    Ok(!ctx.introspector.has_reference_properties(leaf)?)
}

/// Batched removal of unowned rows of a reference-free leaf class.
fn fast_delete(ctx: &mut Ctx<'_>, leaf: &str, ids: &[i64]) -> Result<usize, StorageError> {
    let leaf_table = table_name_for(leaf);
    let tables = level_tables(ctx, leaf)?;
    let mut deleted = 0;
    for chunk in ids.chunks(ctx.max_in_list.max(1)) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT T.\"ID\" FROM {} T WHERE T.\"ID\" IN ({placeholders}) \
             AND NOT EXISTS (SELECT 1 FROM HAS_A H WHERE H.PROPERTY_ID = T.\"ID\")",
            ctx.dialect.quote(&leaf_table)
        );
        let unowned: Vec<i64> = {
            let mut stmt = ctx.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        if unowned.is_empty() {
            continue;
        }
        let placeholders = vec!["?"; unowned.len()].join(", ");
        for table in &tables {
            if !ctx.tables.table_exists(ctx.conn, table)? {
                continue;
            }
            let sql = format!(
                "DELETE FROM {} WHERE \"ID\" IN ({placeholders})",
                ctx.dialect.quote(table)
            );
            ctx.conn
                .execute(&sql, params_from_iter(unowned.iter().map(|&id| SqlValue::Integer(id))))?;
        }
        for &id in &unowned {
            ctx.cache.purge(&StoredRef::new(leaf_table.clone(), id));
        }
        deleted += unowned.len();
    }
    debug!(class = leaf, deleted, "fast-path delete");
    Ok(deleted)
}

/// Destroys every stored object no external anchor reaches.
pub(crate) fn collect_garbage(ctx: &mut Ctx<'_>) -> Result<usize, StorageError> {
    if !ctx.tables.table_exists(ctx.conn, ROOT_TABLE)? {
        return Ok(0);
    }
    let sql = format!(
        "SELECT \"ID\" FROM {} WHERE \"ID\" > ?1 ORDER BY \"ID\" {}",
        ctx.dialect.quote(ROOT_TABLE),
        ctx.dialect.limit_offset(SWEEP_PAGE, 0)
    );
    let mut after = 0i64;
    let mut swept = 0;
    loop {
        let page: Vec<i64> = {
            let mut stmt = ctx.conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![after], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let Some(&last) = page.last() else {
            break;
        };
        for id in page {
            if let Some(key) = leaf_ref(ctx, ROOT_CLASS, id)? {
                swept += collect_if_unreachable(ctx, &key)?;
            }
        }
        after = last;
    }
    info!(swept, "garbage collection");
    Ok(swept)
}
