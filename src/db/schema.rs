// Database schema query helpers
// Row mapping for the library tables. Callers own transactions.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::constants::{DEFAULT_CATEGORY, UNKNOWN_MANUFACTURER};
use crate::error::Result;
use crate::library::types::{
    KnowledgeDoc, Patch, PatchFilter, PatchSet, PatchSetItem, Plugin, VendorCacheEntry,
};

// ----- Patch -----

const PATCH_COLUMNS: &str = "id, name, device, manufacturer, category, tags, sysex, parameters,
    patch_type, plugin_id, source_path, last_used, created, modified";

fn row_to_patch(row: &Row<'_>) -> rusqlite::Result<Patch> {
    let category: Option<String> = row.get(4)?;
    let tags: Option<String> = row.get(5)?;
    let parameters: Option<String> = row.get(7)?;
    let patch_type: Option<String> = row.get(8)?;

    Ok(Patch {
        id: row.get(0)?,
        name: row.get(1)?,
        device: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        manufacturer: row.get(3)?,
        category: category
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
        tags: tags
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default(),
        sysex: row.get(6)?,
        parameters: parameters.and_then(|p| serde_json::from_str(&p).ok()),
        patch_type: patch_type
            .and_then(|t| t.parse().ok())
            .unwrap_or_default(),
        plugin_id: row.get(9)?,
        source_path: row.get(10)?,
        last_used: row.get(11)?,
        created: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
        modified: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
    })
}

/// Insert a patch, or replace every field of an existing one
pub fn upsert_patch(conn: &Connection, patch: &Patch) -> Result<()> {
    let tags = serde_json::to_string(&patch.tags)?;
    let parameters = patch
        .parameters
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO patches (id, name, device, manufacturer, category, tags, sysex, parameters,
                              patch_type, plugin_id, source_path, last_used, created, modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            device = excluded.device,
            manufacturer = excluded.manufacturer,
            category = excluded.category,
            tags = excluded.tags,
            sysex = excluded.sysex,
            parameters = excluded.parameters,
            patch_type = excluded.patch_type,
            plugin_id = excluded.plugin_id,
            source_path = excluded.source_path,
            last_used = excluded.last_used,
            created = excluded.created,
            modified = excluded.modified",
        params![
            patch.id,
            patch.name,
            patch.device,
            patch.manufacturer,
            patch.category,
            tags,
            patch.sysex,
            parameters,
            patch.patch_type.as_str(),
            patch.plugin_id,
            patch.source_path,
            patch.last_used,
            patch.created,
            patch.modified,
        ],
    )?;
    Ok(())
}

pub fn get_patch(conn: &Connection, id: &str) -> Result<Option<Patch>> {
    let result = conn.query_row(
        &format!("SELECT {} FROM patches WHERE id = ?1", PATCH_COLUMNS),
        params![id],
        row_to_patch,
    ).optional()?;
    Ok(result)
}

pub fn patch_exists(conn: &Connection, id: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM patches WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// List patches. Column filters run in SQL; the free-text query runs on the
/// decoded rows so both backends share one matching rule.
pub fn list_patches(conn: &Connection, filter: &PatchFilter) -> Result<Vec<Patch>> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(device) = &filter.device {
        values.push(Value::Text(device.clone()));
        clauses.push(format!("device = ?{}", values.len()));
    }
    if let Some(category) = &filter.category {
        values.push(Value::Text(category.clone()));
        clauses.push(format!("category = ?{}", values.len()));
    }
    if let Some(patch_type) = filter.patch_type {
        values.push(Value::Text(patch_type.as_str().to_string()));
        clauses.push(format!("patch_type = ?{}", values.len()));
    }

    let mut sql = format!("SELECT {} FROM patches", PATCH_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY name COLLATE NOCASE, created");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), row_to_patch)?;

    let limit = filter.limit.unwrap_or(usize::MAX);
    let mut patches = Vec::new();
    for row in rows {
        let patch = row?;
        if !filter.matches_query(&patch) {
            continue;
        }
        patches.push(patch);
        if patches.len() >= limit {
            break;
        }
    }
    Ok(patches)
}

pub fn touch_patch(conn: &Connection, id: &str, at: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE patches SET last_used = ?2, modified = ?2 WHERE id = ?1",
        params![id, at],
    )?;
    Ok(n > 0)
}

pub fn delete_patch(conn: &Connection, id: &str) -> Result<bool> {
    conn.execute("DELETE FROM patch_set_items WHERE patch_id = ?1", params![id])?;
    let n = conn.execute("DELETE FROM patches WHERE id = ?1", params![id])?;
    Ok(n > 0)
}

/// Clear the whole library, join table and sets included
pub fn delete_all_patches(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM patch_set_items", [])?;
    conn.execute("DELETE FROM patch_sets", [])?;
    let n = conn.execute("DELETE FROM patches", [])?;
    Ok(n)
}

// ----- Patch Set -----

const SET_COLUMNS: &str = "id, name, device, description, created, modified";

fn row_to_set(row: &Row<'_>) -> rusqlite::Result<PatchSet> {
    Ok(PatchSet {
        id: row.get(0)?,
        name: row.get(1)?,
        device: row.get(2)?,
        description: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        created: row.get(4)?,
        modified: row.get(5)?,
    })
}

pub fn insert_set(conn: &Connection, set: &PatchSet) -> Result<()> {
    conn.execute(
        "INSERT INTO patch_sets (id, name, device, description, created, modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![set.id, set.name, set.device, set.description, set.created, set.modified],
    )?;
    Ok(())
}

pub fn update_set(conn: &Connection, set: &PatchSet) -> Result<bool> {
    let n = conn.execute(
        "UPDATE patch_sets SET name = ?2, description = ?3, modified = ?4 WHERE id = ?1",
        params![set.id, set.name, set.description, set.modified],
    )?;
    Ok(n > 0)
}

pub fn touch_set(conn: &Connection, id: &str, at: &str) -> Result<()> {
    conn.execute(
        "UPDATE patch_sets SET modified = ?2 WHERE id = ?1",
        params![id, at],
    )?;
    Ok(())
}

pub fn get_set(conn: &Connection, id: &str) -> Result<Option<PatchSet>> {
    let result = conn.query_row(
        &format!("SELECT {} FROM patch_sets WHERE id = ?1", SET_COLUMNS),
        params![id],
        row_to_set,
    ).optional()?;
    Ok(result)
}

pub fn list_sets(conn: &Connection, device: Option<&str>) -> Result<Vec<PatchSet>> {
    let sets = match device {
        Some(device) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM patch_sets WHERE device = ?1 ORDER BY name COLLATE NOCASE, created",
                SET_COLUMNS
            ))?;
            let rows = stmt.query_map(params![device], row_to_set)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM patch_sets ORDER BY name COLLATE NOCASE, created",
                SET_COLUMNS
            ))?;
            let rows = stmt.query_map([], row_to_set)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(sets)
}

pub fn delete_set(conn: &Connection, id: &str) -> Result<bool> {
    conn.execute("DELETE FROM patch_set_items WHERE set_id = ?1", params![id])?;
    let n = conn.execute("DELETE FROM patch_sets WHERE id = ?1", params![id])?;
    Ok(n > 0)
}

// ----- Patch Set Items -----

pub fn list_set_items(conn: &Connection, set_id: &str) -> Result<Vec<PatchSetItem>> {
    let mut stmt = conn.prepare(
        "SELECT set_id, patch_id, order_index FROM patch_set_items
         WHERE set_id = ?1
         ORDER BY order_index ASC, rowid ASC"
    )?;
    let items = stmt.query_map(params![set_id], |row| {
        Ok(PatchSetItem {
            set_id: row.get(0)?,
            patch_id: row.get(1)?,
            order_index: row.get(2)?,
        })
    })?.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn max_order_index(conn: &Connection, set_id: &str) -> Result<i64> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(order_index), 0) FROM patch_set_items WHERE set_id = ?1",
        params![set_id],
        |row| row.get(0),
    )?;
    Ok(max)
}

pub fn is_set_member(conn: &Connection, set_id: &str, patch_id: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM patch_set_items WHERE set_id = ?1 AND patch_id = ?2)",
        params![set_id, patch_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub fn insert_set_item(conn: &Connection, set_id: &str, patch_id: &str, order_index: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO patch_set_items (set_id, patch_id, order_index) VALUES (?1, ?2, ?3)",
        params![set_id, patch_id, order_index],
    )?;
    Ok(())
}

pub fn update_item_order(conn: &Connection, set_id: &str, patch_id: &str, order_index: i64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE patch_set_items SET order_index = ?3 WHERE set_id = ?1 AND patch_id = ?2",
        params![set_id, patch_id, order_index],
    )?;
    Ok(n > 0)
}

pub fn delete_set_item(conn: &Connection, set_id: &str, patch_id: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM patch_set_items WHERE set_id = ?1 AND patch_id = ?2",
        params![set_id, patch_id],
    )?;
    Ok(n > 0)
}

// ----- Plugin -----

const PLUGIN_COLUMNS: &str = "id, name, type, category, manufacturer, path, preset_count, created, modified";

fn row_to_plugin(row: &Row<'_>) -> rusqlite::Result<Plugin> {
    let manufacturer: Option<String> = row.get(4)?;
    Ok(Plugin {
        id: row.get(0)?,
        name: row.get(1)?,
        plugin_type: row.get(2)?,
        category: row.get(3)?,
        manufacturer: manufacturer
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_MANUFACTURER.to_string()),
        path: row.get(5)?,
        preset_count: row.get(6)?,
        created: row.get(7)?,
        modified: row.get(8)?,
    })
}

pub fn upsert_plugin(conn: &Connection, plugin: &Plugin) -> Result<()> {
    conn.execute(
        "INSERT INTO plugins (id, name, type, category, manufacturer, path, preset_count, created, modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            type = excluded.type,
            category = excluded.category,
            manufacturer = excluded.manufacturer,
            path = excluded.path,
            preset_count = excluded.preset_count,
            modified = excluded.modified",
        params![
            plugin.id,
            plugin.name,
            plugin.plugin_type,
            plugin.category,
            plugin.manufacturer,
            plugin.path,
            plugin.preset_count,
            plugin.created,
            plugin.modified,
        ],
    )?;
    Ok(())
}

pub fn get_plugin(conn: &Connection, id: &str) -> Result<Option<Plugin>> {
    let result = conn.query_row(
        &format!("SELECT {} FROM plugins WHERE id = ?1", PLUGIN_COLUMNS),
        params![id],
        row_to_plugin,
    ).optional()?;
    Ok(result)
}

pub fn list_plugins(conn: &Connection) -> Result<Vec<Plugin>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM plugins ORDER BY name COLLATE NOCASE, created",
        PLUGIN_COLUMNS
    ))?;
    let plugins = stmt.query_map([], row_to_plugin)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(plugins)
}

// ----- Vendor cache -----

pub fn get_vendor_entry(conn: &Connection, key: &str) -> Result<Option<VendorCacheEntry>> {
    let result = conn.query_row(
        "SELECT key, manufacturer, source_url, confidence, updated FROM vendor_cache WHERE key = ?1",
        params![key],
        |row| {
            Ok(VendorCacheEntry {
                key: row.get(0)?,
                manufacturer: row.get(1)?,
                source_url: row.get(2)?,
                confidence: row.get(3)?,
                updated: row.get(4)?,
            })
        },
    ).optional()?;
    Ok(result)
}

pub fn put_vendor_entry(conn: &Connection, entry: &VendorCacheEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO vendor_cache (key, manufacturer, source_url, confidence, updated)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(key) DO UPDATE SET
            manufacturer = excluded.manufacturer,
            source_url = excluded.source_url,
            confidence = excluded.confidence,
            updated = excluded.updated",
        params![entry.key, entry.manufacturer, entry.source_url, entry.confidence, entry.updated],
    )?;
    Ok(())
}

// ----- Knowledge docs -----

const DOC_COLUMNS: &str = "id, title, body, source, tags, created";

fn row_to_doc(row: &Row<'_>) -> rusqlite::Result<KnowledgeDoc> {
    let tags: Option<String> = row.get(4)?;
    Ok(KnowledgeDoc {
        id: row.get(0)?,
        title: row.get(1)?,
        body: row.get(2)?,
        source: row.get(3)?,
        tags: tags
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default(),
        created: row.get(5)?,
    })
}

pub fn insert_doc(conn: &Connection, doc: &KnowledgeDoc) -> Result<()> {
    let tags = serde_json::to_string(&doc.tags)?;
    conn.execute(
        "INSERT INTO knowledge_docs (id, title, body, source, tags, created)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![doc.id, doc.title, doc.body, doc.source, tags, doc.created],
    )?;
    Ok(())
}

pub fn get_doc(conn: &Connection, id: &str) -> Result<Option<KnowledgeDoc>> {
    let result = conn.query_row(
        &format!("SELECT {} FROM knowledge_docs WHERE id = ?1", DOC_COLUMNS),
        params![id],
        row_to_doc,
    ).optional()?;
    Ok(result)
}

pub fn list_docs(conn: &Connection) -> Result<Vec<KnowledgeDoc>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM knowledge_docs ORDER BY created DESC, title COLLATE NOCASE",
        DOC_COLUMNS
    ))?;
    let docs = stmt.query_map([], row_to_doc)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(docs)
}

pub fn delete_doc(conn: &Connection, id: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM knowledge_docs WHERE id = ?1", params![id])?;
    Ok(n > 0)
}

pub fn fts_index_doc(conn: &Connection, doc: &KnowledgeDoc) -> Result<()> {
    conn.execute(
        "INSERT INTO knowledge_docs_fts (doc_id, title, body) VALUES (?1, ?2, ?3)",
        params![doc.id, doc.title, doc.body],
    )?;
    Ok(())
}

pub fn fts_remove_doc(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM knowledge_docs_fts WHERE doc_id = ?1", params![id])?;
    Ok(())
}

/// Ranked doc ids for a full-text query. Every token is quoted so user input
/// can never be read as FTS syntax.
pub fn fts_search_ids(conn: &Connection, query: &str, limit: usize) -> Result<Vec<String>> {
    let match_expr = query
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ");
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT doc_id FROM knowledge_docs_fts WHERE knowledge_docs_fts MATCH ?1 ORDER BY rank LIMIT ?2"
    )?;
    let ids = stmt.query_map(params![match_expr, limit as i64], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

// ----- Counts -----

pub fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
    Ok(n as usize)
}
