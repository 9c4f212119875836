// SQLite storage backend

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use crate::db::{self, schema, SchemaReport};
use crate::error::{AtlasError, Result};
use super::backend::PatchLibraryBackend;
use super::types::{
    doc_matches, BackendKind, KnowledgeDoc, LibraryStats, Patch, PatchFilter, PatchSet,
    PatchSetItem, Plugin, VendorCacheEntry,
};

/// Relational store. One connection, serialized behind a mutex.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    fts_enabled: bool,
}

impl SqliteBackend {
    /// Open (or create) the database file and prepare its schema.
    /// Any failure is reported as `BackendUnavailable` so callers can fall back.
    pub fn open(path: &Path) -> Result<Self> {
        let (conn, report) = db::open_db(path).map_err(|e| {
            AtlasError::BackendUnavailable(format!("{}: {}", path.display(), e))
        })?;
        log::info!("Opened SQLite library at {}", path.display());
        Ok(Self::from_parts(conn, report))
    }

    pub fn open_in_memory() -> Result<Self> {
        let (conn, report) = db::open_memory_db()
            .map_err(|e| AtlasError::BackendUnavailable(e.to_string()))?;
        Ok(Self::from_parts(conn, report))
    }

    fn from_parts(conn: Connection, report: SchemaReport) -> Self {
        if !report.added_columns.is_empty() {
            log::info!("Upgraded legacy schema: {}", report.added_columns.join(", "));
        }
        Self {
            conn: Mutex::new(conn),
            fts_enabled: report.fts_enabled,
        }
    }

    /// Whether knowledge-doc search runs on the FTS5 index
    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AtlasError::Other("library connection lock poisoned".to_string()))
    }

    fn substring_search(conn: &Connection, query: &str, limit: usize) -> Result<Vec<KnowledgeDoc>> {
        Ok(schema::list_docs(conn)?
            .into_iter()
            .filter(|doc| doc_matches(doc, query))
            .take(limit)
            .collect())
    }
}

impl PatchLibraryBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    // ----- Patches -----

    fn save_patch(&self, patch: &Patch) -> Result<()> {
        let conn = self.lock()?;
        schema::upsert_patch(&conn, patch)
    }

    fn get_patch(&self, id: &str) -> Result<Option<Patch>> {
        let conn = self.lock()?;
        schema::get_patch(&conn, id)
    }

    fn list_patches(&self, filter: &PatchFilter) -> Result<Vec<Patch>> {
        let conn = self.lock()?;
        schema::list_patches(&conn, filter)
    }

    fn touch_patch(&self, id: &str, at: &str) -> Result<bool> {
        let conn = self.lock()?;
        schema::touch_patch(&conn, id, at)
    }

    fn delete_patch(&self, id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let deleted = schema::delete_patch(&tx, id)?;
        tx.commit()?;
        Ok(deleted)
    }

    fn delete_all_patches(&self) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = schema::delete_all_patches(&tx)?;
        tx.commit()?;
        Ok(removed)
    }

    // ----- Patch sets -----

    fn insert_set(&self, set: &PatchSet) -> Result<()> {
        let conn = self.lock()?;
        schema::insert_set(&conn, set)
    }

    fn update_set(&self, set: &PatchSet) -> Result<bool> {
        let conn = self.lock()?;
        schema::update_set(&conn, set)
    }

    fn get_set(&self, id: &str) -> Result<Option<PatchSet>> {
        let conn = self.lock()?;
        schema::get_set(&conn, id)
    }

    fn list_sets(&self, device: Option<&str>) -> Result<Vec<PatchSet>> {
        let conn = self.lock()?;
        schema::list_sets(&conn, device)
    }

    fn delete_set(&self, id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let deleted = schema::delete_set(&tx, id)?;
        tx.commit()?;
        Ok(deleted)
    }

    fn set_items(&self, set_id: &str) -> Result<Vec<PatchSetItem>> {
        let conn = self.lock()?;
        schema::list_set_items(&conn, set_id)
    }

    fn add_set_items(&self, set_id: &str, patch_ids: &[String], at: &str) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut next = schema::max_order_index(&tx, set_id)? + 1;
        let mut added = 0;
        for patch_id in patch_ids {
            if !schema::patch_exists(&tx, patch_id)? {
                log::debug!("Skipping unknown patch {} for set {}", patch_id, set_id);
                continue;
            }
            if schema::is_set_member(&tx, set_id, patch_id)? {
                continue;
            }
            schema::insert_set_item(&tx, set_id, patch_id, next)?;
            next += 1;
            added += 1;
        }
        if added > 0 {
            schema::touch_set(&tx, set_id, at)?;
        }

        tx.commit()?;
        Ok(added)
    }

    fn reorder_set_items(&self, set_id: &str, ordered: &[String], at: &str) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut seen = HashSet::new();
        let mut position = 0i64;
        for patch_id in ordered {
            if !seen.insert(patch_id.as_str()) {
                continue;
            }
            if schema::update_item_order(&tx, set_id, patch_id, position + 1)? {
                position += 1;
            }
        }
        if position > 0 {
            schema::touch_set(&tx, set_id, at)?;
        }

        tx.commit()?;
        Ok(position as usize)
    }

    fn remove_set_item(&self, set_id: &str, patch_id: &str, at: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = schema::delete_set_item(&tx, set_id, patch_id)?;
        if removed {
            schema::touch_set(&tx, set_id, at)?;
        }
        tx.commit()?;
        Ok(removed)
    }

    // ----- Plugins -----

    fn upsert_plugin(&self, plugin: &Plugin) -> Result<()> {
        let conn = self.lock()?;
        schema::upsert_plugin(&conn, plugin)
    }

    fn get_plugin(&self, id: &str) -> Result<Option<Plugin>> {
        let conn = self.lock()?;
        schema::get_plugin(&conn, id)
    }

    fn list_plugins(&self) -> Result<Vec<Plugin>> {
        let conn = self.lock()?;
        schema::list_plugins(&conn)
    }

    // ----- Vendor cache -----

    fn vendor_cache_get(&self, key: &str) -> Result<Option<VendorCacheEntry>> {
        let conn = self.lock()?;
        schema::get_vendor_entry(&conn, key)
    }

    fn vendor_cache_put(&self, entry: &VendorCacheEntry) -> Result<()> {
        let conn = self.lock()?;
        schema::put_vendor_entry(&conn, entry)
    }

    // ----- Knowledge docs -----

    fn insert_doc(&self, doc: &KnowledgeDoc) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        schema::insert_doc(&tx, doc)?;
        if self.fts_enabled {
            schema::fts_index_doc(&tx, doc)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list_docs(&self) -> Result<Vec<KnowledgeDoc>> {
        let conn = self.lock()?;
        schema::list_docs(&conn)
    }

    fn delete_doc(&self, id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if self.fts_enabled {
            schema::fts_remove_doc(&tx, id)?;
        }
        let deleted = schema::delete_doc(&tx, id)?;
        tx.commit()?;
        Ok(deleted)
    }

    fn search_docs(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeDoc>> {
        let conn = self.lock()?;
        if !self.fts_enabled {
            return Self::substring_search(&conn, query, limit);
        }

        let ids = match schema::fts_search_ids(&conn, query, limit) {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("Full-text query failed, using substring search: {}", e);
                return Self::substring_search(&conn, query, limit);
            }
        };

        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = schema::get_doc(&conn, &id)? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn stats(&self) -> Result<LibraryStats> {
        let conn = self.lock()?;
        Ok(LibraryStats {
            backend: BackendKind::Sqlite,
            patches: schema::count_rows(&conn, "patches")?,
            patch_sets: schema::count_rows(&conn, "patch_sets")?,
            patch_set_items: schema::count_rows(&conn, "patch_set_items")?,
            plugins: schema::count_rows(&conn, "plugins")?,
            vendor_cache: schema::count_rows(&conn, "vendor_cache")?,
            knowledge_docs: schema::count_rows(&conn, "knowledge_docs")?,
        })
    }
}
