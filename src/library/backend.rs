// Storage backend contract shared by the SQLite and JSON document stores

use crate::error::Result;
use super::types::{
    BackendKind, KnowledgeDoc, LibraryStats, Patch, PatchFilter, PatchSet, PatchSetItem, Plugin,
    VendorCacheEntry,
};

/// Uniform CRUD over one storage engine.
///
/// Implementations own their own locking and must apply every multi-row
/// change (set delete, library clear, reorder) atomically. Timestamps and ids
/// are decided by the caller; backends store what they are given.
pub trait PatchLibraryBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    // ----- Patches -----

    /// Insert or replace a patch by id.
    fn save_patch(&self, patch: &Patch) -> Result<()>;
    fn get_patch(&self, id: &str) -> Result<Option<Patch>>;
    /// Patches matching `filter`, sorted by name then created.
    fn list_patches(&self, filter: &PatchFilter) -> Result<Vec<Patch>>;
    /// Set `last_used` and `modified`. Returns false for an unknown id.
    fn touch_patch(&self, id: &str, at: &str) -> Result<bool>;
    /// Delete a patch and its set memberships.
    fn delete_patch(&self, id: &str) -> Result<bool>;
    /// Delete every patch, set item and set. Returns the number of patches removed.
    fn delete_all_patches(&self) -> Result<usize>;

    // ----- Patch sets -----

    fn insert_set(&self, set: &PatchSet) -> Result<()>;
    /// Update name, description and modified. `device` is never rewritten.
    fn update_set(&self, set: &PatchSet) -> Result<bool>;
    fn get_set(&self, id: &str) -> Result<Option<PatchSet>>;
    fn list_sets(&self, device: Option<&str>) -> Result<Vec<PatchSet>>;
    /// Delete a set together with its items.
    fn delete_set(&self, id: &str) -> Result<bool>;
    /// Items of a set, ascending order index.
    fn set_items(&self, set_id: &str) -> Result<Vec<PatchSetItem>>;
    /// Append patches after the current max order index. Members and unknown
    /// patch ids are skipped. Returns the number added.
    fn add_set_items(&self, set_id: &str, patch_ids: &[String], at: &str) -> Result<usize>;
    /// Renumber the listed members 1..N in order. Non-members are ignored and
    /// unlisted members keep their index. Returns the number renumbered.
    fn reorder_set_items(&self, set_id: &str, ordered: &[String], at: &str) -> Result<usize>;
    fn remove_set_item(&self, set_id: &str, patch_id: &str, at: &str) -> Result<bool>;

    // ----- Plugins -----

    fn upsert_plugin(&self, plugin: &Plugin) -> Result<()>;
    fn get_plugin(&self, id: &str) -> Result<Option<Plugin>>;
    fn list_plugins(&self) -> Result<Vec<Plugin>>;

    // ----- Vendor cache -----

    fn vendor_cache_get(&self, key: &str) -> Result<Option<VendorCacheEntry>>;
    fn vendor_cache_put(&self, entry: &VendorCacheEntry) -> Result<()>;

    // ----- Knowledge docs -----

    fn insert_doc(&self, doc: &KnowledgeDoc) -> Result<()>;
    fn list_docs(&self) -> Result<Vec<KnowledgeDoc>>;
    fn delete_doc(&self, id: &str) -> Result<bool>;
    fn search_docs(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeDoc>>;

    fn stats(&self) -> Result<LibraryStats>;
}
