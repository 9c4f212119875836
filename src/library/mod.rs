// Patch library store
// One facade over either storage backend. Ids, timestamps, defaults and
// validation are decided here so both backends stay plain CRUD.

pub mod backend;
pub mod classify;
pub mod export;
pub mod json;
pub mod sqlite;
pub mod types;
pub mod vendor;


use std::collections::HashSet;
use std::path::Path;

use crate::config::{AtlasConfig, BackendPreference};
use crate::constants::{
    DEFAULT_CATEGORY, PLUGIN_PRESET_CATEGORY, TAG_IMPORTED, TAG_SET, UNKNOWN_MANUFACTURER,
};
use crate::db;
use crate::error::{AtlasError, Result};
use crate::now_timestamp;
use crate::plugins::{ScanSummary, ScannedPlugin};

pub use backend::PatchLibraryBackend;
pub use classify::CategoryClassifier;
pub use export::{ExportedPatch, SetExport, SetImportSummary};
pub use json::JsonBackend;
pub use sqlite::SqliteBackend;
pub use types::{
    BackendKind, KnowledgeDoc, LibraryStats, NewPatch, Patch, PatchFilter, PatchSet,
    PatchSetItem, PatchType, Plugin, VendorCacheEntry,
};
pub use vendor::{normalize_vendor_key, strip_arch_suffixes, ManufacturerGuess, ManufacturerLookup};

pub struct PatchLibrary {
    backend: Box<dyn PatchLibraryBackend>,
    classifier: Option<Box<dyn CategoryClassifier>>,
}

impl PatchLibrary {
    pub fn new(backend: Box<dyn PatchLibraryBackend>) -> Self {
        Self {
            backend,
            classifier: None,
        }
    }

    /// Open the library in the configured data directory. `Auto` prefers
    /// SQLite and falls back to the JSON document when it cannot be opened.
    pub fn open(config: &AtlasConfig) -> Result<Self> {
        let db_path = db::get_db_path(&config.data_dir);
        let json_path = db::get_json_path(&config.data_dir);

        let backend: Box<dyn PatchLibraryBackend> = match config.backend {
            BackendPreference::Sqlite => Box::new(SqliteBackend::open(&db_path)?),
            BackendPreference::Json => Box::new(JsonBackend::open(&json_path)?),
            BackendPreference::Auto => match SqliteBackend::open(&db_path) {
                Ok(backend) => Box::new(backend),
                Err(e) => {
                    log::warn!("{}; using JSON library at {}", e, json_path.display());
                    Box::new(JsonBackend::open(&json_path)?)
                }
            },
        };
        Ok(Self::new(backend))
    }

    pub fn open_sqlite(path: &Path) -> Result<Self> {
        Ok(Self::new(Box::new(SqliteBackend::open(path)?)))
    }

    pub fn open_json(path: &Path) -> Result<Self> {
        Ok(Self::new(Box::new(JsonBackend::open(path)?)))
    }

    /// Private SQLite library that lives only as long as this value
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Box::new(SqliteBackend::open_in_memory()?)))
    }

    pub fn with_classifier(mut self, classifier: impl CategoryClassifier + 'static) -> Self {
        self.classifier = Some(Box::new(classifier));
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    // ----- Patches -----

    /// Save a new patch, or re-save an existing one when `id` names it.
    /// A re-save keeps `created` and `last_used`.
    pub fn save_patch(&self, new: NewPatch) -> Result<Patch> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(AtlasError::InvalidInput("patch name cannot be blank".to_string()));
        }

        let now = now_timestamp();
        let existing = match new.id.as_deref() {
            Some(id) => self.backend.get_patch(id)?,
            None => None,
        };
        let tags = normalize_tags(new.tags);
        let category = self.resolve_category(name, &tags, new.category.as_deref(), new.patch_type);

        let patch = Patch {
            id: new.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: name.to_string(),
            device: new.device.trim().to_string(),
            manufacturer: new
                .manufacturer
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty()),
            category,
            tags,
            sysex: new.sysex,
            parameters: new.parameters,
            patch_type: new.patch_type,
            plugin_id: new.plugin_id,
            source_path: new.source_path,
            last_used: existing.as_ref().and_then(|p| p.last_used.clone()),
            created: existing
                .map(|p| p.created)
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| now.clone()),
            modified: now,
        };

        self.backend.save_patch(&patch)?;
        log::debug!("Saved patch {} ({})", patch.name, patch.id);
        Ok(patch)
    }

    fn resolve_category(
        &self,
        name: &str,
        tags: &[String],
        requested: Option<&str>,
        patch_type: PatchType,
    ) -> String {
        if let Some(category) = requested.map(str::trim).filter(|c| !c.is_empty()) {
            return category.to_string();
        }
        if let Some(classifier) = &self.classifier {
            let detected = classifier.detect_category(name, tags);
            let detected = detected.trim();
            if !detected.is_empty() {
                return detected.to_string();
            }
        }
        match patch_type {
            PatchType::Plugin => PLUGIN_PRESET_CATEGORY.to_string(),
            PatchType::Hardware => DEFAULT_CATEGORY.to_string(),
        }
    }

    pub fn get_patch(&self, id: &str) -> Result<Patch> {
        self.backend
            .get_patch(id)?
            .ok_or_else(|| AtlasError::NotFound(format!("patch {}", id)))
    }

    pub fn list_patches(&self, filter: &PatchFilter) -> Result<Vec<Patch>> {
        self.backend.list_patches(filter)
    }

    /// Stamp a patch as just used (sent to a device or auditioned)
    pub fn update_last_used(&self, id: &str) -> Result<()> {
        if !self.backend.touch_patch(id, &now_timestamp())? {
            return Err(AtlasError::NotFound(format!("patch {}", id)));
        }
        Ok(())
    }

    /// Delete a patch and drop it from every set
    pub fn delete_patch(&self, id: &str) -> Result<()> {
        if !self.backend.delete_patch(id)? {
            return Err(AtlasError::NotFound(format!("patch {}", id)));
        }
        log::info!("Deleted patch {}", id);
        Ok(())
    }

    /// Clear the library. Sets and memberships go with the patches.
    pub fn delete_all_patches(&self) -> Result<usize> {
        let removed = self.backend.delete_all_patches()?;
        log::info!("Cleared library: {} patches removed", removed);
        Ok(removed)
    }

    // ----- Patch sets -----

    pub fn create_set(&self, name: &str, device: &str, description: &str) -> Result<PatchSet> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AtlasError::InvalidInput("set name cannot be blank".to_string()));
        }
        let now = now_timestamp();
        let set = PatchSet {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            device: device.trim().to_string(),
            description: description.trim().to_string(),
            created: now.clone(),
            modified: now,
        };
        self.backend.insert_set(&set)?;
        log::info!("Created patch set {} for {}", set.name, set.device);
        Ok(set)
    }

    /// Rename or re-describe a set. The device grouping never changes.
    pub fn update_set(&self, id: &str, name: Option<&str>, description: Option<&str>) -> Result<PatchSet> {
        let mut set = self.get_set(id)?;
        if let Some(name) = name {
            let name = name.trim();
            if name.is_empty() {
                return Err(AtlasError::InvalidInput("set name cannot be blank".to_string()));
            }
            set.name = name.to_string();
        }
        if let Some(description) = description {
            set.description = description.trim().to_string();
        }
        set.modified = now_timestamp();
        self.backend.update_set(&set)?;
        Ok(set)
    }

    pub fn get_set(&self, id: &str) -> Result<PatchSet> {
        self.backend
            .get_set(id)?
            .ok_or_else(|| AtlasError::NotFound(format!("patch set {}", id)))
    }

    pub fn list_sets(&self, device: Option<&str>) -> Result<Vec<PatchSet>> {
        self.backend.list_sets(device)
    }

    pub fn delete_set(&self, id: &str) -> Result<()> {
        if !self.backend.delete_set(id)? {
            return Err(AtlasError::NotFound(format!("patch set {}", id)));
        }
        log::info!("Deleted patch set {}", id);
        Ok(())
    }

    /// Append patches to the end of a set. Returns how many were added.
    pub fn add_items(&self, set_id: &str, patch_ids: &[String]) -> Result<usize> {
        self.get_set(set_id)?;
        self.backend.add_set_items(set_id, patch_ids, &now_timestamp())
    }

    /// Renumber the listed members 1..N in the given order
    pub fn reorder(&self, set_id: &str, ordered_ids: &[String]) -> Result<usize> {
        self.get_set(set_id)?;
        self.backend.reorder_set_items(set_id, ordered_ids, &now_timestamp())
    }

    pub fn remove_item(&self, set_id: &str, patch_id: &str) -> Result<bool> {
        self.get_set(set_id)?;
        self.backend.remove_set_item(set_id, patch_id, &now_timestamp())
    }

    /// Patches of a set in order
    pub fn get_items(&self, set_id: &str) -> Result<Vec<Patch>> {
        let items = self.backend.set_items(set_id)?;
        let mut patches = Vec::with_capacity(items.len());
        for item in items {
            if let Some(patch) = self.backend.get_patch(&item.patch_id)? {
                patches.push(patch);
            }
        }
        Ok(patches)
    }

    /// Raw membership rows of a set, ascending order index
    pub fn item_records(&self, set_id: &str) -> Result<Vec<PatchSetItem>> {
        self.backend.set_items(set_id)
    }

    // ----- Export / import -----

    pub fn export_set(&self, set_id: &str) -> Result<SetExport> {
        let set = self.get_set(set_id)?;
        let patches = self.get_items(set_id)?;
        Ok(SetExport::new(set, &patches, now_timestamp()))
    }

    /// Import an exported set as a fresh set under `device_name`. Every patch
    /// gets a new id; failures are counted per patch.
    pub fn import_set(&self, payload: &SetExport, device_name: &str) -> Result<SetImportSummary> {
        payload.validate()?;
        let device_name = device_name.trim();
        if device_name.is_empty() {
            return Err(AtlasError::InvalidInput("device name cannot be blank".to_string()));
        }

        let set = self.create_set(&payload.set.name, device_name, &payload.set.description)?;

        let mut patch_ids = Vec::with_capacity(payload.patches.len());
        let mut errors = Vec::new();
        for exported in &payload.patches {
            match self.import_one(exported, device_name) {
                Ok(patch) => patch_ids.push(patch.id),
                Err(e) => {
                    log::warn!("Skipping patch {} from set import: {}", exported.name, e);
                    errors.push(format!("{}: {}", exported.name, e));
                }
            }
        }

        self.add_items(&set.id, &patch_ids)?;
        self.reorder(&set.id, &patch_ids)?;
        log::info!(
            "Imported set {} for {}: {} patches, {} failed",
            set.name,
            device_name,
            patch_ids.len(),
            errors.len()
        );

        let set = self.get_set(&set.id)?;
        Ok(SetImportSummary {
            set,
            imported: patch_ids.len(),
            failed: errors.len(),
            patch_ids,
            errors,
        })
    }

    fn import_one(&self, exported: &ExportedPatch, device_name: &str) -> Result<Patch> {
        let sysex = exported.decode_sysex()?;
        let mut tags = exported.tags.clone();
        tags.push(TAG_IMPORTED.to_string());
        tags.push(TAG_SET.to_string());

        self.save_patch(NewPatch {
            id: None,
            name: exported.name.clone(),
            device: device_name.to_string(),
            manufacturer: exported.manufacturer.clone(),
            category: exported.category.clone(),
            tags,
            sysex,
            parameters: exported.parameters.clone(),
            patch_type: exported.patch_type,
            plugin_id: exported.plugin_id.clone(),
            source_path: None,
        })
    }

    pub fn export_set_to_file(&self, set_id: &str, path: &Path) -> Result<SetExport> {
        let payload = self.export_set(set_id)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_vec_pretty(&payload)?)?;
        log::info!("Exported set {} to {}", payload.set.name, path.display());
        Ok(payload)
    }

    pub fn import_set_from_file(&self, path: &Path, device_name: &str) -> Result<SetImportSummary> {
        let text = std::fs::read_to_string(path)?;
        let payload = SetExport::from_json(&text)?;
        self.import_set(&payload, device_name)
    }

    // ----- Plugins -----

    pub fn upsert_plugin(&self, plugin: &Plugin) -> Result<()> {
        self.backend.upsert_plugin(plugin)
    }

    pub fn get_plugin(&self, id: &str) -> Result<Plugin> {
        self.backend
            .get_plugin(id)?
            .ok_or_else(|| AtlasError::NotFound(format!("plugin {}", id)))
    }

    pub fn list_plugins(&self) -> Result<Vec<Plugin>> {
        self.backend.list_plugins()
    }

    /// Manual manufacturer override
    pub fn set_plugin_manufacturer(&self, id: &str, manufacturer: &str) -> Result<Plugin> {
        let manufacturer = manufacturer.trim();
        if manufacturer.is_empty() {
            return Err(AtlasError::InvalidInput("manufacturer cannot be blank".to_string()));
        }
        let mut plugin = self.get_plugin(id)?;
        plugin.manufacturer = manufacturer.to_string();
        plugin.modified = now_timestamp();
        self.backend.upsert_plugin(&plugin)?;
        Ok(plugin)
    }

    /// Merge a filesystem scan into the plugin table, matching on path.
    /// Known plugins keep their manufacturer and preset count.
    pub fn record_scan(&self, scanned: &[ScannedPlugin]) -> Result<ScanSummary> {
        let existing = self.backend.list_plugins()?;
        let now = now_timestamp();
        let mut summary = ScanSummary {
            found: scanned.len(),
            ..Default::default()
        };

        for found in scanned {
            let path = found.path.to_string_lossy().to_string();
            let plugin = match existing.iter().find(|p| p.path == path) {
                Some(known) => {
                    summary.updated += 1;
                    Plugin {
                        name: found.name.clone(),
                        plugin_type: found.format.as_str().to_string(),
                        modified: now.clone(),
                        ..known.clone()
                    }
                }
                None => {
                    summary.added += 1;
                    Plugin {
                        id: uuid::Uuid::new_v4().to_string(),
                        name: found.name.clone(),
                        plugin_type: found.format.as_str().to_string(),
                        category: String::new(),
                        manufacturer: UNKNOWN_MANUFACTURER.to_string(),
                        path,
                        preset_count: 0,
                        created: now.clone(),
                        modified: now.clone(),
                    }
                }
            };
            self.backend.upsert_plugin(&plugin)?;
        }

        log::info!(
            "Plugin scan recorded: {} found, {} new, {} updated",
            summary.found,
            summary.added,
            summary.updated
        );
        Ok(summary)
    }

    /// Fill in "Unknown" manufacturers through the vendor cache. Lookup
    /// failures are logged and skipped. Returns the number of plugins updated.
    pub fn infer_plugin_manufacturers(&self, lookup: &dyn ManufacturerLookup) -> Result<usize> {
        let mut updated = 0;
        for mut plugin in self.backend.list_plugins()? {
            if !plugin.has_unknown_manufacturer() {
                continue;
            }
            let entry = match self.infer_manufacturer(&plugin.name, lookup) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Manufacturer lookup failed for {}: {}", plugin.name, e);
                    continue;
                }
            };
            if let Some(manufacturer) = entry.manufacturer {
                plugin.manufacturer = manufacturer;
                plugin.modified = now_timestamp();
                self.backend.upsert_plugin(&plugin)?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    // ----- Vendor cache -----

    pub fn vendor_cache_get(&self, key: &str) -> Result<Option<VendorCacheEntry>> {
        self.backend.vendor_cache_get(&normalize_vendor_key(key))
    }

    pub fn vendor_cache_put(&self, key: &str, guess: &ManufacturerGuess) -> Result<VendorCacheEntry> {
        let key = normalize_vendor_key(key);
        if key.is_empty() {
            return Err(AtlasError::InvalidInput("vendor key cannot be blank".to_string()));
        }
        self.store_vendor_entry(key, guess)
    }

    /// Writes under `key` exactly as given; callers normalize first
    fn store_vendor_entry(&self, key: String, guess: &ManufacturerGuess) -> Result<VendorCacheEntry> {
        let entry = VendorCacheEntry {
            key,
            manufacturer: guess
                .manufacturer
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string),
            source_url: guess.source_url.clone(),
            confidence: guess.confidence,
            updated: now_timestamp(),
        };
        self.backend.vendor_cache_put(&entry)?;
        Ok(entry)
    }

    /// Cached manufacturer inference. A cached entry, negative included, is
    /// returned without calling `lookup`. Lookup errors are not cached.
    pub fn infer_manufacturer(&self, key: &str, lookup: &dyn ManufacturerLookup) -> Result<VendorCacheEntry> {
        let normalized = normalize_vendor_key(key);
        if normalized.is_empty() {
            return Err(AtlasError::InvalidInput("vendor key cannot be blank".to_string()));
        }
        if let Some(entry) = self.backend.vendor_cache_get(&normalized)? {
            log::debug!("Vendor cache hit for {}", normalized);
            return Ok(entry);
        }

        let guess = lookup.lookup(&normalized)?;
        self.store_vendor_entry(normalized, &guess)
    }

    // ----- Knowledge docs -----

    pub fn add_doc(&self, title: &str, body: &str, source: Option<&str>, tags: Vec<String>) -> Result<KnowledgeDoc> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AtlasError::InvalidInput("doc title cannot be blank".to_string()));
        }
        let doc = KnowledgeDoc {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            body: body.to_string(),
            source: source.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string),
            tags: normalize_tags(tags),
            created: now_timestamp(),
        };
        self.backend.insert_doc(&doc)?;
        Ok(doc)
    }

    pub fn list_docs(&self) -> Result<Vec<KnowledgeDoc>> {
        self.backend.list_docs()
    }

    /// Search titles and bodies. Blank queries match nothing.
    pub fn search_docs(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeDoc>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        self.backend.search_docs(query, limit)
    }

    pub fn delete_doc(&self, id: &str) -> Result<()> {
        if !self.backend.delete_doc(id)? {
            return Err(AtlasError::NotFound(format!("doc {}", id)));
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<LibraryStats> {
        self.backend.stats()
    }
}

/// Trim, drop blanks and drop case-insensitive duplicates, keeping first spelling
fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .collect()
}
