// JSON document storage backend
// The whole library lives in one document that is rewritten after every
// mutation. Writes go to a sibling temp file that is then renamed over the
// target. If a write fails the in-memory document stays authoritative and the
// next successful write carries the change.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CATEGORY, DOCUMENT_VERSION, PLUGIN_PRESET_CATEGORY, TEMP_FILE_SUFFIX,
    UNKNOWN_MANUFACTURER,
};
use crate::error::{AtlasError, Result};
use super::backend::PatchLibraryBackend;
use super::types::{
    doc_matches, sort_patches, BackendKind, KnowledgeDoc, LibraryStats, Patch, PatchFilter,
    PatchSet, PatchSetItem, PatchType, Plugin, VendorCacheEntry,
};

/// On-disk shape of the fallback store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryDocument {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub patches: Vec<Patch>,
    #[serde(default)]
    pub patch_sets: Vec<PatchSet>,
    #[serde(default)]
    pub patch_set_items: Vec<PatchSetItem>,
    #[serde(default)]
    pub plugins: Vec<Plugin>,
    #[serde(default)]
    pub vendor_cache: Vec<VendorCacheEntry>,
    #[serde(default)]
    pub knowledge_docs: Vec<KnowledgeDoc>,
}

impl LibraryDocument {
    fn new() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            ..Default::default()
        }
    }

    /// Repair values older documents stored differently. Returns the number
    /// of records touched.
    fn normalize(&mut self) -> usize {
        let mut changed = 0;

        for patch in &mut self.patches {
            let blank = patch.category.trim().is_empty();
            if patch.patch_type == PatchType::Plugin
                && (blank || patch.category == DEFAULT_CATEGORY)
            {
                patch.category = PLUGIN_PRESET_CATEGORY.to_string();
                changed += 1;
            } else if blank {
                patch.category = DEFAULT_CATEGORY.to_string();
                changed += 1;
            }
            if patch.modified.is_empty() && !patch.created.is_empty() {
                patch.modified = patch.created.clone();
                changed += 1;
            }
        }

        for plugin in &mut self.plugins {
            if plugin.manufacturer.trim().is_empty() {
                plugin.manufacturer = UNKNOWN_MANUFACTURER.to_string();
                changed += 1;
            }
        }

        // Drop memberships that point at records which no longer exist, and
        // duplicate (set, patch) pairs.
        let set_ids: HashSet<String> = self.patch_sets.iter().map(|s| s.id.clone()).collect();
        let patch_ids: HashSet<String> = self.patches.iter().map(|p| p.id.clone()).collect();
        let mut seen = HashSet::new();
        let before = self.patch_set_items.len();
        self.patch_set_items.retain(|item| {
            set_ids.contains(&item.set_id)
                && patch_ids.contains(&item.patch_id)
                && seen.insert((item.set_id.clone(), item.patch_id.clone()))
        });
        changed += before - self.patch_set_items.len();

        if self.version < DOCUMENT_VERSION {
            self.version = DOCUMENT_VERSION;
            changed += 1;
        }

        changed
    }

    fn max_order_index(&self, set_id: &str) -> i64 {
        self.patch_set_items
            .iter()
            .filter(|item| item.set_id == set_id)
            .map(|item| item.order_index)
            .max()
            .unwrap_or(0)
    }

    fn touch_set(&mut self, set_id: &str, at: &str) {
        if let Some(set) = self.patch_sets.iter_mut().find(|s| s.id == set_id) {
            set.modified = at.to_string();
        }
    }
}

/// Document-backed store used when SQLite is unavailable or not wanted
pub struct JsonBackend {
    path: PathBuf,
    doc: Mutex<LibraryDocument>,
}

impl JsonBackend {
    /// Load the document at `path`, creating an empty one if absent.
    /// A document that exists but cannot be parsed is an error, never
    /// silently replaced.
    pub fn open(path: &Path) -> Result<Self> {
        let (doc, dirty) = if path.exists() {
            let data = std::fs::read(path)?;
            let mut doc: LibraryDocument = serde_json::from_slice(&data)?;
            if doc.version > DOCUMENT_VERSION {
                return Err(AtlasError::BackendUnavailable(format!(
                    "{} has document version {}, newer than supported {}",
                    path.display(),
                    doc.version,
                    DOCUMENT_VERSION
                )));
            }
            let changed = doc.normalize();
            if changed > 0 {
                log::info!("Normalized {} legacy records in {}", changed, path.display());
            }
            (doc, changed > 0)
        } else {
            (LibraryDocument::new(), true)
        };

        let backend = Self {
            path: path.to_path_buf(),
            doc: Mutex::new(doc),
        };
        if dirty {
            let doc = backend.lock()?;
            backend.persist(&doc)?;
        }
        log::info!("Opened JSON library at {}", path.display());
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, LibraryDocument>> {
        self.doc
            .lock()
            .map_err(|_| AtlasError::Other("library document lock poisoned".to_string()))
    }

    fn persist(&self, doc: &LibraryDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(TEMP_FILE_SUFFIX);
        let tmp_path = PathBuf::from(tmp_name);

        let data = serde_json::to_vec_pretty(doc)?;
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Apply a change and write the document.
    fn mutate<T>(&self, f: impl FnOnce(&mut LibraryDocument) -> T) -> Result<T> {
        let mut doc = self.lock()?;
        let out = f(&mut doc);
        if let Err(e) = self.persist(&doc) {
            log::warn!("Failed to write {}: {}", self.path.display(), e);
            return Err(e);
        }
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&LibraryDocument) -> T) -> Result<T> {
        let doc = self.lock()?;
        Ok(f(&doc))
    }
}

impl PatchLibraryBackend for JsonBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Json
    }

    // ----- Patches -----

    fn save_patch(&self, patch: &Patch) -> Result<()> {
        self.mutate(|doc| {
            match doc.patches.iter_mut().find(|p| p.id == patch.id) {
                Some(existing) => *existing = patch.clone(),
                None => doc.patches.push(patch.clone()),
            }
        })
    }

    fn get_patch(&self, id: &str) -> Result<Option<Patch>> {
        self.read(|doc| doc.patches.iter().find(|p| p.id == id).cloned())
    }

    fn list_patches(&self, filter: &PatchFilter) -> Result<Vec<Patch>> {
        self.read(|doc| {
            let mut patches: Vec<Patch> = doc
                .patches
                .iter()
                .filter(|p| filter.matches(p))
                .cloned()
                .collect();
            sort_patches(&mut patches);
            if let Some(limit) = filter.limit {
                patches.truncate(limit);
            }
            patches
        })
    }

    fn touch_patch(&self, id: &str, at: &str) -> Result<bool> {
        self.mutate(|doc| match doc.patches.iter_mut().find(|p| p.id == id) {
            Some(patch) => {
                patch.last_used = Some(at.to_string());
                patch.modified = at.to_string();
                true
            }
            None => false,
        })
    }

    fn delete_patch(&self, id: &str) -> Result<bool> {
        self.mutate(|doc| {
            doc.patch_set_items.retain(|item| item.patch_id != id);
            let before = doc.patches.len();
            doc.patches.retain(|p| p.id != id);
            doc.patches.len() < before
        })
    }

    fn delete_all_patches(&self) -> Result<usize> {
        self.mutate(|doc| {
            let removed = doc.patches.len();
            doc.patch_set_items.clear();
            doc.patch_sets.clear();
            doc.patches.clear();
            removed
        })
    }

    // ----- Patch sets -----

    fn insert_set(&self, set: &PatchSet) -> Result<()> {
        let exists = self.read(|doc| doc.patch_sets.iter().any(|s| s.id == set.id))?;
        if exists {
            return Err(AtlasError::InvalidInput(format!("patch set {} already exists", set.id)));
        }
        self.mutate(|doc| doc.patch_sets.push(set.clone()))
    }

    fn update_set(&self, set: &PatchSet) -> Result<bool> {
        self.mutate(|doc| match doc.patch_sets.iter_mut().find(|s| s.id == set.id) {
            Some(existing) => {
                existing.name = set.name.clone();
                existing.description = set.description.clone();
                existing.modified = set.modified.clone();
                true
            }
            None => false,
        })
    }

    fn get_set(&self, id: &str) -> Result<Option<PatchSet>> {
        self.read(|doc| doc.patch_sets.iter().find(|s| s.id == id).cloned())
    }

    fn list_sets(&self, device: Option<&str>) -> Result<Vec<PatchSet>> {
        self.read(|doc| {
            let mut sets: Vec<PatchSet> = doc
                .patch_sets
                .iter()
                .filter(|s| device.map_or(true, |d| s.device == d))
                .cloned()
                .collect();
            sets.sort_by(|a, b| {
                a.name
                    .to_ascii_lowercase()
                    .cmp(&b.name.to_ascii_lowercase())
                    .then_with(|| a.created.cmp(&b.created))
            });
            sets
        })
    }

    fn delete_set(&self, id: &str) -> Result<bool> {
        self.mutate(|doc| {
            doc.patch_set_items.retain(|item| item.set_id != id);
            let before = doc.patch_sets.len();
            doc.patch_sets.retain(|s| s.id != id);
            doc.patch_sets.len() < before
        })
    }

    fn set_items(&self, set_id: &str) -> Result<Vec<PatchSetItem>> {
        self.read(|doc| {
            let mut items: Vec<PatchSetItem> = doc
                .patch_set_items
                .iter()
                .filter(|item| item.set_id == set_id)
                .cloned()
                .collect();
            // Stable sort keeps insertion order for equal indexes
            items.sort_by_key(|item| item.order_index);
            items
        })
    }

    fn add_set_items(&self, set_id: &str, patch_ids: &[String], at: &str) -> Result<usize> {
        self.mutate(|doc| {
            let mut next = doc.max_order_index(set_id) + 1;
            let mut added = 0;
            for patch_id in patch_ids {
                if !doc.patches.iter().any(|p| &p.id == patch_id) {
                    log::debug!("Skipping unknown patch {} for set {}", patch_id, set_id);
                    continue;
                }
                let member = doc
                    .patch_set_items
                    .iter()
                    .any(|item| item.set_id == set_id && &item.patch_id == patch_id);
                if member {
                    continue;
                }
                doc.patch_set_items.push(PatchSetItem {
                    set_id: set_id.to_string(),
                    patch_id: patch_id.clone(),
                    order_index: next,
                });
                next += 1;
                added += 1;
            }
            if added > 0 {
                doc.touch_set(set_id, at);
            }
            added
        })
    }

    fn reorder_set_items(&self, set_id: &str, ordered: &[String], at: &str) -> Result<usize> {
        self.mutate(|doc| {
            let mut seen = HashSet::new();
            let mut position = 0i64;
            for patch_id in ordered {
                if !seen.insert(patch_id.as_str()) {
                    continue;
                }
                let item = doc
                    .patch_set_items
                    .iter_mut()
                    .find(|item| item.set_id == set_id && &item.patch_id == patch_id);
                if let Some(item) = item {
                    position += 1;
                    item.order_index = position;
                }
            }
            if position > 0 {
                doc.touch_set(set_id, at);
            }
            position as usize
        })
    }

    fn remove_set_item(&self, set_id: &str, patch_id: &str, at: &str) -> Result<bool> {
        self.mutate(|doc| {
            let before = doc.patch_set_items.len();
            doc.patch_set_items
                .retain(|item| !(item.set_id == set_id && item.patch_id == patch_id));
            let removed = doc.patch_set_items.len() < before;
            if removed {
                doc.touch_set(set_id, at);
            }
            removed
        })
    }

    // ----- Plugins -----

    fn upsert_plugin(&self, plugin: &Plugin) -> Result<()> {
        self.mutate(|doc| match doc.plugins.iter_mut().find(|p| p.id == plugin.id) {
            Some(existing) => {
                let created = std::mem::take(&mut existing.created);
                *existing = plugin.clone();
                if !created.is_empty() {
                    existing.created = created;
                }
            }
            None => doc.plugins.push(plugin.clone()),
        })
    }

    fn get_plugin(&self, id: &str) -> Result<Option<Plugin>> {
        self.read(|doc| doc.plugins.iter().find(|p| p.id == id).cloned())
    }

    fn list_plugins(&self) -> Result<Vec<Plugin>> {
        self.read(|doc| {
            let mut plugins = doc.plugins.clone();
            plugins.sort_by(|a, b| {
                a.name
                    .to_ascii_lowercase()
                    .cmp(&b.name.to_ascii_lowercase())
                    .then_with(|| a.created.cmp(&b.created))
            });
            plugins
        })
    }

    // ----- Vendor cache -----

    fn vendor_cache_get(&self, key: &str) -> Result<Option<VendorCacheEntry>> {
        self.read(|doc| doc.vendor_cache.iter().find(|e| e.key == key).cloned())
    }

    fn vendor_cache_put(&self, entry: &VendorCacheEntry) -> Result<()> {
        self.mutate(|doc| match doc.vendor_cache.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => *existing = entry.clone(),
            None => doc.vendor_cache.push(entry.clone()),
        })
    }

    // ----- Knowledge docs -----

    fn insert_doc(&self, knowledge: &KnowledgeDoc) -> Result<()> {
        self.mutate(|doc| doc.knowledge_docs.push(knowledge.clone()))
    }

    fn list_docs(&self) -> Result<Vec<KnowledgeDoc>> {
        self.read(|doc| {
            let mut docs = doc.knowledge_docs.clone();
            docs.sort_by(|a, b| {
                b.created
                    .cmp(&a.created)
                    .then_with(|| a.title.to_ascii_lowercase().cmp(&b.title.to_ascii_lowercase()))
            });
            docs
        })
    }

    fn delete_doc(&self, id: &str) -> Result<bool> {
        self.mutate(|doc| {
            let before = doc.knowledge_docs.len();
            doc.knowledge_docs.retain(|d| d.id != id);
            doc.knowledge_docs.len() < before
        })
    }

    fn search_docs(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeDoc>> {
        Ok(self
            .list_docs()?
            .into_iter()
            .filter(|d| doc_matches(d, query))
            .take(limit)
            .collect())
    }

    fn stats(&self) -> Result<LibraryStats> {
        self.read(|doc| LibraryStats {
            backend: BackendKind::Json,
            patches: doc.patches.len(),
            patch_sets: doc.patch_sets.len(),
            patch_set_items: doc.patch_set_items.len(),
            plugins: doc.plugins.len(),
            vendor_cache: doc.vendor_cache.len(),
            knowledge_docs: doc.knowledge_docs.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("library.json");
        let backend = JsonBackend::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(backend.stats().unwrap().patches, 0);
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("library.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(JsonBackend::open(&path).is_err());
        // Left untouched
        assert_eq!(std::fs::read(&path).unwrap(), b"{ not json");
    }

    #[test]
    fn test_legacy_document_is_normalized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("library.json");
        let legacy = r#"{
            "patches": [
                {"id": "a", "name": "Old Lead", "patchType": "plugin", "category": "Uncategorized"},
                {"id": "b", "name": "Old Pad", "category": ""}
            ],
            "patchSetItems": [
                {"setId": "ghost", "patchId": "a", "orderIndex": 1}
            ]
        }"#;
        std::fs::write(&path, legacy).unwrap();

        let backend = JsonBackend::open(&path).unwrap();
        let a = backend.get_patch("a").unwrap().unwrap();
        let b = backend.get_patch("b").unwrap().unwrap();
        assert_eq!(a.category, PLUGIN_PRESET_CATEGORY);
        assert_eq!(b.category, DEFAULT_CATEGORY);
        assert_eq!(backend.stats().unwrap().patch_set_items, 0);

        let written: LibraryDocument =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written.version, DOCUMENT_VERSION);
    }

    #[test]
    fn test_mutations_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("library.json");
        {
            let backend = JsonBackend::open(&path).unwrap();
            backend
                .vendor_cache_put(&VendorCacheEntry {
                    key: "serum".to_string(),
                    manufacturer: Some("Xfer Records".to_string()),
                    source_url: None,
                    confidence: 0.9,
                    updated: "2024-01-01T00:00:00.000Z".to_string(),
                })
                .unwrap();
        }
        let reopened = JsonBackend::open(&path).unwrap();
        let entry = reopened.vendor_cache_get("serum").unwrap().unwrap();
        assert_eq!(entry.manufacturer.as_deref(), Some("Xfer Records"));
        assert!(!dir.path().join("library.json.tmp").exists());
    }
}
