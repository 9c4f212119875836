// Patch library record types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CATEGORY, UNKNOWN_MANUFACTURER};

// ----- Patch -----

/// Where a patch came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    #[default]
    Hardware,
    Plugin,
}

impl PatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchType::Hardware => "hardware",
            PatchType::Plugin => "plugin",
        }
    }
}

impl fmt::Display for PatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hardware" => Ok(PatchType::Hardware),
            "plugin" => Ok(PatchType::Plugin),
            other => Err(format!("unknown patch type: {other}")),
        }
    }
}

/// A single sound: a hardware dump or a plugin parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, with = "sysex_base64", skip_serializing_if = "Option::is_none")]
    pub sysex: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub patch_type: PatchType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default)]
    pub last_used: Option<String>,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub modified: String,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

/// Parameters for saving a patch. `id` set means re-save of an existing record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPatch {
    pub id: Option<String>,
    pub name: String,
    pub device: String,
    pub manufacturer: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub sysex: Option<Vec<u8>>,
    pub parameters: Option<serde_json::Map<String, serde_json::Value>>,
    pub patch_type: PatchType,
    pub plugin_id: Option<String>,
    pub source_path: Option<String>,
}

impl NewPatch {
    pub fn hardware(name: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: device.into(),
            patch_type: PatchType::Hardware,
            ..Default::default()
        }
    }

    pub fn plugin(name: impl Into<String>, plugin_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin_id: Some(plugin_id.into()),
            patch_type: PatchType::Plugin,
            ..Default::default()
        }
    }

    pub fn with_sysex(mut self, bytes: Vec<u8>) -> Self {
        self.sysex = Some(bytes);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Patch listing filter. Empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct PatchFilter {
    pub device: Option<String>,
    pub category: Option<String>,
    pub patch_type: Option<PatchType>,
    /// Case-insensitive substring over name and tags
    pub query: Option<String>,
    pub limit: Option<usize>,
}

impl PatchFilter {
    pub fn device(device: impl Into<String>) -> Self {
        Self {
            device: Some(device.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, patch: &Patch) -> bool {
        if let Some(device) = &self.device {
            if &patch.device != device {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if &patch.category != category {
                return false;
            }
        }
        if let Some(patch_type) = self.patch_type {
            if patch.patch_type != patch_type {
                return false;
            }
        }
        self.matches_query(patch)
    }

    pub fn matches_query(&self, patch: &Patch) -> bool {
        let query = match self.query.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => q.to_ascii_lowercase(),
            _ => return true,
        };
        patch.name.to_ascii_lowercase().contains(&query)
            || patch.tags.iter().any(|t| t.to_ascii_lowercase().contains(&query))
    }
}

/// Sort key shared by both backends: name (ASCII case-insensitive), then created
pub fn sort_patches(patches: &mut [Patch]) {
    patches.sort_by(|a, b| {
        a.name
            .to_ascii_lowercase()
            .cmp(&b.name.to_ascii_lowercase())
            .then_with(|| a.created.cmp(&b.created))
    });
}

// ----- Patch Set -----

/// A named, ordered bundle of patches scoped to one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSet {
    pub id: String,
    pub name: String,
    pub device: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub modified: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSetItem {
    pub set_id: String,
    pub patch_id: String,
    pub order_index: i64,
}

// ----- Plugin -----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugin {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "unknown_manufacturer")]
    pub manufacturer: String,
    pub path: String,
    #[serde(default)]
    pub preset_count: i64,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub modified: String,
}

fn unknown_manufacturer() -> String {
    UNKNOWN_MANUFACTURER.to_string()
}

impl Plugin {
    pub fn has_unknown_manufacturer(&self) -> bool {
        let m = self.manufacturer.trim();
        m.is_empty() || m.eq_ignore_ascii_case(UNKNOWN_MANUFACTURER)
    }
}

// ----- Vendor cache -----

/// Memoized manufacturer inference. `manufacturer: None` is a cached negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorCacheEntry {
    pub key: String,
    pub manufacturer: Option<String>,
    pub source_url: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub updated: String,
}

// ----- Knowledge docs -----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeDoc {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created: String,
}

/// Substring match used when no full-text index is available.
/// Every whitespace-separated token must appear in the title or body.
pub fn doc_matches(doc: &KnowledgeDoc, query: &str) -> bool {
    let haystack = format!("{} {}", doc.title, doc.body).to_ascii_lowercase();
    let mut tokens = query.split_whitespace().peekable();
    if tokens.peek().is_none() {
        return false;
    }
    tokens.all(|t| haystack.contains(&t.to_ascii_lowercase()))
}

// ----- Backend info -----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Json,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sqlite => f.write_str("sqlite"),
            BackendKind::Json => f.write_str("json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryStats {
    pub backend: BackendKind,
    pub patches: usize,
    pub patch_sets: usize,
    pub patch_set_items: usize,
    pub plugins: usize,
    pub vendor_cache: usize,
    pub knowledge_docs: usize,
}

// ----- SysEx serde -----

/// Serialize SysEx as base64 text; accept base64 text or a plain byte array.
pub(crate) mod sysex_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSysex {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<RawSysex>::deserialize(d)? {
            Some(RawSysex::Text(text)) => STANDARD
                .decode(text.trim())
                .map(Some)
                .map_err(serde::de::Error::custom),
            Some(RawSysex::Bytes(bytes)) => Ok(Some(bytes)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(name: &str, tags: &[&str]) -> Patch {
        Patch {
            id: name.to_string(),
            name: name.to_string(),
            device: "JD-Xi".to_string(),
            manufacturer: None,
            category: DEFAULT_CATEGORY.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            sysex: None,
            parameters: None,
            patch_type: PatchType::Hardware,
            plugin_id: None,
            source_path: None,
            last_used: None,
            created: String::new(),
            modified: String::new(),
        }
    }

    #[test]
    fn test_filter_query_matches_name_and_tags() {
        let filter = PatchFilter {
            query: Some("PAD".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&patch("Warm Pad", &[])));
        assert!(filter.matches(&patch("Strings", &["pad"])));
        assert!(!filter.matches(&patch("Bass", &["mono"])));
    }

    #[test]
    fn test_legacy_patch_json_gets_defaults() {
        let json = r#"{"id":"p1","name":"Old Brass","sysex":[240,67,247]}"#;
        let p: Patch = serde_json::from_str(json).unwrap();
        assert_eq!(p.category, DEFAULT_CATEGORY);
        assert_eq!(p.patch_type, PatchType::Hardware);
        assert_eq!(p.sysex, Some(vec![0xF0, 0x43, 0xF7]));
    }

    #[test]
    fn test_sysex_serializes_as_base64() {
        let mut p = patch("Lead", &[]);
        p.sysex = Some(vec![0xF0, 0x41, 0xF7]);
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["sysex"], "8EH3");
        let back: Patch = serde_json::from_value(v).unwrap();
        assert_eq!(back.sysex, p.sysex);
    }

    #[test]
    fn test_doc_matches_all_tokens() {
        let doc = KnowledgeDoc {
            id: "d".into(),
            title: "JD-Xi bulk dump".into(),
            body: "Hold SHIFT and press WRITE to send".into(),
            source: None,
            tags: vec![],
            created: String::new(),
        };
        assert!(doc_matches(&doc, "bulk write"));
        assert!(!doc_matches(&doc, "bulk receive"));
        assert!(!doc_matches(&doc, "   "));
    }
}
