// Manufacturer inference contract and cache keys

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What a lookup decided about one key. `manufacturer: None` is a confident
/// "no answer" and is cached like a hit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManufacturerGuess {
    pub manufacturer: Option<String>,
    pub source_url: Option<String>,
    pub confidence: f64,
}

impl ManufacturerGuess {
    pub fn found(manufacturer: impl Into<String>, confidence: f64) -> Self {
        Self {
            manufacturer: Some(manufacturer.into()),
            source_url: None,
            confidence,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }
}

/// External manufacturer inference (web search, a bundled table, a model).
/// Called at most once per normalized key; results are cached by the library.
pub trait ManufacturerLookup: Send + Sync {
    fn lookup(&self, key: &str) -> Result<ManufacturerGuess>;
}

impl<F> ManufacturerLookup for F
where
    F: Fn(&str) -> Result<ManufacturerGuess> + Send + Sync,
{
    fn lookup(&self, key: &str) -> Result<ManufacturerGuess> {
        self(key)
    }
}

fn arch_suffix() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)[\s_\-(\[]+(x64|x86[\s_-]?64|x86|64[\s_-]?bit|32[\s_-]?bit|arm64|universal|mono|stereo)[)\]]*\s*$").ok()
    })
    .as_ref()
}

fn non_alnum() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").ok()).as_ref()
}

/// Remove trailing architecture and channel markers ("Serum (x64)" -> "Serum").
/// A name that is nothing but a marker is kept as is.
pub fn strip_arch_suffixes(raw: &str) -> String {
    let mut name = raw.trim().to_string();
    if let Some(re) = arch_suffix() {
        // Suffixes can stack ("Serum (x64) (Stereo)")
        loop {
            let stripped = re.replace(&name, "").trim().to_string();
            if stripped == name || stripped.is_empty() {
                break;
            }
            name = stripped;
        }
    }
    name
}

/// Cache key for a plugin or product name: lowercase, punctuation collapsed
/// to single spaces, then architecture and channel suffixes removed.
/// Normalizing a key again returns it unchanged.
pub fn normalize_vendor_key(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let collapsed = match non_alnum() {
        Some(re) => re.replace_all(&lowered, " ").trim().to_string(),
        None => lowered.split_whitespace().collect::<Vec<_>>().join(" "),
    };
    strip_arch_suffixes(&collapsed)
}
