// SysEx import capture

use serde::Serialize;

use crate::constants::{IMPORTED_CATEGORY, TAG_IMPORTED, TAG_SYSEX};
use crate::error::{AtlasError, Result};
use crate::library::NewPatch;
use crate::midi::SubscriptionToken;

/// Options for turning captured frames into patches
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Name prefix; defaults to "Imported {device name}"
    pub base_name: Option<String>,
    /// Added after the "imported" and "sysex" tags
    pub extra_tags: Vec<String>,
}

/// Capture buffer for one device
pub(crate) struct ImportSession {
    pub device_name: String,
    pub input_id: String,
    pub started: bool,
    pub messages: Vec<Vec<u8>>,
    pub created_at: String,
    pub token: Option<SubscriptionToken>,
}

impl ImportSession {
    pub fn base_name(&self, options: &ImportOptions) -> String {
        options
            .base_name
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Imported {}", self.device_name))
    }

    /// One hardware patch per captured frame, numbered from 1
    pub fn to_patches(&self, options: &ImportOptions) -> Vec<NewPatch> {
        let base = self.base_name(options);
        let mut tags = vec![TAG_IMPORTED.to_string(), TAG_SYSEX.to_string()];
        tags.extend(options.extra_tags.iter().cloned());

        self.messages
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                NewPatch::hardware(frame_name(&base, i + 1), self.device_name.clone())
                    .with_category(IMPORTED_CATEGORY)
                    .with_tags(tags.clone())
                    .with_sysex(frame.clone())
            })
            .collect()
    }
}

pub(crate) fn frame_name(base: &str, ordinal: usize) -> String {
    format!("{} #{:03}", base, ordinal)
}

/// Snapshot of a capture session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSnapshot {
    pub device_id: String,
    pub device_name: String,
    pub started: bool,
    pub count: usize,
    pub created_at: String,
}

/// Result of saving a capture buffer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSaveSummary {
    pub device_id: String,
    pub saved: usize,
    pub failed: usize,
    pub patch_ids: Vec<String>,
    pub errors: Vec<String>,
}

impl ImportSaveSummary {
    /// Turn any per-frame failure into `PartialFailure`
    pub fn into_result(self) -> Result<Self> {
        if self.failed > 0 {
            return Err(AtlasError::PartialFailure {
                succeeded: self.saved,
                failed: self.failed,
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(frames: usize) -> ImportSession {
        ImportSession {
            device_name: "JD-Xi".to_string(),
            input_id: "in".to_string(),
            started: true,
            messages: (0..frames).map(|i| vec![0xF0, i as u8, 0xF7]).collect(),
            created_at: String::new(),
            token: None,
        }
    }

    #[test]
    fn test_frame_names_are_zero_padded() {
        assert_eq!(frame_name("Imported X", 1), "Imported X #001");
        assert_eq!(frame_name("Imported X", 42), "Imported X #042");
        assert_eq!(frame_name("Imported X", 1234), "Imported X #1234");
    }

    #[test]
    fn test_to_patches() {
        let options = ImportOptions {
            base_name: None,
            extra_tags: vec!["live".to_string()],
        };
        let patches = session(2).to_patches(&options);
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1].name, "Imported JD-Xi #002");
        assert_eq!(patches[1].category.as_deref(), Some(IMPORTED_CATEGORY));
        assert_eq!(patches[1].tags, vec!["imported", "sysex", "live"]);
        assert_eq!(patches[1].sysex, Some(vec![0xF0, 1, 0xF7]));

        let named = ImportOptions {
            base_name: Some("Factory".to_string()),
            extra_tags: vec![],
        };
        assert_eq!(session(1).to_patches(&named)[0].name, "Factory #001");
    }
}
