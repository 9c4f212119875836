// Patch set export file format

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{SET_EXPORT_KIND, SET_EXPORT_VERSION, SYSEX_ENCODING_BASE64};
use crate::error::{AtlasError, Result};
use super::types::{Patch, PatchSet, PatchType};

/// Portable set payload: the set record plus its patches in set order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetExport {
    pub kind: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub exported: String,
    pub set: PatchSet,
    #[serde(default)]
    pub patches: Vec<ExportedPatch>,
}

impl SetExport {
    pub fn new(set: PatchSet, patches: &[Patch], exported: String) -> Self {
        Self {
            kind: SET_EXPORT_KIND.to_string(),
            version: SET_EXPORT_VERSION,
            exported,
            set,
            patches: patches.iter().map(ExportedPatch::from_patch).collect(),
        }
    }

    /// Parse an export document and check its kind
    pub fn from_json(text: &str) -> Result<Self> {
        let payload: SetExport = serde_json::from_str(text)?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kind != SET_EXPORT_KIND {
            return Err(AtlasError::InvalidInput(format!(
                "not a patch set export (kind \"{}\")",
                self.kind
            )));
        }
        if self.version > SET_EXPORT_VERSION {
            log::warn!(
                "Set export version {} is newer than {}; reading known fields only",
                self.version,
                SET_EXPORT_VERSION
            );
        }
        Ok(())
    }
}

/// A patch as written to an export file. SysEx stays an untyped value until
/// import so one bad entry fails only that entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedPatch {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysex: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysex_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub patch_type: PatchType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
}

impl ExportedPatch {
    pub fn from_patch(patch: &Patch) -> Self {
        let (sysex, sysex_encoding) = match &patch.sysex {
            Some(bytes) => (
                Some(Value::String(STANDARD.encode(bytes))),
                Some(SYSEX_ENCODING_BASE64.to_string()),
            ),
            None => (None, None),
        };
        Self {
            id: patch.id.clone(),
            name: patch.name.clone(),
            device: patch.device.clone(),
            manufacturer: patch.manufacturer.clone(),
            category: Some(patch.category.clone()),
            tags: patch.tags.clone(),
            sysex,
            sysex_encoding,
            parameters: patch.parameters.clone(),
            patch_type: patch.patch_type,
            plugin_id: patch.plugin_id.clone(),
        }
    }

    /// Decode the SysEx payload. Text is base64 (tagged or not); a JSON array
    /// of integers 0..=255 is taken as raw bytes.
    pub fn decode_sysex(&self) -> Result<Option<Vec<u8>>> {
        let value = match &self.sysex {
            Some(Value::Null) | None => return Ok(None),
            Some(v) => v,
        };

        match value {
            Value::String(text) => {
                if let Some(encoding) = &self.sysex_encoding {
                    if !encoding.eq_ignore_ascii_case(SYSEX_ENCODING_BASE64) {
                        return Err(AtlasError::InvalidInput(format!(
                            "unsupported sysex encoding \"{}\"",
                            encoding
                        )));
                    }
                }
                Ok(Some(STANDARD.decode(text.trim())?))
            }
            Value::Array(items) => {
                let bytes = items
                    .iter()
                    .map(|v| {
                        v.as_u64()
                            .filter(|n| *n <= u8::MAX as u64)
                            .map(|n| n as u8)
                            .ok_or_else(|| {
                                AtlasError::InvalidInput(format!("invalid sysex byte {}", v))
                            })
                    })
                    .collect::<Result<Vec<u8>>>()?;
                Ok(Some(bytes))
            }
            other => Err(AtlasError::InvalidInput(format!(
                "sysex must be base64 text or a byte array, got {}",
                other
            ))),
        }
    }
}

/// Result of importing a set export
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetImportSummary {
    pub set: PatchSet,
    pub imported: usize,
    pub failed: usize,
    pub patch_ids: Vec<String>,
    pub errors: Vec<String>,
}

impl SetImportSummary {
    /// Turn any per-patch failure into `PartialFailure`
    pub fn into_result(self) -> Result<Self> {
        if self.failed > 0 {
            return Err(AtlasError::PartialFailure {
                succeeded: self.imported,
                failed: self.failed,
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exported(sysex: Option<Value>, encoding: Option<&str>) -> ExportedPatch {
        ExportedPatch {
            id: "p".into(),
            name: "Brass".into(),
            device: String::new(),
            manufacturer: None,
            category: None,
            tags: vec![],
            sysex,
            sysex_encoding: encoding.map(str::to_string),
            parameters: None,
            patch_type: PatchType::Hardware,
            plugin_id: None,
        }
    }

    #[test]
    fn test_decode_base64_and_byte_array() {
        let tagged = exported(Some(Value::String("8EH3".into())), Some("base64"));
        assert_eq!(tagged.decode_sysex().unwrap(), Some(vec![0xF0, 0x41, 0xF7]));

        let array = exported(Some(serde_json::json!([240, 67, 247])), None);
        assert_eq!(array.decode_sysex().unwrap(), Some(vec![0xF0, 0x43, 0xF7]));

        assert_eq!(exported(None, None).decode_sysex().unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(exported(Some(serde_json::json!([240, 300])), None).decode_sysex().is_err());
        assert!(exported(Some(Value::String("8EH3".into())), Some("hex")).decode_sysex().is_err());
        assert!(exported(Some(Value::String("***".into())), None).decode_sysex().is_err());
        assert!(exported(Some(serde_json::json!({"a": 1})), None).decode_sysex().is_err());
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let text = r#"{"kind":"something-else","version":1,"set":{"id":"s","name":"n","device":"d"},"patches":[]}"#;
        assert!(matches!(SetExport::from_json(text), Err(AtlasError::InvalidInput(_))));
    }

    #[test]
    fn test_summary_into_result() {
        let set = PatchSet {
            id: "s".into(),
            name: "Live".into(),
            device: "X".into(),
            description: String::new(),
            created: String::new(),
            modified: String::new(),
        };
        let ok = SetImportSummary { set: set.clone(), imported: 2, failed: 0, patch_ids: vec![], errors: vec![] };
        assert!(ok.into_result().is_ok());

        let partial = SetImportSummary { set, imported: 1, failed: 1, patch_ids: vec![], errors: vec!["bad".into()] };
        assert!(matches!(
            partial.into_result(),
            Err(AtlasError::PartialFailure { succeeded: 1, failed: 1 })
        ));
    }
}
