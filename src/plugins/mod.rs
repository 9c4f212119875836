// Plugin bundle discovery
// Finds installed plugins by file extension. Preset files are not parsed.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::constants::{AU_EXTENSIONS, CLAP_EXTENSIONS, VST2_EXTENSIONS, VST3_EXTENSIONS};
use crate::library::strip_arch_suffixes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginFormat {
    Vst3,
    AudioUnit,
    Vst2,
    Clap,
}

impl PluginFormat {
    /// Value stored in the plugin `type` column
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginFormat::Vst3 => "VST3",
            PluginFormat::AudioUnit => "AU",
            PluginFormat::Vst2 => "VST2",
            PluginFormat::Clap => "CLAP",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_lowercase();
        let ext = ext.as_str();
        if VST3_EXTENSIONS.contains(&ext) {
            Some(PluginFormat::Vst3)
        } else if AU_EXTENSIONS.contains(&ext) {
            Some(PluginFormat::AudioUnit)
        } else if VST2_EXTENSIONS.contains(&ext) {
            Some(PluginFormat::Vst2)
        } else if CLAP_EXTENSIONS.contains(&ext) {
            Some(PluginFormat::Clap)
        } else {
            None
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

impl fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plugin bundle found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedPlugin {
    pub name: String,
    pub format: PluginFormat,
    pub path: PathBuf,
}

/// Result of merging a scan into the library
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub found: usize,
    pub added: usize,
    pub updated: usize,
}

/// Walk each directory and report plugin bundles, sorted by name. Bundles are
/// directories on macOS, so a match is never descended into. Missing
/// directories are skipped.
pub fn scan_dirs(dirs: &[PathBuf]) -> Vec<ScannedPlugin> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for dir in dirs {
        if !dir.is_dir() {
            log::debug!("Plugin folder {} not present", dir.display());
            continue;
        }

        let mut walker = WalkDir::new(dir).follow_links(true).into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::debug!("Skipping unreadable plugin path: {}", e);
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }

            let Some(format) = PluginFormat::from_path(entry.path()) else {
                continue;
            };
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            if !seen.insert(entry.path().to_path_buf()) {
                continue;
            }
            found.push(ScannedPlugin {
                name: clean_name(entry.path()),
                format,
                path: entry.path().to_path_buf(),
            });
        }
    }

    found.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.path.cmp(&b.path))
    });
    log::info!("Plugin scan found {} bundles in {} folders", found.len(), dirs.len());
    found
}

/// Display name from a bundle path: file stem without architecture markers
pub fn clean_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    strip_arch_suffixes(&stem)
}

/// Standard plugin folders for this platform (existing or not)
pub fn default_dirs() -> Vec<PathBuf> {
    let home = BaseDirs::new().map(|d| d.home_dir().to_path_buf());
    let mut dirs = Vec::new();

    if cfg!(target_os = "macos") {
        for sub in ["VST3", "Components", "VST", "CLAP"] {
            dirs.push(PathBuf::from("/Library/Audio/Plug-Ins").join(sub));
            if let Some(home) = &home {
                dirs.push(home.join("Library/Audio/Plug-Ins").join(sub));
            }
        }
    } else if cfg!(target_os = "windows") {
        dirs.push(PathBuf::from(r"C:\Program Files\Common Files\VST3"));
        dirs.push(PathBuf::from(r"C:\Program Files\Common Files\CLAP"));
        dirs.push(PathBuf::from(r"C:\Program Files\VSTPlugins"));
        dirs.push(PathBuf::from(r"C:\Program Files\Steinberg\VSTPlugins"));
    } else {
        for sub in ["vst3", "vst", "clap"] {
            dirs.push(PathBuf::from("/usr/lib").join(sub));
            dirs.push(PathBuf::from("/usr/local/lib").join(sub));
            if let Some(home) = &home {
                dirs.push(home.join(format!(".{}", sub)));
            }
        }
    }

    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(PluginFormat::from_extension("VST3"), Some(PluginFormat::Vst3));
        assert_eq!(PluginFormat::from_extension("component"), Some(PluginFormat::AudioUnit));
        assert_eq!(PluginFormat::from_extension("dll"), Some(PluginFormat::Vst2));
        assert_eq!(PluginFormat::from_extension("clap"), Some(PluginFormat::Clap));
        assert_eq!(PluginFormat::from_extension("wav"), None);
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name(Path::new("/p/Serum_x64.dll")), "Serum");
        assert_eq!(clean_name(Path::new("/p/Pro-Q 3.vst3")), "Pro-Q 3");
    }

    #[test]
    fn test_scan_finds_bundles_without_descending() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        // macOS-style bundle with a nested binary that must not be reported twice
        let bundle = root.join("Diva.vst3");
        fs::create_dir_all(bundle.join("Contents/x86_64-linux")).unwrap();
        fs::write(bundle.join("Contents/x86_64-linux/Diva.so"), b"").unwrap();

        fs::create_dir_all(root.join("Vendor")).unwrap();
        fs::write(root.join("Vendor/Serum (x64).dll"), b"").unwrap();
        fs::write(root.join("Vendor/Surge XT.clap"), b"").unwrap();
        fs::write(root.join("readme.txt"), b"").unwrap();

        let missing = root.join("nope");
        let found = scan_dirs(&[root.to_path_buf(), missing]);

        let summary: Vec<(&str, PluginFormat)> =
            found.iter().map(|p| (p.name.as_str(), p.format)).collect();
        assert_eq!(
            summary,
            vec![
                ("Diva", PluginFormat::Vst3),
                ("Serum", PluginFormat::Vst2),
                ("Surge XT", PluginFormat::Clap),
            ]
        );
    }

    #[test]
    fn test_overlapping_dirs_report_once() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Dexed.clap"), b"").unwrap();
        let found = scan_dirs(&[dir.path().to_path_buf(), dir.path().to_path_buf()]);
        assert_eq!(found.len(), 1);
    }
}
