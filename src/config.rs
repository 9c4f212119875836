// Runtime configuration
// Resolved from environment variables with built-in defaults. The CLI layers
// its own flags on top (clap reads the same variables).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use directories::BaseDirs;

use crate::constants::{ATLAS_FOLDER, ENV_BACKEND, ENV_DATA_DIR, ENV_LOG, ENV_PROVIDER};
use crate::db;
use crate::midi::ProviderKind;

/// Which storage engine to open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendPreference {
    /// SQLite, or the JSON document if SQLite cannot be opened
    #[default]
    Auto,
    Sqlite,
    Json,
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPreference::Auto => f.write_str("auto"),
            BackendPreference::Sqlite => f.write_str("sqlite"),
            BackendPreference::Json => f.write_str("json"),
        }
    }
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(BackendPreference::Auto),
            "sqlite" | "db" => Ok(BackendPreference::Sqlite),
            "json" => Ok(BackendPreference::Json),
            other => Err(format!("unknown backend \"{}\" (expected auto, sqlite or json)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AtlasConfig {
    pub data_dir: PathBuf,
    pub backend: BackendPreference,
    pub provider: ProviderKind,
    pub log_level: String,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: BackendPreference::default(),
            provider: ProviderKind::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AtlasConfig {
    /// Defaults overridden by `ATLAS_*` environment variables. Unparseable
    /// values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = env_value(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(value) = env_value(ENV_BACKEND) {
            match value.parse() {
                Ok(backend) => config.backend = backend,
                Err(e) => log::warn!("Ignoring {}: {}", ENV_BACKEND, e),
            }
        }
        if let Some(value) = env_value(ENV_PROVIDER) {
            match value.parse() {
                Ok(provider) => config.provider = provider,
                Err(e) => log::warn!("Ignoring {}: {}", ENV_PROVIDER, e),
            }
        }
        if let Some(level) = env_value(ENV_LOG) {
            config.log_level = level;
        }

        config
    }

    pub fn with_data_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn db_path(&self) -> PathBuf {
        db::get_db_path(&self.data_dir)
    }

    pub fn json_path(&self) -> PathBuf {
        db::get_json_path(&self.data_dir)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `~/.patch-atlas`, or the working directory when no home is known
pub fn default_data_dir() -> PathBuf {
    match BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(ATLAS_FOLDER),
        None => PathBuf::from(ATLAS_FOLDER),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_preference_parse() {
        assert_eq!("AUTO".parse::<BackendPreference>().unwrap(), BackendPreference::Auto);
        assert_eq!(" sqlite ".parse::<BackendPreference>().unwrap(), BackendPreference::Sqlite);
        assert_eq!("json".parse::<BackendPreference>().unwrap(), BackendPreference::Json);
        assert!("mongo".parse::<BackendPreference>().is_err());
    }

    #[test]
    fn test_with_data_dir_paths() {
        let config = AtlasConfig::with_data_dir("/tmp/atlas-test");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/atlas-test/library.db"));
        assert_eq!(config.json_path(), PathBuf::from("/tmp/atlas-test/library.json"));
        assert_eq!(config.backend, BackendPreference::Auto);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_default_data_dir_ends_with_folder() {
        assert!(default_data_dir().ends_with(ATLAS_FOLDER));
    }
}
