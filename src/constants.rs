// Patch Atlas Constants
// Wire values and limits shared by the store, the session manager and the CLI.

// Paths
pub const ATLAS_FOLDER: &str = ".patch-atlas";
pub const DB_FILENAME: &str = "library.db";
pub const JSON_FILENAME: &str = "library.json";
pub const TEMP_FILE_SUFFIX: &str = ".tmp";

// Environment overrides
pub const ENV_DATA_DIR: &str = "ATLAS_DATA_DIR";
pub const ENV_BACKEND: &str = "ATLAS_BACKEND";
pub const ENV_PROVIDER: &str = "ATLAS_PROVIDER";
pub const ENV_LOG: &str = "ATLAS_LOG";

// MIDI client name shown to the OS
pub const MIDI_CLIENT_NAME: &str = "Patch Atlas";

// Patch defaults
pub const DEFAULT_CATEGORY: &str = "Uncategorized";
pub const PLUGIN_PRESET_CATEGORY: &str = "Plugin Preset";
pub const IMPORTED_CATEGORY: &str = "Imported";
pub const UNKNOWN_MANUFACTURER: &str = "Unknown";

// Tags applied by capture and set import
pub const TAG_IMPORTED: &str = "imported";
pub const TAG_SYSEX: &str = "sysex";
pub const TAG_SET: &str = "set";

// Set export file
pub const SET_EXPORT_KIND: &str = "atlas-patch-set";
pub const SET_EXPORT_VERSION: u32 = 1;
pub const SYSEX_ENCODING_BASE64: &str = "base64";

// JSON document schema version
pub const DOCUMENT_VERSION: u32 = 1;

// SysEx framing
pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;

// Universal Non-realtime Identity Request, all devices
pub const IDENTITY_REQUEST: [u8; 6] = [0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7];

// Audition thru
pub const THRU_DEFAULT_DURATION_MS: u64 = 25_000;
pub const THRU_MIN_DURATION_MS: u64 = 5_000;
pub const THRU_MAX_DURATION_MS: u64 = 120_000;
pub const ACTIVE_INPUT_WINDOW_MS: u64 = 15_000;

// Search
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

// Plugin bundle extensions
pub const VST3_EXTENSIONS: [&str; 1] = ["vst3"];
pub const AU_EXTENSIONS: [&str; 1] = ["component"];
pub const VST2_EXTENSIONS: [&str; 3] = ["vst", "dll", "so"];
pub const CLAP_EXTENSIONS: [&str; 1] = ["clap"];
