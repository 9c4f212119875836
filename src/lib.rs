// Patch Atlas - Library Entry Point

pub mod config;
pub mod constants;
pub mod error;
pub mod db;
pub mod library;
pub mod midi;
pub mod plugins;
pub mod session;

pub use config::{AtlasConfig, BackendPreference};
pub use error::{AtlasError, Result};
pub use library::PatchLibrary;
pub use midi::{MidiTransport, Provider, ProviderKind, VirtualTransport};
pub use session::DeviceSessionManager;

/// Current time as an RFC 3339 UTC string with millisecond precision
pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}
