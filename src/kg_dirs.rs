//! Application directory paths for kgsim.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | App data | `~/Library/Application Support/kgsim/` | `~/.local/share/kgsim/` |
//! | Config | `~/Library/Application Support/kgsim/` | `~/.config/kgsim/` |
//!
//! # Environment Overrides
//!
//! - `KGSIM_DATA_DIR` overrides [`data_dir`]
//! - `KGSIM_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// Application data root directory.
///
/// Holds remembered chats and log files. Resolves to `dirs::data_dir()/kgsim/`
/// unless `KGSIM_DATA_DIR` is set.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("KGSIM_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("kgsim"))
        .unwrap_or_else(|| PathBuf::from("/tmp/kgsim-data"))
}

/// Application config directory.
///
/// Resolves to `dirs::config_dir()/kgsim/` unless `KGSIM_CONFIG_DIR` is set.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("KGSIM_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("kgsim"))
        .unwrap_or_else(|| PathBuf::from("/tmp/kgsim-config"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Remembered chat file (`data_dir()/chats.json`).
#[must_use]
pub fn chats_file() -> PathBuf {
    data_dir().join("chats.json")
}
