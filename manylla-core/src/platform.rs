//! Platform-specific utilities for cross-platform support

use std::path::PathBuf;

/// Get the platform-specific data directory for storing application data
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\Manylla
/// - macOS: ~/Library/Application Support/Manylla
/// - Linux/Other: ~/.local/share/Manylla
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("Manylla")
}

/// Get the platform-specific config directory
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("Manylla")
}

/// Get the default key-value store path
pub fn get_default_store_path() -> PathBuf {
    get_data_dir().join("store.json")
}

/// Get the default sync config file path
pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("sync.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_app_directories() {
        assert!(get_data_dir().ends_with("Manylla"));
        assert!(get_default_store_path().ends_with("Manylla/store.json"));
        assert!(get_default_config_path().ends_with("Manylla/sync.toml"));
    }
}
