use std::path::{Path, PathBuf};

pub const SCREENSHOTS_DIR: &str = "screenshots";
pub const CONFIG_FILE: &str = "config.toml";
pub const CLARIFICATION_DIR: &str = "clarification_data";

pub fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => {
            let path = PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("intention-monitor");
            let _ = std::fs::create_dir_all(&path);
            path
        }
        None => PathBuf::from("."),
    }
}

/// Root of every session's capture directory; the storage quota covers this whole tree.
pub fn screenshots_root(data_dir: &Path) -> PathBuf {
    data_dir.join(SCREENSHOTS_DIR)
}

/// Where `<task>_clarification.json` files with augmented intentions are kept.
pub fn clarification_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(CLARIFICATION_DIR)
}
