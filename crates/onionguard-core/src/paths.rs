//! Standard paths used by onionguard

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Standard onionguard paths
pub struct Paths {
    /// Data directory (~/.local/share/onionguard)
    pub data: PathBuf,
    /// Config directory (~/.config/onionguard)
    pub config: PathBuf,
    /// Runtime directory (/run/onionguard or ~/.local/run/onionguard)
    pub runtime: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("onionguard");

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("onionguard");

        // /run/onionguard exists when installed as a system service
        let runtime = if PathBuf::from("/run/onionguard").exists() {
            PathBuf::from("/run/onionguard")
        } else {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join(".local")
                .join("run")
                .join("onionguard")
        };

        Self {
            data,
            config,
            runtime,
        }
    }

    /// Build paths rooted at a single directory (tests, portable installs)
    pub fn rooted(root: &Path) -> Self {
        Self {
            data: root.join("data"),
            config: root.join("config"),
            runtime: root.join("run"),
        }
    }

    /// Default configuration file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.yaml")
    }

    /// Append-only event journal
    pub fn journal(&self) -> PathBuf {
        self.data.join("journal.log")
    }

    /// Control socket of the daemon
    pub fn socket(&self) -> PathBuf {
        if let Ok(path) = std::env::var("ONIONGUARD_SOCKET") {
            return PathBuf::from(path);
        }
        self.runtime.join("onionguard.sock")
    }
}

/// Create the parent directory of a file if it does not exist yet
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_layout() {
        let paths = Paths::rooted(Path::new("/tmp/og"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/og/config/config.yaml"));
        assert_eq!(paths.journal(), PathBuf::from("/tmp/og/data/journal.log"));
    }

    #[test]
    fn test_ensure_parent_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a").join("b").join("journal.log");
        ensure_parent(&file).unwrap();
        assert!(dir.path().join("a").join("b").is_dir());
    }
}
