//! Configuration for backup runs, loaded from TOML.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default streaming copy unit
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub vault: VaultLayout,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

/// Which files of a vault take part in a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultLayout {
    /// Well-known files directly under the vault root
    pub top_level_files: Vec<String>,
    /// Directories walked recursively
    pub subtrees: Vec<String>,
    pub credentials_file: String,
    pub lock_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub buffer_size: usize,
    /// Scratch directory created under the backup root
    pub temp_dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub verbose: bool,
}

impl Default for VaultLayout {
    fn default() -> Self {
        Self {
            top_level_files: vec![
                "main.index".to_string(),
                "credentials.json".to_string(),
                "media_ids.json".to_string(),
                "tasks.json".to_string(),
                "albums.pmv".to_string(),
                "tag_list.pmv".to_string(),
                "user_config.pmv".to_string(),
            ],
            subtrees: vec![
                "tags".to_string(),
                "media".to_string(),
                "thumb_album".to_string(),
            ],
            credentials_file: "credentials.json".to_string(),
            lock_file: "vault.lock".to_string(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            temp_dir: "temp".to_string(),
        }
    }
}

impl BackupConfig {
    /// Load from an explicit file, else the per-user file if present, else defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::user_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| Error::Configuration {
            reason: format!("Failed to read config file {}: {}", path.display(), e),
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.buffer_size == 0 {
            return Err(Error::Configuration {
                reason: "transfer.buffer_size must be greater than zero".to_string(),
            });
        }
        if self.transfer.temp_dir.trim().is_empty() {
            return Err(Error::Configuration {
                reason: "transfer.temp_dir cannot be empty".to_string(),
            });
        }
        if self.vault.credentials_file.trim().is_empty() {
            return Err(Error::Configuration {
                reason: "vault.credentials_file cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vault-backup").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_layout_covers_vault_files() {
        let config = BackupConfig::default();
        assert!(config.vault.top_level_files.contains(&"credentials.json".to_string()));
        assert_eq!(config.vault.subtrees, vec!["tags", "media", "thumb_album"]);
        assert_eq!(config.transfer.buffer_size, DEFAULT_BUFFER_SIZE);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[transfer]\nbuffer_size = 4096\n\n[logging]\nverbose = true\n")?;

        let config = BackupConfig::load(Some(&path))?;
        assert_eq!(config.transfer.buffer_size, 4096);
        assert_eq!(config.transfer.temp_dir, "temp");
        assert!(config.logging.verbose);
        assert_eq!(config.vault, VaultLayout::default());
        Ok(())
    }

    #[test]
    fn test_rejects_zero_buffer() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[transfer]\nbuffer_size = 0\n")?;

        let result = BackupConfig::load(Some(&path));
        assert!(matches!(result, Err(Error::Configuration { .. })));
        Ok(())
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = BackupConfig::load(Some(Path::new("/nonexistent/vault-backup.toml")));
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }
}
