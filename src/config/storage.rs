//! Settings Storage
//!
//! Handles reading/writing the settings file.
//! Location: ~/.ventusflow/settings.json, overridable via `VENTUSFLOW_SETTINGS`.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{Settings, SETTINGS_VERSION};

/// Environment variable overriding the settings file location
pub const SETTINGS_ENV: &str = "VENTUSFLOW_SETTINGS";

/// Settings storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Get the VentusFlow configuration directory (~/.ventusflow)
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".ventusflow"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the settings file path, honouring the environment override
pub fn settings_file() -> Result<PathBuf, StorageError> {
    if let Some(path) = std::env::var_os(SETTINGS_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(config_dir()?.join("settings.json"))
}

/// Settings storage manager
pub struct SettingsStorage {
    path: PathBuf,
}

impl SettingsStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: settings_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load settings from disk
    ///
    /// A missing file yields defaults. A corrupted file is backed up and
    /// defaults are returned.
    pub async fn load(&self) -> Result<Settings, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
                Ok(settings) => {
                    if settings.version > SETTINGS_VERSION {
                        return Err(StorageError::VersionTooNew {
                            found: settings.version,
                            supported: SETTINGS_VERSION,
                        });
                    }
                    Ok(settings)
                }
                Err(e) => {
                    tracing::warn!("Settings file corrupted: {}", e);
                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted settings backed up to {:?}, using defaults",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted settings: {}", backup_err);
                        }
                    }
                    Ok(Settings::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Load settings, writing the defaults out on first run so they can be edited
    pub async fn load_or_init(&self) -> Result<Settings, StorageError> {
        let exists = self.exists().await;
        let settings = self.load().await?;
        if !exists {
            if let Err(e) = self.save(&settings).await {
                tracing::warn!("Could not write default settings to {:?}: {}", self.path, e);
            }
        }
        Ok(settings)
    }

    /// Save settings to disk (temp file + rename)
    pub async fn save(&self, settings: &Settings) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(settings)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the settings file
    pub fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Copy the current file to `settings.json.bak`
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension("json.bak");

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}
