//! Storage layer for the data directory (settings JSON and catalog path)

use crate::error::EngineError;
use blockget_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;

const SETTINGS_FILE: &str = "settings.json";
const CATALOG_FILE: &str = "missions.db";

/// Storage manager for blockget data
#[derive(Clone, Debug)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance, creating the data directory
    pub async fn new(data_dir: PathBuf) -> Result<Self, EngineError> {
        fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| EngineError::io_at(e, &data_dir))?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the finished-mission catalog database
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(CATALOG_FILE)
    }

    fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Load settings, falling back to defaults when none were saved
    pub async fn load_settings(&self) -> Result<Settings, EngineError> {
        let path = self.settings_path();
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(EngineError::io_at(e, &path)),
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), EngineError> {
        let path = self.settings_path();
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&path, content)
            .await
            .map_err(|e| EngineError::io_at(e, &path))?;
        Ok(())
    }

    /// Remove saved settings so defaults apply again
    pub async fn reset_settings(&self) -> Result<Settings, EngineError> {
        crate::engine::remove_file_if_exists(&self.settings_path()).await?;
        Ok(Settings::default())
    }
}
