//! Blockget Core - resumable segmented download engine
//!
//! This crate provides the mission engine used by the blockget CLI.
//! It handles block-based parallel downloads, pause/resume, crash recovery
//! and the catalog of finished downloads.

pub mod engine;
mod error;
pub mod naming;
mod storage;

pub use engine::{
    FinishedCatalog, MemoryCatalog, Mission, MissionRequest, MissionStore, SqliteCatalog,
    StartedMission,
};
pub use error::*;
pub use storage::*;

use blockget_types::{MissionEvent, MissionId, MissionInfo, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// The main blockget core instance
#[derive(Clone)]
pub struct BlockgetCore {
    /// Data directory storage
    pub storage: Storage,
    settings: Settings,
    store: Arc<MissionStore>,
    event_tx: broadcast::Sender<MissionEvent>,
}

impl BlockgetCore {
    /// Open the data directory, load settings and recover missions
    pub async fn new(data_dir: PathBuf) -> Result<Self, EngineError> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await?;
        let catalog = Arc::new(SqliteCatalog::new(storage.catalog_path()).await?);
        Self::with_catalog(storage, settings, catalog).await
    }

    /// Build a core around an explicit catalog and settings
    pub async fn with_catalog(
        storage: Storage,
        settings: Settings,
        catalog: Arc<dyn FinishedCatalog>,
    ) -> Result<Self, EngineError> {
        let (event_tx, _) = broadcast::channel(1000);
        let store = MissionStore::open(settings.clone(), catalog, event_tx.clone()).await?;

        Ok(Self {
            storage,
            settings,
            store: Arc::new(store),
            event_tx,
        })
    }

    /// Subscribe to mission events
    pub fn subscribe(&self) -> broadcast::Receiver<MissionEvent> {
        self.event_tx.subscribe()
    }

    pub fn store(&self) -> &MissionStore {
        &self.store
    }

    // ========================================================================
    // Mission Operations
    // ========================================================================

    pub async fn start_mission(&self, request: MissionRequest) -> Result<StartedMission, EngineError> {
        self.store.start_mission(request).await
    }

    pub async fn resume_mission(&self, id: MissionId) -> Result<bool, EngineError> {
        self.store.resume_mission(id).await
    }

    pub async fn retry_mission(&self, id: MissionId) -> Result<bool, EngineError> {
        self.store.retry_mission(id).await
    }

    pub async fn pause_mission(&self, id: MissionId) -> Result<bool, EngineError> {
        self.store.pause_mission(id).await
    }

    pub async fn delete_mission(&self, id: MissionId) -> Result<(), EngineError> {
        self.store.delete_mission(id).await
    }

    pub async fn mission(&self, id: MissionId) -> Result<MissionInfo, EngineError> {
        self.store.info(id).await
    }

    pub async fn id_at(&self, index: usize) -> Option<MissionId> {
        self.store.id_at(index).await
    }

    pub async fn list_missions(&self) -> Vec<MissionInfo> {
        self.store.list().await
    }

    /// Pause everything and wait for in-flight blocks to land
    pub async fn shutdown(&self) {
        self.store.shutdown().await
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Settings the engine was opened with
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Persist new settings; they apply the next time the core is opened
    pub async fn update_settings(&self, settings: &Settings) -> Result<(), EngineError> {
        self.storage.save_settings(settings).await
    }
}
