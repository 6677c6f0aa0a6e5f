//! Mission store - owns every known mission
//!
//! Missions are kept newest-first. On startup the store loads the finished
//! catalog (evicting records whose file is gone) and then scans the
//! configured locations for ledgers of unfinished missions.

use crate::engine::catalog::FinishedCatalog;
use crate::engine::ledger::{is_ledger_file, ledger_path, remove_if_exists, MissionLedger};
use crate::engine::mission::Mission;
use crate::engine::task::RunContext;
use crate::error::EngineError;
use crate::naming::{filename_from_url, generate_unique_name};
use blockget_types::{FinishedRecord, MissionEvent, MissionId, MissionInfo, Settings};
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Handle and position of a newly started mission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedMission {
    pub id: MissionId,
    pub index: usize,
}

/// Parameters of a new mission; unset fields fall back to settings
#[derive(Debug, Clone, Default)]
pub struct MissionRequest {
    pub url: String,
    pub location: Option<PathBuf>,
    pub name: Option<String>,
    pub is_audio: bool,
    pub threads: Option<u32>,
}

impl MissionRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Owner of all missions, newest first
pub struct MissionStore {
    missions: RwLock<Vec<Arc<Mission>>>,
    client: Client,
    catalog: Arc<dyn FinishedCatalog>,
    settings: Settings,
    event_tx: broadcast::Sender<MissionEvent>,
}

/// Index at which a mission created at `created_at` belongs
fn insert_position(missions: &[Arc<Mission>], created_at: DateTime<Utc>) -> usize {
    missions
        .iter()
        .position(|m| m.created_at() <= created_at)
        .unwrap_or(missions.len())
}

impl MissionStore {
    pub fn new(
        settings: Settings,
        catalog: Arc<dyn FinishedCatalog>,
        event_tx: broadcast::Sender<MissionEvent>,
    ) -> Result<Self, EngineError> {
        let mut builder = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs));
        if let Some(secs) = settings.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build()?;

        Ok(Self {
            missions: RwLock::new(Vec::new()),
            client,
            catalog,
            settings,
            event_tx,
        })
    }

    /// Create a store and recover finished and unfinished missions
    pub async fn open(
        settings: Settings,
        catalog: Arc<dyn FinishedCatalog>,
        event_tx: broadcast::Sender<MissionEvent>,
    ) -> Result<Self, EngineError> {
        let store = Self::new(settings, catalog, event_tx)?;
        store.recover().await?;
        Ok(store)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MissionEvent> {
        self.event_tx.subscribe()
    }

    fn context(&self) -> RunContext {
        RunContext {
            client: self.client.clone(),
            catalog: Arc::clone(&self.catalog),
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Load the finished catalog and scan for ledgers.
    ///
    /// Returns the number of missions added.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let mut recovered = 0;

        let mut records = self.catalog.load_missions().await?;
        records.sort_by_key(|record| record.created_at);
        for record in records {
            let exists = tokio::fs::try_exists(record.path()).await.unwrap_or(false);
            if !exists {
                info!("Finished file {} is gone, evicting", record.path().display());
                if let Err(e) = self.catalog.delete_mission(&record).await {
                    warn!("Failed to evict {} from catalog: {}", record.name, e);
                }
                continue;
            }
            let mission = Mission::from_finished(
                record,
                self.settings.block_size,
                self.event_tx.clone(),
            );
            if self.insert_recovered(mission).await {
                recovered += 1;
            }
        }

        for location in self.settings.scan_locations() {
            recovered += self.scan_location(&location).await;
        }

        info!("Recovered {} missions", recovered);
        Ok(recovered)
    }

    async fn scan_location(&self, location: &Path) -> usize {
        let mut entries = match tokio::fs::read_dir(location).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Skipping scan of {}: {}", location.display(), e);
                return 0;
            }
        };

        let mut recovered = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Scan of {} stopped: {}", location.display(), e);
                    break;
                }
            };
            let path = entry.path();
            if !is_ledger_file(&path) {
                continue;
            }

            let ledger = match MissionLedger::load(&path).await {
                Ok(ledger) => ledger,
                Err(e) => {
                    warn!("Skipping unreadable ledger {}: {}", path.display(), e);
                    continue;
                }
            };

            if ledger.finished {
                if self.adopt_finished(&path, ledger).await {
                    recovered += 1;
                }
                continue;
            }

            let mission = Mission::from_ledger(ledger, self.event_tx.clone());
            if self.insert_recovered(mission).await {
                recovered += 1;
            }
        }
        recovered
    }

    /// Move a finished ledger into the catalog, replacing any older record
    /// for the same file. The ledger is only removed once the record is
    /// stored; a ledger whose file is gone is dropped.
    async fn adopt_finished(&self, path: &Path, ledger: MissionLedger) -> bool {
        let record = FinishedRecord {
            url: ledger.url,
            location: ledger.location,
            name: ledger.name,
            length: ledger.length.unwrap_or(0),
            created_at: ledger.created_at,
        };

        let exists = tokio::fs::try_exists(record.path()).await.unwrap_or(false);
        if exists {
            if let Err(e) = self.catalog.update_mission(&record).await {
                warn!("Failed to record finished mission {}: {}", record.name, e);
                return false;
            }
        }

        debug!("Removing ledger of finished mission {}", path.display());
        if let Err(e) = remove_if_exists(path).await {
            warn!("Failed to remove ledger {}: {}", path.display(), e);
        }
        if !exists {
            return false;
        }

        let mission = Mission::from_finished(record, self.settings.block_size, self.event_tx.clone());
        self.missions
            .write()
            .await
            .retain(|m| !(m.location() == mission.location() && m.name() == mission.name()));
        self.insert_recovered(mission).await
    }

    async fn insert_recovered(&self, mission: Mission) -> bool {
        let mut missions = self.missions.write().await;
        let taken = missions.iter().any(|m| {
            m.id() == mission.id() || (m.location() == mission.location() && m.name() == mission.name())
        });
        if taken {
            debug!("Mission {} already known, skipping", mission.name());
            return false;
        }
        let position = insert_position(&missions, mission.created_at());
        missions.insert(position, Arc::new(mission));
        true
    }

    // ========================================================================
    // Mission Operations
    // ========================================================================

    /// Create a mission, start it and return its handle and position
    pub async fn start_mission(&self, request: MissionRequest) -> Result<StartedMission, EngineError> {
        let url = url::Url::parse(&request.url)
            .map_err(|_| EngineError::InvalidUrl(request.url.clone()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EngineError::InvalidUrl(request.url.clone()));
        }

        let location = request
            .location
            .unwrap_or_else(|| self.settings.download_dir.clone());
        if let Ok(metadata) = tokio::fs::metadata(&location).await {
            if !metadata.is_dir() {
                return Err(EngineError::InvalidLocation(location));
            }
        }
        tokio::fs::create_dir_all(&location)
            .await
            .map_err(|e| EngineError::io_at(e, &location))?;

        let name = request
            .name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| filename_from_url(&url));
        let threads = request.threads.unwrap_or(self.settings.default_threads);

        // A finished mission on the same file is superseded
        if let Some(existing) = self.mission_by_location(&location, &name).await {
            if existing.is_finished().await {
                info!("Replacing finished mission {} ({})", existing.id(), name);
                self.delete_mission(existing.id()).await?;
            }
        }

        let (mission, index) = {
            let mut missions = self.missions.write().await;

            let reserved: HashSet<String> = missions
                .iter()
                .filter(|m| m.location() == location)
                .map(|m| m.name().to_string())
                .collect();
            let known = reserved.contains(&name);
            let on_disk = tokio::fs::try_exists(location.join(&name)).await.unwrap_or(false)
                || tokio::fs::try_exists(ledger_path(&location, &name))
                    .await
                    .unwrap_or(false);
            let name = if known || on_disk {
                let unique =
                    generate_unique_name(
                    &location,
                    &name,
                    &reserved,
                    self.settings.max_name_attempts,
                )
                .await?;
                debug!("{} is taken, using {}", name, unique);
                unique
            } else {
                name
            };

            let mission = Arc::new(Mission::new(
                url.to_string(),
                location,
                name,
                request.is_audio,
                threads,
                self.settings.block_size,
                self.event_tx.clone(),
            ));
            let index = insert_position(&missions, mission.created_at());
            missions.insert(index, Arc::clone(&mission));
            (mission, index)
        };

        info!("Mission {} added: {} -> {}", mission.id(), mission.url(), mission.output_path().display());
        let _ = self.event_tx.send(MissionEvent::MissionAdded {
            mission: mission.info().await,
        });

        mission.launch(self.context()).await;

        Ok(StartedMission {
            id: mission.id(),
            index,
        })
    }

    /// Resume a paused mission; returns whether a run was started
    pub async fn resume_mission(&self, id: MissionId) -> Result<bool, EngineError> {
        let mission = self.get(id).await?;
        Ok(mission.launch(self.context()).await)
    }

    /// Clear the stored error of a failed mission and start it again
    pub async fn retry_mission(&self, id: MissionId) -> Result<bool, EngineError> {
        let mission = self.get(id).await?;
        if !mission.clear_error().await {
            return Ok(false);
        }
        info!("Retrying mission {}", id);
        Ok(mission.launch(self.context()).await)
    }

    /// Pause a running mission; returns whether it was running
    pub async fn pause_mission(&self, id: MissionId) -> Result<bool, EngineError> {
        let mission = self.get(id).await?;
        Ok(mission.pause().await)
    }

    /// Stop a mission and remove its output file, ledger and catalog record
    pub async fn delete_mission(&self, id: MissionId) -> Result<(), EngineError> {
        let mission = {
            let mut missions = self.missions.write().await;
            let index = missions
                .iter()
                .position(|m| m.id() == id)
                .ok_or(EngineError::NotFound(id))?;
            missions.remove(index)
        };

        mission.cancel_and_wait().await;

        let output = mission.output_path();
        remove_if_exists(&output)
            .await
            .map_err(|e| EngineError::io_at(e, &output))?;
        let ledger = mission.ledger_path();
        remove_if_exists(&ledger)
            .await
            .map_err(|e| EngineError::io_at(e, &ledger))?;

        if let Some(record) = mission.finished_record().await {
            self.catalog.delete_mission(&record).await?;
        }

        info!("Mission {} deleted", id);
        let _ = self.event_tx.send(MissionEvent::MissionRemoved { id });
        Ok(())
    }

    /// Pause every active mission and wait for all worker pools to stop
    pub async fn shutdown(&self) {
        let missions = self.missions.read().await.clone();
        for mission in &missions {
            mission.pause().await;
        }
        for mission in &missions {
            mission.wait_stopped().await;
        }
        info!("All missions stopped");
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub async fn mission(&self, id: MissionId) -> Option<Arc<Mission>> {
        self.missions
            .read()
            .await
            .iter()
            .find(|m| m.id() == id)
            .cloned()
    }

    async fn get(&self, id: MissionId) -> Result<Arc<Mission>, EngineError> {
        self.mission(id).await.ok_or(EngineError::NotFound(id))
    }

    pub async fn mission_by_location(&self, location: &Path, name: &str) -> Option<Arc<Mission>> {
        self.missions
            .read()
            .await
            .iter()
            .find(|m| m.location() == location && m.name() == name)
            .cloned()
    }

    pub async fn info(&self, id: MissionId) -> Result<MissionInfo, EngineError> {
        Ok(self.get(id).await?.info().await)
    }

    pub async fn id_at(&self, index: usize) -> Option<MissionId> {
        self.missions.read().await.get(index).map(|m| m.id())
    }

    pub async fn index_of(&self, id: MissionId) -> Option<usize> {
        self.missions.read().await.iter().position(|m| m.id() == id)
    }

    pub async fn count(&self) -> usize {
        self.missions.read().await.len()
    }

    /// Snapshots of all missions, newest first
    pub async fn list(&self) -> Vec<MissionInfo> {
        let missions = self.missions.read().await.clone();
        let mut infos = Vec::with_capacity(missions.len());
        for mission in missions {
            infos.push(mission.info().await);
        }
        infos
    }
}
