//! Mission - one download's shared state and lifecycle
//!
//! State machine: `Initializing -> Running <-> Paused -> {Finished | Error}`.
//! All ledger mutations happen under the mission's state lock, so block
//! completions from concurrent workers are applied and persisted one at a
//! time and the finish transition fires exactly once. A finished mission is
//! in the catalog before its ledger is removed and before `Finished` is sent.

use crate::engine::blocks::{BlockGeometry, BlockSet};
use crate::engine::catalog::FinishedCatalog;
use crate::engine::ledger::{ledger_path, remove_if_exists, MissionLedger, LEDGER_VERSION};
use crate::engine::task::{MissionTask, RunContext};
use crate::error::EngineError;
use blockget_types::{
    ErrorCode, FinishedRecord, MissionEvent, MissionId, MissionInfo, MissionStatus,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Control flags shared by one run's task and its workers
#[derive(Clone, Default)]
pub(crate) struct RunControl {
    pub paused: Arc<AtomicBool>,
    pub cancel: CancellationToken,
}

impl RunControl {
    /// The error a worker should return if the run was interrupted
    pub fn interruption(&self) -> Option<EngineError> {
        if self.cancel.is_cancelled() {
            Some(EngineError::Cancelled)
        } else if self.paused.load(Ordering::Acquire) {
            Some(EngineError::Paused)
        } else {
            None
        }
    }
}

struct RunHandle {
    control: RunControl,
    task: JoinHandle<()>,
}

/// What a run needs to spawn its workers
pub(crate) struct WorkPlan {
    pub geometry: BlockGeometry,
    pub runs: Vec<Range<u64>>,
    pub completed: BlockSet,
    pub fallback: bool,
}

struct MissionState {
    length: Option<u64>,
    block_size: u64,
    thread_count: u32,
    completed: BlockSet,
    fallback: bool,
    status: MissionStatus,
    error: Option<ErrorCode>,
    recovered: bool,
}

impl MissionState {
    fn geometry(&self) -> Option<BlockGeometry> {
        self.length
            .map(|length| BlockGeometry::new(length, self.block_size))
    }
}

/// A single download mission
pub struct Mission {
    id: MissionId,
    url: String,
    location: PathBuf,
    name: String,
    is_audio: bool,
    created_at: DateTime<Utc>,
    state: Mutex<MissionState>,
    done_bytes: AtomicU64,
    run: SyncMutex<Option<RunHandle>>,
    event_tx: broadcast::Sender<MissionEvent>,
}

impl Mission {
    /// Create a mission that still has to be probed
    pub fn new(
        url: String,
        location: PathBuf,
        name: String,
        is_audio: bool,
        threads: u32,
        block_size: u64,
        event_tx: broadcast::Sender<MissionEvent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            location,
            name,
            is_audio,
            created_at: Utc::now(),
            state: Mutex::new(MissionState {
                length: None,
                block_size: block_size.max(1),
                thread_count: threads.max(1),
                completed: BlockSet::new(),
                fallback: false,
                status: MissionStatus::Initializing,
                error: None,
                recovered: false,
            }),
            done_bytes: AtomicU64::new(0),
            run: SyncMutex::new(None),
            event_tx,
        }
    }

    /// Rebuild an unfinished mission from its ledger
    pub fn from_ledger(ledger: MissionLedger, event_tx: broadcast::Sender<MissionEvent>) -> Self {
        let state = MissionState {
            length: ledger.length,
            block_size: ledger.block_size.max(1),
            thread_count: ledger.thread_count.max(1),
            completed: ledger.completed,
            fallback: ledger.fallback,
            status: if ledger.error.is_some() {
                MissionStatus::Error
            } else {
                MissionStatus::Paused
            },
            error: ledger.error,
            recovered: true,
        };
        let done = state
            .geometry()
            .map(|geometry| state.completed.completed_bytes(&geometry))
            .unwrap_or(0);

        Self {
            id: ledger.id,
            url: ledger.url,
            location: ledger.location,
            name: ledger.name,
            is_audio: ledger.is_audio,
            created_at: ledger.created_at,
            state: Mutex::new(state),
            done_bytes: AtomicU64::new(done),
            run: SyncMutex::new(None),
            event_tx,
        }
    }

    /// Rebuild a finished mission from its catalog record
    pub fn from_finished(
        record: FinishedRecord,
        block_size: u64,
        event_tx: broadcast::Sender<MissionEvent>,
    ) -> Self {
        let geometry = BlockGeometry::new(record.length, block_size);
        Self {
            id: Uuid::new_v4(),
            url: record.url,
            location: record.location,
            name: record.name,
            is_audio: false,
            created_at: record.created_at,
            state: Mutex::new(MissionState {
                length: Some(record.length),
                block_size: geometry.block_size,
                thread_count: 1,
                completed: (0..geometry.blocks).collect(),
                fallback: false,
                status: MissionStatus::Finished,
                error: None,
                recovered: false,
            }),
            done_bytes: AtomicU64::new(record.length),
            run: SyncMutex::new(None),
            event_tx,
        }
    }

    pub fn id(&self) -> MissionId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Bytes of completed blocks
    pub fn done_bytes(&self) -> u64 {
        self.done_bytes.load(Ordering::Acquire)
    }

    pub fn output_path(&self) -> PathBuf {
        self.location.join(&self.name)
    }

    pub fn ledger_path(&self) -> PathBuf {
        ledger_path(&self.location, &self.name)
    }

    pub async fn status(&self) -> MissionStatus {
        self.state.lock().await.status
    }

    pub async fn is_finished(&self) -> bool {
        self.status().await == MissionStatus::Finished
    }

    /// Snapshot for display
    pub async fn info(&self) -> MissionInfo {
        let state = self.state.lock().await;
        let geometry = state.geometry();
        MissionInfo {
            id: self.id,
            url: self.url.clone(),
            location: self.location.clone(),
            name: self.name.clone(),
            is_audio: self.is_audio,
            length: state.length,
            done: self.done_bytes(),
            block_size: state.block_size,
            blocks: geometry.map(|g| g.blocks).unwrap_or(0),
            completed_blocks: state.completed.len(),
            thread_count: state.thread_count,
            fallback: state.fallback,
            status: state.status,
            error: state.error,
            recovered: state.recovered,
            created_at: self.created_at,
        }
    }

    /// Serializable snapshot of the resumable state
    pub async fn ledger(&self) -> MissionLedger {
        let state = self.state.lock().await;
        self.ledger_of(&state)
    }

    fn ledger_of(&self, state: &MissionState) -> MissionLedger {
        MissionLedger {
            version: LEDGER_VERSION,
            id: self.id,
            url: self.url.clone(),
            location: self.location.clone(),
            name: self.name.clone(),
            is_audio: self.is_audio,
            length: state.length,
            block_size: state.block_size,
            completed: state.completed.clone(),
            thread_count: state.thread_count,
            fallback: state.fallback,
            finished: state.status == MissionStatus::Finished,
            error: state.error,
            created_at: self.created_at,
        }
    }

    async fn persist(&self, state: &MissionState) -> Result<(), EngineError> {
        self.ledger_of(state).store(&self.ledger_path()).await
    }

    /// Catalog record, once the mission has finished
    pub async fn finished_record(&self) -> Option<FinishedRecord> {
        let state = self.state.lock().await;
        (state.status == MissionStatus::Finished).then(|| self.record_of(&state))
    }

    fn record_of(&self, state: &MissionState) -> FinishedRecord {
        FinishedRecord {
            url: self.url.clone(),
            location: self.location.clone(),
            name: self.name.clone(),
            length: state.length.unwrap_or(0),
            created_at: self.created_at,
        }
    }

    /// Write the ledger of a stopped run; finished missions have none
    pub(crate) async fn save_ledger(&self) {
        let state = self.state.lock().await;
        if state.status == MissionStatus::Finished {
            return;
        }
        if let Err(e) = self.persist(&state).await {
            warn!("Failed to write ledger for mission {}: {}", self.id, e);
        }
    }

    fn emit(&self, event: MissionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_status(&self, state: &mut MissionState, status: MissionStatus) {
        if state.status != status {
            state.status = status;
            self.emit(MissionEvent::StatusChanged {
                id: self.id,
                status,
            });
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a worker pool for this mission.
    ///
    /// Allowed for a fresh mission that has never run and for a paused
    /// mission without a stored error; a no-op otherwise. Returns whether a
    /// run was started. Never blocks on network or disk.
    pub(crate) async fn launch(self: &Arc<Self>, ctx: RunContext) -> bool {
        let mut state = self.state.lock().await;
        let mut slot = self.run.lock();

        let launchable = match state.status {
            MissionStatus::Paused => state.error.is_none(),
            MissionStatus::Initializing => slot.is_none(),
            _ => false,
        };
        if !launchable {
            return false;
        }

        let status = if state.length.is_some() {
            MissionStatus::Running
        } else {
            MissionStatus::Initializing
        };
        self.set_status(&mut state, status);

        let control = RunControl::default();
        let previous = slot.take().map(|handle| handle.task);
        let task = MissionTask::new(Arc::clone(self), ctx, control.clone(), previous);
        let task = tokio::spawn(task.run());
        *slot = Some(RunHandle { control, task });

        info!("Mission {} launched ({})", self.id, self.name);
        true
    }

    /// Pause a running or initializing mission; a no-op otherwise.
    ///
    /// Only signals the pool. The ledger is written by the run as it stops.
    pub async fn pause(&self) -> bool {
        let mut state = self.state.lock().await;
        if !matches!(
            state.status,
            MissionStatus::Running | MissionStatus::Initializing
        ) {
            return false;
        }

        if let Some(handle) = self.run.lock().as_ref() {
            handle.control.paused.store(true, Ordering::Release);
        }
        self.set_status(&mut state, MissionStatus::Paused);
        info!("Mission {} paused", self.id);
        true
    }

    /// Clear a stored error so the mission can be resumed
    pub async fn clear_error(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status != MissionStatus::Error {
            return false;
        }
        state.error = None;
        self.set_status(&mut state, MissionStatus::Paused);
        if let Err(e) = self.persist(&state).await {
            warn!("Failed to write ledger for mission {}: {}", self.id, e);
        }
        true
    }

    /// Wait for the current worker pool, if any, to stop
    pub(crate) async fn wait_stopped(&self) {
        let handle = self.run.lock().take();
        if let Some(handle) = handle {
            let _ = handle.task.await;
        }
    }

    /// Cancel in-flight workers mid-block and wait for the pool to stop
    pub(crate) async fn cancel_and_wait(&self) {
        let handle = self.run.lock().take();
        if let Some(handle) = handle {
            handle.control.cancel.cancel();
            let _ = handle.task.await;
        }
    }

    /// Move to `Error`, store the code and notify listeners
    pub(crate) async fn fail(&self, error: &EngineError) {
        let mut state = self.state.lock().await;
        if state.status == MissionStatus::Finished {
            return;
        }
        let code = error.error_code();
        state.error = Some(code);
        self.set_status(&mut state, MissionStatus::Error);

        if let Err(e) = self.persist(&state).await {
            warn!("Failed to write ledger for failed mission {}: {}", self.id, e);
        }

        if let EngineError::PermissionDenied(path) = error {
            self.emit(MissionEvent::PermissionDenied {
                id: self.id,
                location: path.clone(),
            });
        }
        self.emit(MissionEvent::Failed {
            id: self.id,
            code: code.code(),
            message: error.to_string(),
        });
    }

    // ========================================================================
    // Progress
    // ========================================================================

    pub(crate) async fn needs_probe(&self) -> bool {
        self.state.lock().await.length.is_none()
    }

    /// Record the probe result, clamp the thread count and persist
    pub(crate) async fn apply_probe(
        &self,
        length: u64,
        fallback: bool,
    ) -> Result<BlockGeometry, EngineError> {
        let mut state = self.state.lock().await;
        let geometry = BlockGeometry::new(length, state.block_size);
        state.length = Some(length);
        state.fallback = fallback;
        state.thread_count = if fallback {
            1
        } else {
            geometry.clamp_threads(state.thread_count)
        };
        state.completed.clear();
        self.done_bytes.store(0, Ordering::Release);

        if state.status == MissionStatus::Initializing {
            self.set_status(&mut state, MissionStatus::Running);
        }
        self.persist(&state).await?;

        info!(
            "Mission {}: {} bytes in {} blocks, {} thread(s){}",
            self.id,
            length,
            geometry.blocks,
            state.thread_count,
            if fallback { ", single-stream fallback" } else { "" }
        );
        Ok(geometry)
    }

    /// Forget completed blocks, used when the output file went missing
    pub(crate) async fn reset_progress(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        state.completed.clear();
        self.done_bytes.store(0, Ordering::Release);
        self.persist(&state).await
    }

    /// Geometry, worker assignment and completed set for a new pool
    pub(crate) async fn work_plan(&self) -> Result<WorkPlan, EngineError> {
        let state = self.state.lock().await;
        let geometry = state.geometry().ok_or_else(|| {
            EngineError::InvalidOperation(format!("mission {} has not been probed", self.id))
        })?;
        let threads = if state.fallback { 1 } else { state.thread_count };
        Ok(WorkPlan {
            geometry,
            runs: geometry.assign(threads),
            completed: state.completed.clone(),
            fallback: state.fallback,
        })
    }

    /// Mark a block whose bytes are already on stable storage.
    ///
    /// Returns `true` if this completion finished the mission. The last block
    /// records the mission in `catalog`; if that write fails the ledger is
    /// kept with its finished flag so recovery can record it later.
    pub(crate) async fn mark_block_done(
        &self,
        index: u64,
        catalog: &dyn FinishedCatalog,
    ) -> Result<bool, EngineError> {
        let mut state = self.state.lock().await;
        let geometry = state.geometry().ok_or_else(|| {
            EngineError::InvalidOperation(format!("mission {} has not been probed", self.id))
        })?;
        if index >= geometry.blocks {
            return Err(EngineError::InvalidOperation(format!(
                "block {} out of range for mission {}",
                index, self.id
            )));
        }
        if !state.completed.mark(index) || state.status == MissionStatus::Finished {
            return Ok(false);
        }

        state.recovered = false;
        let done = state.completed.completed_bytes(&geometry);
        self.done_bytes.store(done, Ordering::Release);
        debug!("Mission {}: block {} done ({}/{})", self.id, index, done, geometry.length);

        if state.completed.is_complete(geometry.blocks) {
            let recorded = match catalog.add_mission(&self.record_of(&state)).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to record finished mission {} in catalog: {}", self.id, e);
                    false
                }
            };
            state.status = MissionStatus::Finished;
            let cleanup = if recorded {
                remove_if_exists(&self.ledger_path())
                    .await
                    .map_err(EngineError::from)
            } else {
                self.persist(&state).await
            };
            if let Err(e) = cleanup {
                warn!("Failed to settle ledger of finished mission {}: {}", self.id, e);
            }
            self.emit(MissionEvent::StatusChanged {
                id: self.id,
                status: MissionStatus::Finished,
            });
            self.emit(MissionEvent::Progress {
                id: self.id,
                done,
                total: geometry.length,
            });
            self.emit(MissionEvent::Finished { id: self.id });
            info!("Mission {} finished: {}", self.id, self.output_path().display());
            return Ok(true);
        }

        self.persist(&state).await?;
        self.emit(MissionEvent::Progress {
            id: self.id,
            done,
            total: geometry.length,
        });
        Ok(false)
    }
}

impl std::fmt::Debug for Mission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mission")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("location", &self.location)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
