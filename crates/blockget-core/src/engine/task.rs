//! Mission task - one run of a mission's worker pool
//!
//! Waits for the previous pool of the same mission, probes the resource when
//! the length is still unknown, then spawns the workers and collects their
//! results. The first real failure cancels the remaining workers and moves
//! the mission to `Error`, unless the last block already finished it.

use crate::engine::catalog::FinishedCatalog;
use crate::engine::initializer;
use crate::engine::mission::{Mission, RunControl};
use crate::engine::worker::{BlockWorker, FallbackWorker};
use crate::error::EngineError;
use reqwest::Client;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// Shared resources a run needs
#[derive(Clone)]
pub(crate) struct RunContext {
    pub client: Client,
    pub catalog: Arc<dyn FinishedCatalog>,
}

pub(crate) struct MissionTask {
    mission: Arc<Mission>,
    ctx: RunContext,
    control: RunControl,
    previous: Option<JoinHandle<()>>,
}

impl MissionTask {
    pub fn new(
        mission: Arc<Mission>,
        ctx: RunContext,
        control: RunControl,
        previous: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            mission,
            ctx,
            control,
            previous,
        }
    }

    pub async fn run(mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = previous.await;
        }

        match self.execute().await {
            Ok(()) => {}
            Err(e) if e.is_interruption() => {
                info!("Mission {} stopped: {}", self.mission.id(), e);
                self.mission.save_ledger().await;
            }
            Err(e) => {
                error!("Mission {} failed: {}", self.mission.id(), e);
                self.mission.fail(&e).await;
            }
        }
    }

    async fn execute(&self) -> Result<(), EngineError> {
        if self.mission.is_finished().await {
            return Ok(());
        }
        if let Some(interruption) = self.control.interruption() {
            return Err(interruption);
        }

        if self.mission.needs_probe().await {
            initializer::initialize(&self.ctx.client, &self.mission).await?;
        } else {
            let plan = self.mission.work_plan().await?;
            initializer::ensure_output(&self.mission, &plan.geometry).await?;
        }

        if let Some(interruption) = self.control.interruption() {
            return Err(interruption);
        }

        self.run_pool().await
    }

    async fn run_pool(&self) -> Result<(), EngineError> {
        let plan = self.mission.work_plan().await?;
        let mut join_set = JoinSet::new();

        if plan.fallback {
            let worker = FallbackWorker::new(
                Arc::clone(&self.mission),
                self.ctx.clone(),
                plan.geometry,
                plan.completed,
                self.control.clone(),
            );
            join_set.spawn(async move { (0, worker.run().await) });
        } else {
            for (worker_id, blocks) in plan.runs.into_iter().enumerate() {
                let worker = BlockWorker::new(
                    worker_id,
                    Arc::clone(&self.mission),
                    self.ctx.clone(),
                    plan.geometry,
                    blocks,
                    plan.completed.clone(),
                    self.control.clone(),
                );
                join_set.spawn(async move { (worker_id, worker.run().await) });
            }
        }

        let mut failure: Option<EngineError> = None;
        let mut interruption: Option<EngineError> = None;

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((_, Ok(()))) => {}
                Ok((worker_id, Err(e))) if e.is_interruption() => {
                    info!("Worker {} of mission {} stopped", worker_id, self.mission.id());
                    interruption.get_or_insert(e);
                }
                Ok((worker_id, Err(e))) => {
                    warn!("Worker {} of mission {} failed: {}", worker_id, self.mission.id(), e);
                    if failure.is_none() {
                        self.control.cancel.cancel();
                        failure = Some(e);
                    }
                }
                Err(e) => {
                    error!("Worker task of mission {} panicked: {}", self.mission.id(), e);
                    if failure.is_none() {
                        self.control.cancel.cancel();
                        failure = Some(EngineError::InvalidOperation(format!(
                            "worker task failed: {}",
                            e
                        )));
                    }
                }
            }
        }

        if self.mission.is_finished().await {
            if let Some(e) = failure {
                warn!("Mission {} finished despite worker error: {}", self.mission.id(), e);
            }
            return Ok(());
        }
        match failure.or(interruption) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
