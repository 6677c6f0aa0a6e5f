//! Block workers - fetch blocks straight into the shared output file
//!
//! A ranged worker owns a contiguous run of block indices and issues one
//! range request per block. The fallback worker streams the whole body once
//! and marks each block as the stream crosses its end.
//!
//! Pause is checked between blocks; cancellation also aborts a block in
//! flight. A block is only marked done after its bytes were synced.

use crate::engine::blocks::{BlockGeometry, BlockSet, BlockWriter};
use crate::engine::mission::{Mission, RunControl};
use crate::engine::task::RunContext;
use crate::error::EngineError;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Response, StatusCode};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Wait for the next body chunk unless the run is cancelled first
async fn next_chunk<S, B>(stream: &mut S, control: &RunControl) -> Result<Option<B>, EngineError>
where
    S: futures::Stream<Item = reqwest::Result<B>> + Unpin,
{
    tokio::select! {
        biased;
        _ = control.cancel.cancelled() => Err(EngineError::Cancelled),
        chunk = stream.next() => Ok(chunk.transpose()?),
    }
}

async fn send(
    request: reqwest::RequestBuilder,
    control: &RunControl,
) -> Result<Response, EngineError> {
    tokio::select! {
        biased;
        _ = control.cancel.cancelled() => Err(EngineError::Cancelled),
        response = request.send() => Ok(response?),
    }
}

/// Worker that downloads a run of blocks with range requests
pub(crate) struct BlockWorker {
    worker_id: usize,
    mission: Arc<Mission>,
    ctx: RunContext,
    path: PathBuf,
    geometry: BlockGeometry,
    blocks: Range<u64>,
    completed: BlockSet,
    control: RunControl,
}

impl BlockWorker {
    pub fn new(
        worker_id: usize,
        mission: Arc<Mission>,
        ctx: RunContext,
        geometry: BlockGeometry,
        blocks: Range<u64>,
        completed: BlockSet,
        control: RunControl,
    ) -> Self {
        let path = mission.output_path();
        Self {
            worker_id,
            mission,
            ctx,
            path,
            geometry,
            blocks,
            completed,
            control,
        }
    }

    pub async fn run(self) -> Result<(), EngineError> {
        debug!(
            "Worker {} of mission {} owns blocks {:?}",
            self.worker_id,
            self.mission.id(),
            self.blocks
        );

        let pending: Vec<u64> = self
            .blocks
            .clone()
            .filter(|index| !self.completed.contains(*index))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut writer = BlockWriter::open(&self.path)
            .await
            .map_err(|e| EngineError::io_at(e, &self.path))?;
        for index in pending {
            if let Some(interruption) = self.control.interruption() {
                return Err(interruption);
            }
            self.fetch_block(&mut writer, index).await?;
            self.mission
                .mark_block_done(index, self.ctx.catalog.as_ref())
                .await?;
        }

        debug!("Worker {} of mission {} done", self.worker_id, self.mission.id());
        Ok(())
    }

    async fn fetch_block(&self, writer: &mut BlockWriter, index: u64) -> Result<(), EngineError> {
        let range = self.geometry.block_range(index);
        let expected = range.end - range.start;
        let range_header = format!("bytes={}-{}", range.start, range.end - 1);

        let request = self
            .ctx
            .client
            .get(self.mission.url())
            .header(RANGE, range_header);
        let response = send(request, &self.control).await?;

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(EngineError::ServerError {
                status: status.as_u16(),
                message: format!("block {} was not served as a range", index),
            });
        }

        writer
            .seek(range.start)
            .await
            .map_err(|e| EngineError::io_at(e, &self.path))?;

        let mut stream = response.bytes_stream();
        let mut received = 0u64;
        while received < expected {
            let Some(chunk) = next_chunk(&mut stream, &self.control).await? else {
                break;
            };
            let chunk: &[u8] = &chunk;
            let take = chunk.len().min((expected - received) as usize);
            writer
                .write(&chunk[..take])
                .await
                .map_err(|e| EngineError::io_at(e, &self.path))?;
            received += take as u64;
        }

        if received < expected {
            return Err(EngineError::Truncated { expected, received });
        }

        writer
            .sync()
            .await
            .map_err(|e| EngineError::io_at(e, &self.path))?;
        Ok(())
    }
}

/// Worker that streams the whole resource when ranges are not supported
pub(crate) struct FallbackWorker {
    mission: Arc<Mission>,
    ctx: RunContext,
    path: PathBuf,
    geometry: BlockGeometry,
    completed: BlockSet,
    control: RunControl,
}

impl FallbackWorker {
    pub fn new(
        mission: Arc<Mission>,
        ctx: RunContext,
        geometry: BlockGeometry,
        completed: BlockSet,
        control: RunControl,
    ) -> Self {
        let path = mission.output_path();
        Self {
            mission,
            ctx,
            path,
            geometry,
            completed,
            control,
        }
    }

    pub async fn run(self) -> Result<(), EngineError> {
        if let Some(interruption) = self.control.interruption() {
            return Err(interruption);
        }
        info!(
            "Mission {} streaming without ranges, {} of {} blocks already done",
            self.mission.id(),
            self.completed.len(),
            self.geometry.blocks
        );

        let request = self.ctx.client.get(self.mission.url());
        let response = send(request, &self.control).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::ServerError {
                status: status.as_u16(),
                message: "stream request failed".to_string(),
            });
        }

        let mut writer = BlockWriter::open(&self.path)
            .await
            .map_err(|e| EngineError::io_at(e, &self.path))?;
        // Position of the file handle, `None` when it must be re-seeked
        let mut position: Option<u64> = None;
        let mut offset = 0u64;
        let length = self.geometry.length;

        let mut stream = response.bytes_stream();
        while offset < length {
            let Some(chunk) = next_chunk(&mut stream, &self.control).await? else {
                break;
            };

            let mut data = &chunk[..];
            while !data.is_empty() && offset < length {
                let index = self.geometry.block_of(offset);
                let block = self.geometry.block_range(index);
                let take = data.len().min((block.end - offset) as usize);
                let skip = self.completed.contains(index);

                if skip {
                    position = None;
                } else {
                    if position != Some(offset) {
                        writer
                            .seek(offset)
                            .await
                            .map_err(|e| EngineError::io_at(e, &self.path))?;
                    }
                    writer
                        .write(&data[..take])
                        .await
                        .map_err(|e| EngineError::io_at(e, &self.path))?;
                    position = Some(offset + take as u64);
                }

                offset += take as u64;
                data = &data[take..];

                if offset == block.end {
                    if !skip {
                        writer
                            .sync()
                            .await
                            .map_err(|e| EngineError::io_at(e, &self.path))?;
                        self.mission
                            .mark_block_done(index, self.ctx.catalog.as_ref())
                            .await?;
                    }
                    if offset < length {
                        if let Some(interruption) = self.control.interruption() {
                            return Err(interruption);
                        }
                    }
                }
            }
        }

        if offset < length {
            return Err(EngineError::Truncated {
                expected: length,
                received: offset,
            });
        }
        Ok(())
    }
}
