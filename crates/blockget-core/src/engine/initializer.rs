//! Initializer - probes the resource and prepares the output file
//!
//! Two requests: a plain GET for the total length, then a small range
//! request near the end of the resource. A `206` answer to the range probe
//! means blocks can be fetched independently; anything else puts the mission
//! in single-stream fallback.

use crate::engine::blocks::{self, BlockGeometry};
use crate::engine::mission::Mission;
use crate::error::EngineError;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

/// Bytes requested by the range probe
const RANGE_PROBE_BYTES: u64 = 10;

/// What the server told us about the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProbeResult {
    pub length: u64,
    pub ranges_supported: bool,
}

/// Probe `url` for its length and range support
pub(crate) async fn probe(client: &Client, url: &str) -> Result<ProbeResult, EngineError> {
    info!("Probing URL: {}", url);

    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::ServerError {
            status: status.as_u16(),
            message: "probe request failed".to_string(),
        });
    }

    let length = response
        .content_length()
        .filter(|length| *length > 0)
        .ok_or(EngineError::UnsupportedServer)?;
    drop(response);

    let start = length.saturating_sub(RANGE_PROBE_BYTES);
    let range_header = format!("bytes={}-{}", start, length - 1);
    debug!("Range probe: {}", range_header);

    let response = client.get(url).header(RANGE, range_header).send().await?;
    let ranges_supported = response.status() == StatusCode::PARTIAL_CONTENT;

    info!(
        "Probed {}: {} bytes, ranges {}",
        url,
        length,
        if ranges_supported { "supported" } else { "unsupported" }
    );

    Ok(ProbeResult {
        length,
        ranges_supported,
    })
}

/// Probe the mission's URL, preallocate its output file and persist the
/// resulting geometry in the mission's ledger.
pub(crate) async fn initialize(
    client: &Client,
    mission: &Mission,
) -> Result<BlockGeometry, EngineError> {
    let probe = probe(client, mission.url()).await?;

    let location = mission.location();
    tokio::fs::create_dir_all(location)
        .await
        .map_err(|e| EngineError::io_at(e, location))?;

    let path = mission.output_path();
    blocks::preallocate(&path, probe.length)
        .await
        .map_err(|e| EngineError::io_at(e, &path))?;

    mission
        .apply_probe(probe.length, !probe.ranges_supported)
        .await
}

/// Recreate a missing output file for a mission whose geometry is known.
///
/// Completed blocks lived in the old file, so they are forgotten.
pub(crate) async fn ensure_output(
    mission: &Mission,
    geometry: &BlockGeometry,
) -> Result<bool, EngineError> {
    let path = mission.output_path();
    if tokio::fs::try_exists(&path)
        .await
        .map_err(|e| EngineError::io_at(e, &path))?
    {
        return Ok(false);
    }

    info!(
        "Output file {} is missing, restarting mission {}",
        path.display(),
        mission.id()
    );
    tokio::fs::create_dir_all(mission.location())
        .await
        .map_err(|e| EngineError::io_at(e, mission.location()))?;
    blocks::preallocate(&path, geometry.length)
        .await
        .map_err(|e| EngineError::io_at(e, &path))?;
    mission.reset_progress().await?;
    Ok(true)
}
