//! Mission ledger - the on-disk record that lets a mission resume
//!
//! The ledger lives next to the output file as `{name}.blockget`. It is
//! rewritten through a temporary file and a rename, so a crash leaves either
//! the previous ledger or the new one, never a torn write.

use crate::engine::blocks::BlockSet;
use crate::error::EngineError;
use blockget_types::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// File extension of ledger files
pub const LEDGER_EXTENSION: &str = "blockget";

/// Current ledger format version
pub const LEDGER_VERSION: u32 = 1;

/// Serialized snapshot of a mission's resumable state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionLedger {
    pub version: u32,
    pub id: Uuid,
    pub url: String,
    pub location: PathBuf,
    pub name: String,
    #[serde(default)]
    pub is_audio: bool,
    pub length: Option<u64>,
    pub block_size: u64,
    pub completed: BlockSet,
    pub thread_count: u32,
    pub fallback: bool,
    pub finished: bool,
    pub error: Option<ErrorCode>,
    pub created_at: DateTime<Utc>,
}

/// Path of the ledger for an output file
pub fn ledger_path(location: &Path, name: &str) -> PathBuf {
    location.join(format!("{}.{}", name, LEDGER_EXTENSION))
}

/// Whether a directory entry looks like a ledger
pub fn is_ledger_file(path: &Path) -> bool {
    path.extension().map(|e| e == LEDGER_EXTENSION).unwrap_or(false)
}

impl MissionLedger {
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        let ledger: MissionLedger = serde_json::from_slice(bytes)?;
        if ledger.version != LEDGER_VERSION {
            return Err(EngineError::LedgerVersion(ledger.version));
        }
        Ok(ledger)
    }

    /// Load a ledger from disk
    pub async fn load(path: &Path) -> Result<Self, EngineError> {
        let bytes = fs::read(path)
            .await
            .map_err(|e| EngineError::io_at(e, path))?;
        Self::decode(&bytes)
    }

    /// Durably replace the ledger at `path`
    pub async fn store(&self, path: &Path) -> Result<(), EngineError> {
        let bytes = self.encode()?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| EngineError::io_at(e, &tmp))?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, path)
            .await
            .map_err(|e| EngineError::io_at(e, path))?;
        Ok(())
    }
}

/// Remove a file, treating an already missing file as success
pub async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
