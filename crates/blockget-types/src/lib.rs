//! Shared types for blockget
//!
//! This crate contains the data structures shared by the download
//! engine and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Size of one block of a mission, in bytes
pub const DEFAULT_BLOCK_SIZE: u64 = 512 * 1024;

/// Stable handle of a mission
pub type MissionId = Uuid;

// ============================================================================
// Mission Types
// ============================================================================

/// Lifecycle state of a mission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissionStatus {
    /// Waiting for the probe to resolve length and range support
    Initializing,
    Running,
    Paused,
    Finished,
    Error,
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissionStatus::Initializing => "initializing",
            MissionStatus::Running => "running",
            MissionStatus::Paused => "paused",
            MissionStatus::Finished => "finished",
            MissionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Error code stored on a failed mission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The server did not report a length or refused a range request
    ServerUnsupported,
    /// Transport failure or truncated body
    Network,
    /// Local file I/O failure
    Storage,
    /// Storage access was denied
    PermissionDenied,
    Unknown,
}

impl ErrorCode {
    /// Numeric form reported to listeners
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::ServerUnsupported => 206,
            ErrorCode::Unknown => 233,
            ErrorCode::Network => 300,
            ErrorCode::Storage => 301,
            ErrorCode::PermissionDenied => 302,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            206 => Some(ErrorCode::ServerUnsupported),
            233 => Some(ErrorCode::Unknown),
            300 => Some(ErrorCode::Network),
            301 => Some(ErrorCode::Storage),
            302 => Some(ErrorCode::PermissionDenied),
            _ => None,
        }
    }
}

/// Read-only snapshot of a mission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionInfo {
    pub id: MissionId,
    pub url: String,
    pub location: PathBuf,
    pub name: String,
    pub is_audio: bool,
    /// Total length in bytes, `None` until the probe reports it
    pub length: Option<u64>,
    /// Bytes of completed blocks
    pub done: u64,
    pub block_size: u64,
    pub blocks: u64,
    pub completed_blocks: u64,
    pub thread_count: u32,
    pub fallback: bool,
    pub status: MissionStatus,
    pub error: Option<ErrorCode>,
    pub recovered: bool,
    pub created_at: DateTime<Utc>,
}

impl MissionInfo {
    pub fn progress(&self) -> f64 {
        match self.length {
            Some(length) if length > 0 => (self.done as f64 / length as f64) * 100.0,
            _ => 0.0,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.location.join(&self.name)
    }
}

/// A row of the finished-download catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedRecord {
    pub url: String,
    pub location: PathBuf,
    pub name: String,
    pub length: u64,
    pub created_at: DateTime<Utc>,
}

impl FinishedRecord {
    pub fn path(&self) -> PathBuf {
        self.location.join(&self.name)
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine and application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub download_dir: PathBuf,
    /// Extra directories scanned for unfinished missions on startup
    #[serde(default)]
    pub search_locations: Vec<PathBuf>,
    pub default_threads: u32,
    pub block_size: u64,
    /// Upper bound of candidate names tried when a name is taken
    pub max_name_attempts: u32,
    pub connect_timeout_secs: u64,
    /// `None` keeps the transport default (no overall timeout)
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    pub user_agent: String,
}

impl Settings {
    /// Directories scanned for ledgers, download directory first
    pub fn scan_locations(&self) -> Vec<PathBuf> {
        let mut locations = vec![self.download_dir.clone()];
        for location in &self.search_locations {
            if !locations.contains(location) {
                locations.push(location.clone());
            }
        }
        locations
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir()
                .map(|p| p.join("blockget"))
                .unwrap_or_else(|| PathBuf::from(".")),
            search_locations: Vec::new(),
            default_threads: 3,
            block_size: DEFAULT_BLOCK_SIZE,
            max_name_attempts: 1000,
            connect_timeout_secs: 30,
            request_timeout_secs: None,
            user_agent: format!("blockget/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine to listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MissionEvent {
    MissionAdded {
        mission: MissionInfo,
    },
    StatusChanged {
        id: MissionId,
        status: MissionStatus,
    },
    /// Emitted on every block completion
    Progress {
        id: MissionId,
        done: u64,
        total: u64,
    },
    Finished {
        id: MissionId,
    },
    Failed {
        id: MissionId,
        code: i32,
        message: String,
    },
    /// Storage access was denied; distinct from generic I/O failure
    PermissionDenied {
        id: MissionId,
        location: PathBuf,
    },
    MissionRemoved {
        id: MissionId,
    },
}

impl MissionEvent {
    pub fn mission_id(&self) -> MissionId {
        match self {
            MissionEvent::MissionAdded { mission } => mission.id,
            MissionEvent::StatusChanged { id, .. }
            | MissionEvent::Progress { id, .. }
            | MissionEvent::Finished { id }
            | MissionEvent::Failed { id, .. }
            | MissionEvent::PermissionDenied { id, .. }
            | MissionEvent::MissionRemoved { id } => *id,
        }
    }
}
