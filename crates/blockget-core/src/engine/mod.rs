//! Download Engine - resumable segmented downloads
//!
//! This module implements the block-based mission engine:
//! - Fixed-size blocks written in place into a preallocated file
//! - Contiguous block runs per worker, one range request per block
//! - Single-stream fallback for servers without range support
//! - A crash-consistent ledger next to every unfinished download
//! - Recovery of finished and unfinished missions on startup

mod blocks;
mod catalog;
mod initializer;
mod ledger;
mod mission;
mod store;
mod task;
mod worker;

pub use blocks::{preallocate, BlockGeometry, BlockSet, BlockWriter};
pub use catalog::{FinishedCatalog, MemoryCatalog, SqliteCatalog};
pub use ledger::{
    is_ledger_file, ledger_path, remove_if_exists as remove_file_if_exists, MissionLedger,
    LEDGER_EXTENSION, LEDGER_VERSION,
};
pub use mission::Mission;
pub use store::{MissionRequest, MissionStore, StartedMission};
