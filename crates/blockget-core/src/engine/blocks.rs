//! Block store - fixed-size block geometry, completion set and output file
//!
//! A mission's output file is split into blocks of `block_size` bytes. Workers
//! own disjoint, contiguous runs of blocks and write straight into the
//! preallocated output file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Block layout of a resource of known length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    pub length: u64,
    pub block_size: u64,
    pub blocks: u64,
}

impl BlockGeometry {
    pub fn new(length: u64, block_size: u64) -> Self {
        let block_size = block_size.max(1);
        Self {
            length,
            block_size,
            blocks: length.div_ceil(block_size),
        }
    }

    /// Half-open byte range of a block
    pub fn block_range(&self, index: u64) -> Range<u64> {
        let start = index * self.block_size;
        let end = (start + self.block_size).min(self.length);
        start..end
    }

    pub fn block_len(&self, index: u64) -> u64 {
        let range = self.block_range(index);
        range.end - range.start
    }

    /// Block containing byte `offset`
    pub fn block_of(&self, offset: u64) -> u64 {
        offset / self.block_size
    }

    pub fn clamp_threads(&self, requested: u32) -> u32 {
        let blocks = u32::try_from(self.blocks).unwrap_or(u32::MAX);
        requested.min(blocks).max(1)
    }

    /// Split `[0, blocks)` into contiguous runs, one per worker
    pub fn assign(&self, threads: u32) -> Vec<Range<u64>> {
        let threads = u64::from(self.clamp_threads(threads));
        (0..threads)
            .map(|i| (i * self.blocks / threads)..((i + 1) * self.blocks / threads))
            .collect()
    }
}

/// Set of completed block indices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockSet(BTreeSet<u64>);

impl BlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the block was not already marked
    pub fn mark(&mut self, index: u64) -> bool {
        self.0.insert(index)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.0.contains(&index)
    }

    pub fn len(&self) -> u64 {
        self.0.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// `true` exactly when every index in `[0, blocks)` is marked
    pub fn is_complete(&self, blocks: u64) -> bool {
        blocks > 0
            && self.len() == blocks
            && self.0.iter().next_back().is_some_and(|last| *last < blocks)
    }

    pub fn completed_bytes(&self, geometry: &BlockGeometry) -> u64 {
        self.0
            .iter()
            .filter(|index| **index < geometry.blocks)
            .map(|index| geometry.block_len(*index))
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<u64> for BlockSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Create the output file and size it to exactly `length` bytes
pub async fn preallocate(path: &Path, length: u64) -> std::io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.set_len(length).await?;
    file.sync_all().await?;
    Ok(())
}

/// A worker's own handle on the output file
pub struct BlockWriter {
    file: File,
}

impl BlockWriter {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().write(true).open(path).await?;
        Ok(Self { file })
    }

    /// Position the handle at `offset`
    pub async fn seek(&mut self, offset: u64) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        Ok(())
    }

    /// Write at the current position
    pub async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes).await
    }

    /// Flush buffered bytes and push them to stable storage
    pub async fn sync(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_count_rounds_up() {
        assert_eq!(BlockGeometry::new(0, 512).blocks, 0);
        assert_eq!(BlockGeometry::new(1, 512).blocks, 1);
        assert_eq!(BlockGeometry::new(512, 512).blocks, 1);
        assert_eq!(BlockGeometry::new(513, 512).blocks, 2);
        assert_eq!(BlockGeometry::new(10 * 512 + 7, 512).blocks, 11);
    }

    #[test]
    fn block_ranges_partition_the_length() {
        for (length, block_size) in [(1u64, 1u64), (1000, 7), (4096, 512), (4097, 512), (3, 10)] {
            let geometry = BlockGeometry::new(length, block_size);
            assert!(geometry.blocks * geometry.block_size >= length);

            let mut next = 0;
            for index in 0..geometry.blocks {
                let range = geometry.block_range(index);
                assert_eq!(range.start, next, "gap or overlap at block {index}");
                assert!(range.end > range.start);
                next = range.end;
            }
            assert_eq!(next, length);
        }
    }

    #[test]
    fn last_block_is_short() {
        let geometry = BlockGeometry::new(1030, 512);
        assert_eq!(geometry.block_range(2), 1024..1030);
        assert_eq!(geometry.block_len(2), 6);
        assert_eq!(geometry.block_of(1029), 2);
    }

    #[test]
    fn threads_are_clamped() {
        let geometry = BlockGeometry::new(3 * 512, 512);
        assert_eq!(geometry.clamp_threads(8), 3);
        assert_eq!(geometry.clamp_threads(0), 1);
        assert_eq!(geometry.clamp_threads(2), 2);
    }

    #[test]
    fn assignment_covers_every_block_once() {
        let geometry = BlockGeometry::new(10 * 512, 512);
        for threads in 1..=12 {
            let runs = geometry.assign(threads);
            assert_eq!(runs.len() as u32, geometry.clamp_threads(threads));
            let mut next = 0;
            for run in &runs {
                assert_eq!(run.start, next);
                assert!(run.end > run.start);
                next = run.end;
            }
            assert_eq!(next, geometry.blocks);
        }
    }

    #[test]
    fn block_set_completion() {
        let geometry = BlockGeometry::new(1030, 512);
        let mut set = BlockSet::new();
        assert!(!set.is_complete(geometry.blocks));
        assert!(set.mark(2));
        assert!(!set.mark(2));
        assert_eq!(set.completed_bytes(&geometry), 6);
        set.mark(0);
        assert!(!set.is_complete(geometry.blocks));
        set.mark(1);
        assert!(set.is_complete(geometry.blocks));
        assert_eq!(set.completed_bytes(&geometry), 1030);
    }

    #[test]
    fn out_of_range_marks_never_complete() {
        let set: BlockSet = [0, 1, 5].into_iter().collect();
        assert!(!set.is_complete(3));
    }

    #[tokio::test]
    async fn preallocate_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        preallocate(&path, 16).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);

        let mut writer = BlockWriter::open(&path).await.unwrap();
        writer.seek(4).await.unwrap();
        writer.write(b"abcd").await.unwrap();
        writer.sync().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[4..8], b"abcd");
        assert_eq!(bytes.len(), 16);
    }
}
