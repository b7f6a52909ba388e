//! Seam to the underlying source-fetch engine.
//!
//! The peer-wire protocol (piece selection, hash verification, peer
//! discovery) is not reimplemented here. The session manager only needs
//! byte-addressable readiness: which spans of a file are verified and on
//! disk, and a bounded way to wait for more.

pub mod simulation;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use simulation::{SimulatedFetchEngine, SimulatedSource};

use crate::magnet::MagnetLink;
use crate::transmux;

/// Errors from the source-fetch engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Fetch engine rejected source: {reason}")]
    Rejected { reason: String },

    #[error("Source metadata unavailable: {reason}")]
    MetadataUnavailable { reason: String },

    #[error("Transfer failed: {reason}")]
    TransferFailed { reason: String },

    #[error("File index {index} out of range for source with {file_count} files")]
    InvalidFileIndex { index: usize, file_count: usize },

    #[error("Fetch was stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One file within a (possibly multi-file) source.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub length: u64,
}

/// Resolved metadata for a source.
#[derive(Debug, Clone)]
pub struct SourceMetadata {
    pub name: String,
    pub files: Vec<SourceFile>,
}

impl SourceMetadata {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Index of the largest file with a video extension.
    ///
    /// This is how a movie request picks its payload out of a source that
    /// also carries samples, subtitles, and junk files.
    pub fn largest_video_file(&self) -> Option<usize> {
        self.files
            .iter()
            .enumerate()
            .filter(|(_, f)| transmux::is_video_file(&f.name))
            .max_by_key(|(_, f)| f.length)
            .map(|(index, _)| index)
    }
}

/// Live transfer counters for an active fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferStats {
    /// Total verified bytes downloaded across the source
    pub downloaded_bytes: u64,
    /// Total bytes uploaded to peers
    pub uploaded_bytes: u64,
    /// Currently connected peers
    pub peers: u32,
}

/// Entry point into the fetch engine.
#[async_trait]
pub trait FetchEngine: Send + Sync {
    /// Begins fetching a source into `download_dir`.
    ///
    /// Validates the source up front; metadata resolution happens later
    /// through the returned handle.
    ///
    /// # Errors
    /// - `EngineError::Rejected` - Engine cannot use this source (e.g. no
    ///   usable trackers)
    async fn start(
        &self,
        magnet: &MagnetLink,
        download_dir: &Path,
    ) -> Result<Box<dyn FetchHandle>, EngineError>;
}

/// Handle to one active fetch, exposing byte-addressable readiness.
#[async_trait]
pub trait FetchHandle: Send + Sync {
    /// Resolves source metadata (file list).
    ///
    /// Completes when first usable metadata arrives, or fails if the
    /// fetch dies before that.
    async fn metadata(&self) -> Result<SourceMetadata, EngineError>;

    /// Prioritizes one file of a multi-file source.
    ///
    /// # Errors
    /// - `EngineError::InvalidFileIndex` - Index outside the file list
    /// - `EngineError::MetadataUnavailable` - Called before metadata resolved
    fn select_file(&self, index: usize) -> Result<(), EngineError>;

    /// Non-blocking transfer counters.
    fn stats(&self) -> TransferStats;

    /// Verified-and-written bytes of one file, regardless of contiguity.
    fn file_bytes_done(&self, index: usize) -> u64;

    /// Length of the verified contiguous prefix of one file.
    fn available_prefix(&self, index: usize) -> u64;

    /// Waits until `[offset, offset + len)` of a file is verified.
    ///
    /// Returns `Ok(false)` when the timeout elapses first; the span may
    /// still arrive later.
    ///
    /// # Errors
    /// - `EngineError::TransferFailed` - Fetch died while waiting
    /// - `EngineError::Stopped` - Fetch was shut down
    async fn wait_for_bytes(
        &self,
        index: usize,
        offset: u64,
        len: u64,
        timeout: Duration,
    ) -> Result<bool, EngineError>;

    /// Reads verified bytes from a file. Callers wait for availability
    /// first; reading unverified spans is an error.
    async fn read_bytes(&self, index: usize, offset: u64, len: u64)
    -> Result<Bytes, EngineError>;

    /// On-disk path of a file; `None` until metadata is resolved.
    fn file_path(&self, index: usize) -> Option<PathBuf>;

    /// Terminal failure of the transfer, if any.
    fn failure(&self) -> Option<String>;

    /// Stops network activity. Partial data stays on disk.
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_largest_video_file_skips_non_video() {
        let metadata = SourceMetadata {
            name: "Pack".to_string(),
            files: vec![
                SourceFile {
                    name: "readme.txt".to_string(),
                    length: 100_000_000,
                },
                SourceFile {
                    name: "sample.mkv".to_string(),
                    length: 30_000_000,
                },
                SourceFile {
                    name: "feature.mkv".to_string(),
                    length: 900_000_000,
                },
            ],
        };

        assert_eq!(metadata.largest_video_file(), Some(2));
        assert_eq!(metadata.total_length(), 1_030_000_000);
    }

    #[test]
    fn test_largest_video_file_none_when_no_video() {
        let metadata = SourceMetadata {
            name: "Docs".to_string(),
            files: vec![SourceFile {
                name: "notes.txt".to_string(),
                length: 42,
            }],
        };
        assert_eq!(metadata.largest_video_file(), None);
    }
}
