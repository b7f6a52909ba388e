//! Download session management.
//!
//! A session is the in-memory side of one active transfer; the durable
//! record in the store is its on-disk shadow. The manager keeps at most
//! one session per content hash and drives each through metadata
//! resolution, file selection, progress persistence, and teardown.

mod manager;
mod session;
mod speed;

pub use manager::{DownloadManager, DownloadTarget};
pub use session::{Attachment, DownloadSession, DownloadStatus, SelectedFile, SessionPhase};
pub(crate) use speed::SpeedTracker;

use crate::engine::EngineError;
use crate::magnet::SourceError;
use crate::media::MediaId;
use crate::store::StoreError;

/// Errors from the download session layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Media {media_id} not found")]
    MediaNotFound { media_id: MediaId },

    #[error("Stream closed")]
    StreamClosed,

    #[error("Source contains no playable video file")]
    NoFileSelected,

    #[error("Download stalled at offset {offset}")]
    Stalled { offset: u64 },
}
