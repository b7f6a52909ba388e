//! Durable session store for media records.
//!
//! The store is the source of truth that survives process restarts. The
//! download session manager is its single writer for status, progress,
//! file location, and error state of a given media item.

mod json;

use std::path::PathBuf;

use async_trait::async_trait;
use uuid::Uuid;

pub use json::JsonSessionStore;

use crate::media::{MediaId, MediaRecord, MediaStatus};

/// Errors from the durable session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Media {media_id} not found")]
    MediaNotFound { media_id: MediaId },

    #[error("Episode {episode_id} not found for media {media_id}")]
    EpisodeNotFound { media_id: MediaId, episode_id: Uuid },

    #[error("Corrupt record at {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence contract for media records.
///
/// Implementations must be durable and crash-consistent: a write that
/// returns success survives a subsequent crash.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, media_id: MediaId) -> Result<Option<MediaRecord>, StoreError>;

    async fn all(&self) -> Result<Vec<MediaRecord>, StoreError>;

    async fn insert(&self, record: MediaRecord) -> Result<(), StoreError>;

    async fn update_status(&self, media_id: MediaId, status: MediaStatus)
    -> Result<(), StoreError>;

    /// Records progress in `[0, 1]`.
    ///
    /// Progress is monotonically non-decreasing while a session is active;
    /// only `reset_for_retry` moves it backwards.
    async fn update_progress(&self, media_id: MediaId, progress: f64) -> Result<(), StoreError>;

    /// Sets the resolved on-disk location, on the media record itself or
    /// on one of its episodes.
    async fn set_file_path(
        &self,
        media_id: MediaId,
        episode_id: Option<Uuid>,
        path: PathBuf,
        size: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Transitions to `error` status with a human-readable message.
    async fn set_error(&self, media_id: MediaId, message: String) -> Result<(), StoreError>;

    /// Resets to `added` with zero progress and no error, ahead of an
    /// explicit retry.
    async fn reset_for_retry(&self, media_id: MediaId) -> Result<(), StoreError>;

    async fn remove(&self, media_id: MediaId) -> Result<(), StoreError>;
}
