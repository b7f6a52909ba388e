//! JSON-file-backed session store.
//!
//! One document per media record under the store directory. Writes land
//! in a temp sibling first and are renamed into place, so a record file
//! is always either the old version or the new one, never a torn write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{SessionStore, StoreError};
use crate::config::StoreConfig;
use crate::media::{MediaId, MediaRecord, MediaStatus};

pub struct JsonSessionStore {
    config: StoreConfig,
    records: RwLock<HashMap<MediaId, MediaRecord>>,
}

impl JsonSessionStore {
    /// Opens the store, loading every record file in the store directory.
    ///
    /// Unreadable or corrupt record files are skipped with a warning so a
    /// single bad document cannot take the whole library down.
    ///
    /// # Errors
    /// - `StoreError::Io` - Store directory cannot be created or read
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&config.store_dir).await?;

        let mut records = HashMap::new();
        let mut entries = tokio::fs::read_dir(&config.store_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match Self::load_record(&path).await {
                Ok(record) => {
                    records.insert(record.id, record);
                }
                Err(e) => {
                    warn!("Skipping unreadable record {}: {e}", path.display());
                }
            }
        }

        debug!(
            "Session store opened with {} records from {}",
            records.len(),
            config.store_dir.display()
        );

        Ok(Self {
            config,
            records: RwLock::new(records),
        })
    }

    async fn load_record(path: &Path) -> Result<MediaRecord, StoreError> {
        let bytes = tokio::fs::read(path).await?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptRecord {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn record_path(&self, media_id: MediaId) -> PathBuf {
        self.config.store_dir.join(format!("{media_id}.json"))
    }

    /// Writes a record durably: temp file first, then atomic rename.
    async fn persist(&self, record: &MediaRecord) -> Result<(), StoreError> {
        let path = self.record_path(record.id);
        let temp_path = path.with_extension(format!("json{}", self.config.temp_file_suffix));

        let bytes = serde_json::to_vec_pretty(record).map_err(|e| StoreError::CorruptRecord {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        tokio::fs::write(&temp_path, &bytes).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    /// Applies a mutation to a cached record and persists the result.
    async fn mutate<F>(&self, media_id: MediaId, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut MediaRecord) -> Result<(), StoreError>,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&media_id)
            .ok_or(StoreError::MediaNotFound { media_id })?;

        apply(record)?;
        let snapshot = record.clone();
        drop(records);

        self.persist(&snapshot).await
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn get(&self, media_id: MediaId) -> Result<Option<MediaRecord>, StoreError> {
        Ok(self.records.read().await.get(&media_id).cloned())
    }

    async fn all(&self) -> Result<Vec<MediaRecord>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn insert(&self, record: MediaRecord) -> Result<(), StoreError> {
        self.persist(&record).await?;
        self.records.write().await.insert(record.id, record);
        Ok(())
    }

    async fn update_status(
        &self,
        media_id: MediaId,
        status: MediaStatus,
    ) -> Result<(), StoreError> {
        self.mutate(media_id, |record| {
            record.status = status;
            if status != MediaStatus::Error {
                record.last_error = None;
            }
            Ok(())
        })
        .await
    }

    async fn update_progress(&self, media_id: MediaId, progress: f64) -> Result<(), StoreError> {
        self.mutate(media_id, |record| {
            record.progress = progress.clamp(0.0, 1.0);
            Ok(())
        })
        .await
    }

    async fn set_file_path(
        &self,
        media_id: MediaId,
        episode_id: Option<Uuid>,
        path: PathBuf,
        size: Option<u64>,
    ) -> Result<(), StoreError> {
        self.mutate(media_id, |record| match episode_id {
            None => {
                record.file_path = Some(path);
                record.file_size = size;
                Ok(())
            }
            Some(episode_id) => {
                let episode = record
                    .episodes
                    .iter_mut()
                    .find(|e| e.id == episode_id)
                    .ok_or(StoreError::EpisodeNotFound {
                        media_id,
                        episode_id,
                    })?;
                episode.file_path = Some(path);
                episode.file_size = size;
                Ok(())
            }
        })
        .await
    }

    async fn set_error(&self, media_id: MediaId, message: String) -> Result<(), StoreError> {
        self.mutate(media_id, |record| {
            record.status = MediaStatus::Error;
            record.last_error = Some(message);
            Ok(())
        })
        .await
    }

    async fn reset_for_retry(&self, media_id: MediaId) -> Result<(), StoreError> {
        self.mutate(media_id, |record| {
            record.status = MediaStatus::Added;
            record.progress = 0.0;
            record.last_error = None;
            Ok(())
        })
        .await
    }

    async fn remove(&self, media_id: MediaId) -> Result<(), StoreError> {
        self.records.write().await.remove(&media_id);
        match tokio::fs::remove_file(self.record_path(media_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
