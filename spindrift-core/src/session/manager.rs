//! Download session manager.
//!
//! Owns the process-wide session registry keyed by content hash. Media
//! records that share a source attach to one session instead of spawning
//! a second transfer. Each session gets a driver task that resolves
//! metadata, picks files, samples progress into the durable store, and
//! tears the session down on completion or failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SessionError;
use super::session::{Attachment, DownloadSession, DownloadStatus, SelectedFile, SessionPhase};
use crate::config::DownloadConfig;
use crate::engine::{FetchEngine, SourceMetadata};
use crate::magnet::MagnetLink;
use crate::media::{ContentHash, MediaId, MediaStatus};
use crate::store::SessionStore;

/// Which file of the source a download request is after.
///
/// Empty for movies (the largest video file wins); shows pin an explicit
/// file index and episode identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadTarget {
    pub file_index: Option<usize>,
    pub episode_id: Option<Uuid>,
}

type SessionMap = Arc<RwLock<HashMap<ContentHash, Arc<DownloadSession>>>>;
type MediaIndex = Arc<RwLock<HashMap<MediaId, ContentHash>>>;

pub struct DownloadManager {
    engine: Arc<dyn FetchEngine>,
    store: Arc<dyn SessionStore>,
    config: DownloadConfig,
    sessions: SessionMap,
    by_media: MediaIndex,
}

impl DownloadManager {
    pub fn new(
        engine: Arc<dyn FetchEngine>,
        store: Arc<dyn SessionStore>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            engine,
            store,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            by_media: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Starts (or attaches to) the download for a media record.
    ///
    /// At most one session exists per content hash: a second record with
    /// the same source joins the running session. The registry lock is
    /// held across engine start so two concurrent calls cannot race a
    /// duplicate transfer into existence.
    ///
    /// # Errors
    /// - `SessionError::MediaNotFound` - No record for `media_id`
    /// - `SessionError::Source` - Source reference does not parse
    /// - `SessionError::Engine` - Engine rejected the source
    pub async fn start_download(
        &self,
        media_id: MediaId,
        source_ref: &str,
        target: DownloadTarget,
    ) -> Result<Arc<DownloadSession>, SessionError> {
        self.store
            .get(media_id)
            .await?
            .ok_or(SessionError::MediaNotFound { media_id })?;

        let magnet = MagnetLink::parse(source_ref)?;
        let hash = magnet.content_hash;
        let attachment = Attachment {
            media_id,
            episode_id: target.episode_id,
            file_index: target.file_index,
        };

        let mut sessions = self.sessions.write().await;

        if let Some(session) = sessions.get(&hash).cloned() {
            debug!("Media {media_id} attaching to existing session for {hash}");
            session.attach(attachment.clone());
            self.by_media.write().await.insert(media_id, hash);
            drop(sessions);

            self.apply_attachment(&session, &attachment).await?;
            return Ok(session);
        }

        let download_dir = self.download_dir_for(hash);
        let handle = match self.engine.start(&magnet, &download_dir).await {
            Ok(handle) => handle,
            Err(e) => {
                let reason = e.to_string();
                if let Err(store_err) = self.store.set_error(media_id, reason).await {
                    warn!("Failed to persist start error for {media_id}: {store_err}");
                }
                return Err(e.into());
            }
        };

        let session = Arc::new(DownloadSession::new(
            hash,
            handle,
            self.config.speed_window,
            attachment,
        ));
        sessions.insert(hash, session.clone());
        drop(sessions);
        self.by_media.write().await.insert(media_id, hash);

        self.store
            .update_status(media_id, MediaStatus::Initializing)
            .await?;
        info!("Started download session {hash} for media {media_id}");

        self.spawn_driver(session.clone());
        Ok(session)
    }

    /// Re-runs a failed (or stuck) download from a clean durable state.
    pub async fn retry(&self, media_id: MediaId) -> Result<Arc<DownloadSession>, SessionError> {
        let record = self
            .store
            .get(media_id)
            .await?
            .ok_or(SessionError::MediaNotFound { media_id })?;

        self.cancel_download(media_id).await;
        self.store.reset_for_retry(media_id).await?;

        // Shows re-pin their first episode; the rest re-attach on demand.
        let target = record
            .episodes
            .first()
            .map(|ep| DownloadTarget {
                file_index: Some(ep.file_index),
                episode_id: Some(ep.id),
            })
            .unwrap_or_default();

        self.start_download(media_id, &record.source_ref, target).await
    }

    /// Detaches a media record from its session; the transfer is cancelled
    /// once no record is attached. Idempotent.
    pub async fn cancel_download(&self, media_id: MediaId) {
        let Some(hash) = self.by_media.write().await.remove(&media_id) else {
            return;
        };

        let session = self.sessions.read().await.get(&hash).cloned();
        if let Some(session) = session {
            if session.detach(media_id) == 0 {
                info!("Cancelling session {hash} (last attachment removed)");
                session.cancel().await;
                self.sessions.write().await.remove(&hash);
            }
        }
    }

    /// Cancels the download and removes the record plus its payload files.
    ///
    /// Partial download data is deleted unless another record still shares
    /// the same source.
    ///
    /// # Errors
    /// - `SessionError::MediaNotFound` - No record for `media_id`
    pub async fn delete_media(&self, media_id: MediaId) -> Result<(), SessionError> {
        let record = self
            .store
            .get(media_id)
            .await?
            .ok_or(SessionError::MediaNotFound { media_id })?;

        self.cancel_download(media_id).await;

        // Payload files are shared by every record with the same source;
        // only the last record standing takes the data with it.
        let hash = MagnetLink::parse(&record.source_ref)
            .ok()
            .map(|magnet| magnet.content_hash);
        let session_alive = match hash {
            Some(hash) => self.sessions.read().await.contains_key(&hash),
            None => false,
        };
        let shared = self
            .store
            .all()
            .await?
            .iter()
            .any(|r| r.id != media_id && r.source_ref == record.source_ref);

        if !session_alive && !shared {
            if let Some(path) = &record.file_path {
                remove_file_quietly(path).await;
            }
            for episode in &record.episodes {
                if let Some(path) = &episode.file_path {
                    remove_file_quietly(path).await;
                }
            }
            if let Some(hash) = hash {
                let dir = self.download_dir_for(hash);
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove download dir {}: {e}", dir.display());
                    }
                }
            }
        }

        self.store.remove(media_id).await?;
        info!("Removed media {media_id} and its files");
        Ok(())
    }

    pub async fn session_for(&self, media_id: MediaId) -> Option<Arc<DownloadSession>> {
        let hash = *self.by_media.read().await.get(&media_id)?;
        self.sessions.read().await.get(&hash).cloned()
    }

    pub async fn download_status(&self, media_id: MediaId) -> Option<DownloadStatus> {
        Some(self.session_for(media_id).await?.status_snapshot())
    }

    pub async fn is_download_active(&self, media_id: MediaId) -> bool {
        self.session_for(media_id).await.is_some()
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn download_dir_for(&self, hash: ContentHash) -> PathBuf {
        self.config.download_dir.join(hash.to_string())
    }

    /// Syncs store state for an attachment joining a session whose
    /// metadata is already resolved. No-op before that; the driver covers
    /// attachments present at resolution time.
    async fn apply_attachment(
        &self,
        session: &Arc<DownloadSession>,
        attachment: &Attachment,
    ) -> Result<(), SessionError> {
        let Some(metadata) = session.metadata() else {
            return Ok(());
        };

        let index = resolve_file_index(&metadata, attachment)?;
        let handle = session.engine_handle();
        if let Err(e) = handle.select_file(index) {
            warn!("File selection failed for attachment: {e}");
        }

        if let Some(path) = handle.file_path(index) {
            self.store
                .set_file_path(
                    attachment.media_id,
                    attachment.episode_id,
                    path,
                    Some(metadata.files[index].length),
                )
                .await?;
        }

        match session.phase() {
            SessionPhase::Complete => {
                self.store
                    .update_progress(attachment.media_id, 1.0)
                    .await?;
                self.store
                    .update_status(attachment.media_id, MediaStatus::Complete)
                    .await?;
            }
            SessionPhase::Failed => {
                let reason = session
                    .failure()
                    .unwrap_or_else(|| "download failed".to_string());
                self.store.set_error(attachment.media_id, reason).await?;
            }
            _ => {
                self.store
                    .update_status(attachment.media_id, MediaStatus::Downloading)
                    .await?;
            }
        }
        Ok(())
    }

    fn spawn_driver(&self, session: Arc<DownloadSession>) {
        let driver = SessionDriver {
            store: self.store.clone(),
            config: self.config.clone(),
            sessions: self.sessions.clone(),
            by_media: self.by_media.clone(),
        };
        tokio::spawn(driver.run(session));
    }
}

fn resolve_file_index(
    metadata: &SourceMetadata,
    attachment: &Attachment,
) -> Result<usize, SessionError> {
    match attachment.file_index {
        Some(index) => {
            if metadata.files.get(index).is_none() {
                return Err(crate::engine::EngineError::InvalidFileIndex {
                    index,
                    file_count: metadata.files.len(),
                }
                .into());
            }
            Ok(index)
        }
        None => metadata
            .largest_video_file()
            .ok_or(SessionError::NoFileSelected),
    }
}

async fn remove_file_quietly(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {e}", path.display());
        }
    }
}

/// Background task that walks one session through its lifecycle.
struct SessionDriver {
    store: Arc<dyn SessionStore>,
    config: DownloadConfig,
    sessions: SessionMap,
    by_media: MediaIndex,
}

impl SessionDriver {
    async fn run(self, session: Arc<DownloadSession>) {
        let handle = session.engine_handle().clone();

        let metadata =
            match tokio::time::timeout(self.config.metadata_timeout, handle.metadata()).await {
                Ok(Ok(metadata)) => metadata,
                Ok(Err(e)) => {
                    self.fail(&session, format!("metadata resolution failed: {e}"))
                        .await;
                    return;
                }
                Err(_) => {
                    self.fail(&session, "timed out waiting for source metadata".to_string())
                        .await;
                    return;
                }
            };
        session.set_metadata(metadata.clone());

        for attachment in session.attachments() {
            let index = match resolve_file_index(&metadata, &attachment) {
                Ok(index) => index,
                Err(e) => {
                    self.fail(&session, e.to_string()).await;
                    return;
                }
            };

            if let Err(e) = handle.select_file(index) {
                warn!("File selection failed: {e}");
            }

            if let Some(path) = handle.file_path(index) {
                let file = &metadata.files[index];
                if session.selected_file().is_none() {
                    session.set_selected(SelectedFile {
                        index,
                        name: file.name.clone(),
                        length: file.length,
                        path: path.clone(),
                    });
                }
                if let Err(e) = self
                    .store
                    .set_file_path(
                        attachment.media_id,
                        attachment.episode_id,
                        path,
                        Some(file.length),
                    )
                    .await
                {
                    warn!("Failed to persist file path: {e}");
                }
            }

            if let Err(e) = self
                .store
                .update_status(attachment.media_id, MediaStatus::Downloading)
                .await
            {
                warn!("Failed to persist downloading status: {e}");
            }
        }

        session.set_phase(SessionPhase::Downloading);
        info!(
            "Session {} downloading \"{}\" ({} files)",
            session.content_hash,
            metadata.name,
            metadata.files.len()
        );

        let mut last_progress = -1.0f64;
        loop {
            tokio::time::sleep(self.config.progress_tick).await;

            if session.is_cancelled() {
                return;
            }

            session.sample_speeds();

            if let Some(reason) = handle.failure() {
                self.fail(&session, reason).await;
                return;
            }

            let progress = session.progress();
            if (progress - last_progress).abs() >= 1e-3 {
                last_progress = progress;
                for attachment in session.attachments() {
                    let value = match attachment.file_index {
                        Some(index) => session.file_progress(index),
                        None => progress,
                    };
                    if let Err(e) = self.store.update_progress(attachment.media_id, value).await {
                        warn!("Failed to persist progress: {e}");
                    }
                }
            }

            if self.all_attachments_done(&session, &metadata) {
                self.complete(&session).await;
                return;
            }
        }
    }

    fn all_attachments_done(
        &self,
        session: &Arc<DownloadSession>,
        metadata: &SourceMetadata,
    ) -> bool {
        let handle = session.engine_handle();
        let attachments = session.attachments();
        if attachments.is_empty() {
            return false;
        }

        attachments.iter().all(|attachment| {
            let index = attachment
                .file_index
                .or_else(|| session.selected_file().map(|f| f.index));
            let Some(index) = index else { return false };
            match metadata.files.get(index) {
                Some(file) => handle.file_bytes_done(index) >= file.length,
                None => false,
            }
        })
    }

    async fn complete(&self, session: &Arc<DownloadSession>) {
        for attachment in session.attachments() {
            if let Err(e) = self.store.update_progress(attachment.media_id, 1.0).await {
                warn!("Failed to persist final progress: {e}");
            }
            if let Err(e) = self
                .store
                .update_status(attachment.media_id, MediaStatus::Complete)
                .await
            {
                warn!("Failed to persist complete status: {e}");
            }
        }

        session.set_phase(SessionPhase::Complete);
        info!("Download complete for {}", session.content_hash);

        // Linger briefly so in-flight readers finish against the session
        // before falling back to the completed file on disk.
        tokio::time::sleep(self.config.completion_grace).await;
        self.remove(session).await;
        session.engine_handle().shutdown().await;
    }

    async fn fail(&self, session: &Arc<DownloadSession>, reason: String) {
        warn!("Session {} failed: {reason}", session.content_hash);
        session.set_failed(reason.clone());

        for attachment in session.attachments() {
            if let Err(e) = self.store.set_error(attachment.media_id, reason.clone()).await {
                warn!("Failed to persist error state: {e}");
            }
        }

        self.remove(session).await;
        session.engine_handle().shutdown().await;
    }

    async fn remove(&self, session: &Arc<DownloadSession>) {
        self.sessions.write().await.remove(&session.content_hash);
        self.by_media
            .write()
            .await
            .retain(|_, hash| *hash != session.content_hash);
    }
}
