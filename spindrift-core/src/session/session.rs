//! One live download session attached to a fetch handle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use super::{SessionError, SpeedTracker};
use crate::engine::{FetchHandle, SourceMetadata};
use crate::media::{ContentHash, MediaId};

/// In-memory lifecycle phase of a session.
///
/// Distinct from the durable media status: a session disappears when its
/// transfer ends, the record lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Initializing,
    Downloading,
    Complete,
    Failed,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Initializing => "initializing",
            SessionPhase::Downloading => "downloading",
            SessionPhase::Complete => "complete",
            SessionPhase::Failed => "error",
        }
    }
}

/// One media record's stake in a shared session.
///
/// Several records can attach to the same session when they share a
/// content hash; each may target a different file of the source.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub media_id: MediaId,
    pub episode_id: Option<Uuid>,
    pub file_index: Option<usize>,
}

/// The file a session delivers playback from.
#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub index: usize,
    pub name: String,
    pub length: u64,
    pub path: PathBuf,
}

/// Point-in-time session state for progress reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStatus {
    pub status: &'static str,
    pub progress: f64,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub peers: u32,
    pub total_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Live state around one active fetch.
///
/// Cheap to share; all mutation goes through interior locks. Byte waits
/// race against cancellation so readers never outlive a deleted session.
pub struct DownloadSession {
    pub content_hash: ContentHash,
    pub started_at: Instant,
    handle: Arc<dyn FetchHandle>,
    metadata: RwLock<Option<SourceMetadata>>,
    selected: RwLock<Option<SelectedFile>>,
    attachments: RwLock<Vec<Attachment>>,
    phase: RwLock<SessionPhase>,
    error: RwLock<Option<String>>,
    speed: Mutex<SpeedTracker>,
    cancel_tx: watch::Sender<bool>,
}

impl DownloadSession {
    pub fn new(
        content_hash: ContentHash,
        handle: Box<dyn FetchHandle>,
        speed_window: Duration,
        first: Attachment,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            content_hash,
            started_at: Instant::now(),
            handle: Arc::from(handle),
            metadata: RwLock::new(None),
            selected: RwLock::new(None),
            attachments: RwLock::new(vec![first]),
            phase: RwLock::new(SessionPhase::Initializing),
            error: RwLock::new(None),
            speed: Mutex::new(SpeedTracker::new(speed_window)),
            cancel_tx,
        }
    }

    pub(crate) fn engine_handle(&self) -> &Arc<dyn FetchHandle> {
        &self.handle
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    pub(crate) fn set_phase(&self, phase: SessionPhase) {
        *self.phase.write() = phase;
    }

    pub(crate) fn set_failed(&self, reason: String) {
        *self.error.write() = Some(reason);
        *self.phase.write() = SessionPhase::Failed;
    }

    pub fn failure(&self) -> Option<String> {
        self.error.read().clone()
    }

    pub fn metadata(&self) -> Option<SourceMetadata> {
        self.metadata.read().clone()
    }

    pub(crate) fn set_metadata(&self, metadata: SourceMetadata) {
        *self.metadata.write() = Some(metadata);
    }

    pub fn selected_file(&self) -> Option<SelectedFile> {
        self.selected.read().clone()
    }

    pub(crate) fn set_selected(&self, file: SelectedFile) {
        *self.selected.write() = Some(file);
    }

    pub fn attachments(&self) -> Vec<Attachment> {
        self.attachments.read().clone()
    }

    pub(crate) fn attach(&self, attachment: Attachment) {
        let mut attachments = self.attachments.write();
        if !attachments
            .iter()
            .any(|a| a.media_id == attachment.media_id && a.episode_id == attachment.episode_id)
        {
            attachments.push(attachment);
        }
    }

    /// Drops one media record's stake. Returns the number of remaining
    /// attachments; the manager tears the session down at zero.
    pub(crate) fn detach(&self, media_id: MediaId) -> usize {
        let mut attachments = self.attachments.write();
        attachments.retain(|a| a.media_id != media_id);
        attachments.len()
    }

    /// Fraction of the selected file already verified, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let Some(selected) = self.selected_file() else {
            return 0.0;
        };
        if selected.length == 0 {
            return 1.0;
        }
        let done = self.handle.file_bytes_done(selected.index) as f64;
        (done / selected.length as f64).clamp(0.0, 1.0)
    }

    /// Fraction of one file already verified, in `[0, 1]`.
    pub fn file_progress(&self, index: usize) -> f64 {
        let Some(length) = self
            .metadata()
            .and_then(|m| m.files.get(index).map(|f| f.length))
        else {
            return 0.0;
        };
        if length == 0 {
            return 1.0;
        }
        (self.handle.file_bytes_done(index) as f64 / length as f64).clamp(0.0, 1.0)
    }

    pub fn available_prefix(&self, index: usize) -> u64 {
        self.handle.available_prefix(index)
    }

    pub(crate) fn sample_speeds(&self) {
        let stats = self.handle.stats();
        self.speed
            .lock()
            .record(stats.downloaded_bytes, stats.uploaded_bytes);
    }

    pub fn status_snapshot(&self) -> DownloadStatus {
        let stats = self.handle.stats();
        let (download_speed, upload_speed) = self.speed.lock().speeds();

        DownloadStatus {
            status: self.phase().as_str(),
            progress: self.progress(),
            download_speed,
            upload_speed,
            peers: stats.peers,
            total_size: self.selected_file().map(|f| f.length),
            error: self.failure(),
        }
    }

    /// Waits for `[offset, offset + len)` of a file, racing cancellation.
    ///
    /// Returns `Ok(false)` on timeout.
    ///
    /// # Errors
    /// - `SessionError::StreamClosed` - Session cancelled while waiting
    /// - `SessionError::Engine` - Transfer died
    pub async fn wait_for_bytes(
        &self,
        index: usize,
        offset: u64,
        len: u64,
        timeout: Duration,
    ) -> Result<bool, SessionError> {
        let mut cancelled = self.cancel_tx.subscribe();
        if *cancelled.borrow() {
            return Err(SessionError::StreamClosed);
        }

        tokio::select! {
            result = self.handle.wait_for_bytes(index, offset, len, timeout) => {
                Ok(result?)
            }
            _ = cancelled.changed() => Err(SessionError::StreamClosed),
        }
    }

    pub async fn read_bytes(
        &self,
        index: usize,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, SessionError> {
        Ok(self.handle.read_bytes(index, offset, len).await?)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Stops the transfer and releases anyone blocked in `wait_for_bytes`.
    pub async fn cancel(&self) {
        // send_replace stores the flag even when nobody is subscribed yet,
        // so late is_cancelled() checks still observe the cancellation.
        self.cancel_tx.send_replace(true);
        self.handle.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FetchEngine, SimulatedFetchEngine};
    use crate::magnet::MagnetLink;

    async fn session_for_test(dir: &std::path::Path) -> DownloadSession {
        let engine = SimulatedFetchEngine::new().with_rate(1, Duration::from_secs(10));
        let hash = hex::encode([0x77u8; 20]);
        let link = MagnetLink::parse(&format!(
            "magnet:?xt=urn:btih:{hash}&tr=http%3A%2F%2Ft.example%2Fa"
        ))
        .unwrap();
        let handle = engine.start(&link, dir).await.unwrap();
        DownloadSession::new(
            link.content_hash,
            handle,
            Duration::from_secs(5),
            Attachment {
                media_id: MediaId::new(),
                episode_id: None,
                file_index: None,
            },
        )
    }

    #[tokio::test]
    async fn test_cancel_unblocks_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(session_for_test(dir.path()).await);

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .wait_for_bytes(0, 0, 1_000_000, Duration::from_secs(30))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.cancel().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SessionError::StreamClosed)));
        assert!(session.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_is_visible_without_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_for_test(dir.path()).await;

        assert!(!session.is_cancelled());
        session.cancel().await;
        assert!(session.is_cancelled());

        let result = session.wait_for_bytes(0, 0, 1, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_attach_deduplicates_and_detach_counts() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_for_test(dir.path()).await;
        let other = MediaId::new();

        session.attach(Attachment {
            media_id: other,
            episode_id: None,
            file_index: None,
        });
        session.attach(Attachment {
            media_id: other,
            episode_id: None,
            file_index: None,
        });
        assert_eq!(session.attachments().len(), 2);

        assert_eq!(session.detach(other), 1);
        assert_eq!(session.detach(other), 1);
    }

    #[tokio::test]
    async fn test_progress_is_zero_before_selection() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_for_test(dir.path()).await;
        assert_eq!(session.progress(), 0.0);
        assert_eq!(session.phase(), SessionPhase::Initializing);
    }
}
