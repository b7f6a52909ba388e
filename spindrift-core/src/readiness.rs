//! Playback readiness gate.
//!
//! A stream request against an in-flight download is held until the head
//! of the target file is on disk, then released. The gate never waits
//! forever: after a bounded timeout it reports how far along the session
//! is so the HTTP layer can answer with a retry hint instead of hanging
//! the player.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::StreamingConfig;
use crate::session::DownloadSession;
use crate::session::SessionPhase;

/// Result of waiting for playback readiness.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessOutcome {
    /// Head bytes are available; streaming can begin.
    Ready { index: usize, length: u64 },
    /// Metadata not yet resolved, no file chosen. Retry later.
    Initializing,
    /// File chosen but the playback head is not downloaded yet.
    Buffering { available: u64, needed: u64 },
    /// The session died; the reason is user-displayable.
    Failed(String),
}

pub struct ReadinessGate {
    config: StreamingConfig,
}

impl ReadinessGate {
    pub fn new(config: StreamingConfig) -> Self {
        Self { config }
    }

    /// Waits until the head of the target file is playable.
    ///
    /// `file_index` pins an episode's file; `None` follows the session's
    /// selected file. The required head is `playback_head_bytes`, capped
    /// at the file length so tiny files do not wait forever.
    pub async fn wait_for_playback(
        &self,
        session: &DownloadSession,
        file_index: Option<usize>,
    ) -> ReadinessOutcome {
        let deadline = Instant::now() + self.config.readiness_timeout;

        loop {
            if session.is_cancelled() {
                return ReadinessOutcome::Failed("stream no longer available".to_string());
            }
            if session.phase() == SessionPhase::Failed {
                let reason = session
                    .failure()
                    .unwrap_or_else(|| "download failed".to_string());
                return ReadinessOutcome::Failed(reason);
            }

            match self.target_of(session, file_index) {
                Some((index, length)) => {
                    let needed = self.config.playback_head_bytes.min(length);
                    let available = session.available_prefix(index);
                    if available >= needed {
                        return ReadinessOutcome::Ready { index, length };
                    }
                    if Instant::now() >= deadline {
                        return ReadinessOutcome::Buffering { available, needed };
                    }
                }
                None => {
                    if Instant::now() >= deadline {
                        return ReadinessOutcome::Initializing;
                    }
                }
            }

            tokio::time::sleep(self.config.readiness_poll).await;
        }
    }

    fn target_of(
        &self,
        session: &DownloadSession,
        file_index: Option<usize>,
    ) -> Option<(usize, u64)> {
        match file_index {
            Some(index) => session
                .metadata()
                .and_then(|m| m.files.get(index).map(|f| (index, f.length))),
            None => session.selected_file().map(|f| (f.index, f.length)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.readiness_poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpindriftConfig;
    use crate::engine::{FetchEngine, SimulatedFetchEngine, SimulatedSource};
    use crate::magnet::MagnetLink;
    use crate::media::MediaId;
    use crate::session::{Attachment, SelectedFile};
    use std::path::Path;

    fn test_magnet(byte: u8) -> MagnetLink {
        MagnetLink::parse(&format!(
            "magnet:?xt=urn:btih:{}&tr=http%3A%2F%2Ft.example%2Fa",
            hex::encode([byte; 20])
        ))
        .unwrap()
    }

    async fn session_with_engine(
        engine: &SimulatedFetchEngine,
        link: &MagnetLink,
        dir: &Path,
        select: bool,
    ) -> DownloadSession {
        let handle = engine.start(link, dir).await.unwrap();
        let session = DownloadSession::new(
            link.content_hash,
            handle,
            Duration::from_secs(5),
            Attachment {
                media_id: MediaId::new(),
                episode_id: None,
                file_index: None,
            },
        );

        if select {
            let metadata = session.engine_handle().metadata().await.unwrap();
            let file = &metadata.files[0];
            session.set_selected(SelectedFile {
                index: 0,
                name: file.name.clone(),
                length: file.length,
                path: dir.join(&file.name),
            });
            session.set_metadata(metadata);
            session.set_phase(SessionPhase::Downloading);
        }
        session
    }

    fn gate() -> ReadinessGate {
        ReadinessGate::new(SpindriftConfig::for_testing().streaming)
    }

    #[tokio::test]
    async fn test_ready_once_head_is_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let engine =
            SimulatedFetchEngine::new().with_rate(64 * 1024, Duration::from_millis(1));
        let link = test_magnet(0x01);
        let session = session_with_engine(&engine, &link, dir.path(), true).await;

        let outcome = gate().wait_for_playback(&session, None).await;
        assert!(matches!(outcome, ReadinessOutcome::Ready { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_initializing_before_file_selection() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedFetchEngine::new().with_metadata_delay(Duration::from_secs(30));
        let link = test_magnet(0x02);
        let session = session_with_engine(&engine, &link, dir.path(), false).await;

        let outcome = gate().wait_for_playback(&session, None).await;
        assert_eq!(outcome, ReadinessOutcome::Initializing);
    }

    #[tokio::test]
    async fn test_buffering_when_head_is_slow() {
        let dir = tempfile::tempdir().unwrap();
        // Far too slow to reach the 4 KiB test head within the gate timeout
        let engine = SimulatedFetchEngine::new().with_rate(1, Duration::from_millis(100));
        let link = test_magnet(0x03);
        engine.register_source(
            link.content_hash,
            SimulatedSource::single_file("slow.mp4", vec![0u8; 1024 * 1024]),
        );
        let session = session_with_engine(&engine, &link, dir.path(), true).await;

        let outcome = gate().wait_for_playback(&session, None).await;
        match outcome {
            ReadinessOutcome::Buffering { available, needed } => {
                assert!(available < needed);
                assert_eq!(needed, 4096);
            }
            other => panic!("expected buffering, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tiny_file_needs_only_its_own_length() {
        let dir = tempfile::tempdir().unwrap();
        let engine =
            SimulatedFetchEngine::new().with_rate(64 * 1024, Duration::from_millis(1));
        let link = test_magnet(0x04);
        engine.register_source(
            link.content_hash,
            SimulatedSource::single_file("clip.mp4", vec![9u8; 512]),
        );
        let session = session_with_engine(&engine, &link, dir.path(), true).await;

        let outcome = gate().wait_for_playback(&session, None).await;
        assert!(matches!(
            outcome,
            ReadinessOutcome::Ready { index: 0, length: 512 }
        ));
    }

    #[tokio::test]
    async fn test_failed_session_reports_reason() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedFetchEngine::new();
        let link = test_magnet(0x05);
        let session = session_with_engine(&engine, &link, dir.path(), true).await;
        session.set_failed("tracker unreachable".to_string());

        let outcome = gate().wait_for_playback(&session, None).await;
        assert_eq!(
            outcome,
            ReadinessOutcome::Failed("tracker unreachable".to_string())
        );
    }
}
