//! Deterministic in-process fetch engine for development and tests.
//!
//! Writes seeded content to real files at a configurable rate, so the
//! whole delivery path (readiness gate, range reads, transmux input) can
//! be exercised without a network. Failure injection covers the two
//! engine failure classes: rejection at start and mid-transfer death.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::{EngineError, FetchEngine, FetchHandle, SourceFile, SourceMetadata, TransferStats};
use crate::magnet::MagnetLink;
use crate::media::ContentHash;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Content served by the simulated engine for one source.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    pub name: String,
    pub files: Vec<(String, Bytes)>,
}

impl SimulatedSource {
    /// Single-file source with the given file name and content.
    pub fn single_file(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let name = name.into();
        Self {
            name: name.clone(),
            files: vec![(name, content.into())],
        }
    }
}

#[derive(Debug, Default, Clone)]
struct FailureInjection {
    on_start: Option<String>,
    after_bytes: Option<(u64, String)>,
}

/// Simulated fetch engine.
pub struct SimulatedFetchEngine {
    sources: RwLock<HashMap<ContentHash, SimulatedSource>>,
    failures: RwLock<HashMap<ContentHash, FailureInjection>>,
    bytes_per_tick: u64,
    tick: Duration,
    metadata_delay: Duration,
    default_file_len: usize,
}

impl SimulatedFetchEngine {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            bytes_per_tick: 256 * 1024,
            tick: Duration::from_millis(10),
            metadata_delay: Duration::ZERO,
            default_file_len: 512 * 1024,
        }
    }

    /// Overrides the delivery rate (bytes written per tick).
    pub fn with_rate(mut self, bytes_per_tick: u64, tick: Duration) -> Self {
        self.bytes_per_tick = bytes_per_tick;
        self.tick = tick;
        self
    }

    /// Delays metadata resolution, to exercise the initializing window.
    pub fn with_metadata_delay(mut self, delay: Duration) -> Self {
        self.metadata_delay = delay;
        self
    }

    /// Registers explicit content for a source. Unregistered sources get
    /// a synthesized single video file with hash-derived bytes.
    pub fn register_source(&self, content_hash: ContentHash, source: SimulatedSource) {
        self.sources.write().insert(content_hash, source);
    }

    /// Makes `start` reject this source.
    pub fn inject_start_failure(&self, content_hash: ContentHash, reason: impl Into<String>) {
        self.failures.write().entry(content_hash).or_default().on_start = Some(reason.into());
    }

    /// Kills the transfer once the given byte count has been written.
    pub fn inject_transfer_failure(
        &self,
        content_hash: ContentHash,
        after_bytes: u64,
        reason: impl Into<String>,
    ) {
        self.failures.write().entry(content_hash).or_default().after_bytes =
            Some((after_bytes, reason.into()));
    }

    pub fn clear_failures(&self, content_hash: ContentHash) {
        self.failures.write().remove(&content_hash);
    }

    fn source_for(&self, magnet: &MagnetLink) -> SimulatedSource {
        if let Some(source) = self.sources.read().get(&magnet.content_hash) {
            return source.clone();
        }

        // Synthesize deterministic content from the hash
        let hash = magnet.content_hash.as_bytes();
        let content: Bytes = (0..self.default_file_len)
            .map(|i| hash[i % 20] ^ (i / 20) as u8)
            .collect::<Vec<u8>>()
            .into();
        let name = format!("{}.mp4", magnet.name_or_fallback());
        SimulatedSource::single_file(name, content)
    }
}

impl Default for SimulatedFetchEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FetchEngine for SimulatedFetchEngine {
    async fn start(
        &self,
        magnet: &MagnetLink,
        download_dir: &Path,
    ) -> Result<Box<dyn FetchHandle>, EngineError> {
        if magnet.trackers.is_empty() {
            return Err(EngineError::Rejected {
                reason: "no usable trackers in source".to_string(),
            });
        }

        let injection = self
            .failures
            .read()
            .get(&magnet.content_hash)
            .cloned()
            .unwrap_or_default();

        if let Some(reason) = injection.on_start {
            return Err(EngineError::Rejected { reason });
        }

        let source = self.source_for(magnet);
        tokio::fs::create_dir_all(download_dir).await?;

        let files: Vec<SourceFile> = source
            .files
            .iter()
            .map(|(name, content)| SourceFile {
                name: name.clone(),
                length: content.len() as u64,
            })
            .collect();

        let state = Arc::new(Mutex::new(TransferState {
            written: vec![0; files.len()],
            failed: None,
            stopped: false,
        }));
        let metadata_ready = Arc::new(AtomicBool::new(false));

        let handle = SimulatedFetchHandle {
            name: source.name.clone(),
            dir: download_dir.to_path_buf(),
            files,
            state: state.clone(),
            metadata_ready: metadata_ready.clone(),
        };

        let writer = TransferWriter {
            dir: download_dir.to_path_buf(),
            source,
            state,
            metadata_ready,
            bytes_per_tick: self.bytes_per_tick,
            tick: self.tick,
            metadata_delay: self.metadata_delay,
            fail_after: injection.after_bytes,
        };
        tokio::spawn(writer.run());

        Ok(Box::new(handle))
    }
}

struct TransferState {
    written: Vec<u64>,
    failed: Option<String>,
    stopped: bool,
}

struct TransferWriter {
    dir: PathBuf,
    source: SimulatedSource,
    state: Arc<Mutex<TransferState>>,
    metadata_ready: Arc<AtomicBool>,
    bytes_per_tick: u64,
    tick: Duration,
    metadata_delay: Duration,
    fail_after: Option<(u64, String)>,
}

impl TransferWriter {
    async fn run(self) {
        if !self.metadata_delay.is_zero() {
            tokio::time::sleep(self.metadata_delay).await;
        }
        self.metadata_ready.store(true, Ordering::Release);

        let mut total_written = 0u64;

        for (index, (name, content)) in self.source.files.iter().enumerate() {
            let path = self.dir.join(name);
            let mut file = match tokio::fs::File::create(&path).await {
                Ok(file) => file,
                Err(e) => {
                    self.state.lock().failed = Some(format!("cannot create {name}: {e}"));
                    return;
                }
            };

            let mut offset = 0usize;
            while offset < content.len() {
                if self.state.lock().stopped {
                    debug!("Simulated transfer stopped");
                    return;
                }

                let end = (offset + self.bytes_per_tick as usize).min(content.len());
                if let Err(e) = file.write_all(&content[offset..end]).await {
                    self.state.lock().failed = Some(format!("write failed: {e}"));
                    return;
                }
                if let Err(e) = file.flush().await {
                    self.state.lock().failed = Some(format!("flush failed: {e}"));
                    return;
                }

                total_written += (end - offset) as u64;
                offset = end;
                self.state.lock().written[index] = offset as u64;

                if let Some((after, reason)) = &self.fail_after {
                    if total_written >= *after {
                        self.state.lock().failed = Some(reason.clone());
                        return;
                    }
                }

                tokio::time::sleep(self.tick).await;
            }
        }
    }
}

struct SimulatedFetchHandle {
    name: String,
    dir: PathBuf,
    files: Vec<SourceFile>,
    state: Arc<Mutex<TransferState>>,
    metadata_ready: Arc<AtomicBool>,
}

impl SimulatedFetchHandle {
    fn check_index(&self, index: usize) -> Result<&SourceFile, EngineError> {
        self.files.get(index).ok_or(EngineError::InvalidFileIndex {
            index,
            file_count: self.files.len(),
        })
    }
}

#[async_trait]
impl FetchHandle for SimulatedFetchHandle {
    async fn metadata(&self) -> Result<SourceMetadata, EngineError> {
        loop {
            if self.metadata_ready.load(Ordering::Acquire) {
                return Ok(SourceMetadata {
                    name: self.name.clone(),
                    files: self.files.clone(),
                });
            }

            {
                let state = self.state.lock();
                if let Some(reason) = &state.failed {
                    return Err(EngineError::MetadataUnavailable {
                        reason: reason.clone(),
                    });
                }
                if state.stopped {
                    return Err(EngineError::Stopped);
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn select_file(&self, index: usize) -> Result<(), EngineError> {
        if !self.metadata_ready.load(Ordering::Acquire) {
            return Err(EngineError::MetadataUnavailable {
                reason: "metadata not yet resolved".to_string(),
            });
        }
        self.check_index(index)?;
        Ok(())
    }

    fn stats(&self) -> TransferStats {
        let state = self.state.lock();
        let downloaded: u64 = state.written.iter().sum();
        let active = state.failed.is_none() && !state.stopped;

        TransferStats {
            downloaded_bytes: downloaded,
            uploaded_bytes: downloaded / 8,
            peers: if active {
                8 + rand::rng().random_range(0..5)
            } else {
                0
            },
        }
    }

    fn file_bytes_done(&self, index: usize) -> u64 {
        self.state.lock().written.get(index).copied().unwrap_or(0)
    }

    fn available_prefix(&self, index: usize) -> u64 {
        // Simulated writes are sequential, so done == contiguous prefix
        self.file_bytes_done(index)
    }

    async fn wait_for_bytes(
        &self,
        index: usize,
        offset: u64,
        len: u64,
        timeout: Duration,
    ) -> Result<bool, EngineError> {
        let file_len = self.check_index(index)?.length;
        let needed = (offset + len).min(file_len);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let state = self.state.lock();
                if state.written.get(index).copied().unwrap_or(0) >= needed {
                    return Ok(true);
                }
                if let Some(reason) = &state.failed {
                    return Err(EngineError::TransferFailed {
                        reason: reason.clone(),
                    });
                }
                if state.stopped {
                    return Err(EngineError::Stopped);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn read_bytes(
        &self,
        index: usize,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, EngineError> {
        let file = self.check_index(index)?;
        if offset >= file.length {
            return Ok(Bytes::new());
        }

        let read_len = len.min(file.length - offset) as usize;
        let path = self.dir.join(&file.name);

        let mut fh = tokio::fs::File::open(&path).await?;
        fh.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; read_len];
        fh.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    fn file_path(&self, index: usize) -> Option<PathBuf> {
        if !self.metadata_ready.load(Ordering::Acquire) {
            return None;
        }
        self.files.get(index).map(|f| self.dir.join(&f.name))
    }

    fn failure(&self) -> Option<String> {
        self.state.lock().failed.clone()
    }

    async fn shutdown(&self) {
        self.state.lock().stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn magnet(hash_byte: u8) -> MagnetLink {
        let hash = hex::encode([hash_byte; 20]);
        MagnetLink::parse(&format!(
            "magnet:?xt=urn:btih:{hash}&dn=Test&tr=http%3A%2F%2Ftracker.example%2Fannounce"
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_synthesized_source_completes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedFetchEngine::new().with_rate(1024 * 1024, Duration::from_millis(1));
        let link = magnet(0x11);

        let handle = engine.start(&link, dir.path()).await.unwrap();
        let metadata = handle.metadata().await.unwrap();
        assert_eq!(metadata.files.len(), 1);

        let length = metadata.files[0].length;
        let done = handle
            .wait_for_bytes(0, 0, length, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(done);
        assert_eq!(handle.file_bytes_done(0), length);

        let head = handle.read_bytes(0, 0, 16).await.unwrap();
        assert_eq!(head.len(), 16);
    }

    #[tokio::test]
    async fn test_rejects_trackerless_magnet() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedFetchEngine::new();
        let hash = hex::encode([0x22u8; 20]);
        let link = MagnetLink::parse(&format!("magnet:?xt=urn:btih:{hash}")).unwrap();

        let result = engine.start(&link, dir.path()).await;
        assert!(matches!(result, Err(EngineError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_start_failure_injection() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedFetchEngine::new();
        let link = magnet(0x33);
        engine.inject_start_failure(link.content_hash, "tracker refused announce");

        let result = engine.start(&link, dir.path()).await;
        assert!(matches!(result, Err(EngineError::Rejected { .. })));

        engine.clear_failures(link.content_hash);
        assert!(engine.start(&link, dir.path()).await.is_ok());
    }

    #[tokio::test]
    async fn test_transfer_failure_injection() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedFetchEngine::new().with_rate(1024, Duration::from_millis(1));
        let link = magnet(0x44);
        engine.register_source(
            link.content_hash,
            SimulatedSource::single_file("movie.mp4", vec![7u8; 64 * 1024]),
        );
        engine.inject_transfer_failure(link.content_hash, 8 * 1024, "peer swarm vanished");

        let handle = engine.start(&link, dir.path()).await.unwrap();
        let result = handle
            .wait_for_bytes(0, 0, 64 * 1024, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(EngineError::TransferFailed { .. })));
        assert!(handle.failure().unwrap().contains("peer swarm vanished"));
    }

    #[tokio::test]
    async fn test_wait_timeout_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        // One byte per 50ms: nowhere near done within the timeout
        let engine = SimulatedFetchEngine::new().with_rate(1, Duration::from_millis(50));
        let link = magnet(0x55);
        engine.register_source(
            link.content_hash,
            SimulatedSource::single_file("slow.mp4", vec![1u8; 10_000]),
        );

        let handle = engine.start(&link, dir.path()).await.unwrap();
        let done = handle
            .wait_for_bytes(0, 0, 10_000, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!done);
    }

    #[tokio::test]
    async fn test_metadata_fails_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let engine =
            SimulatedFetchEngine::new().with_metadata_delay(Duration::from_secs(30));
        let link = magnet(0x77);

        let handle = engine.start(&link, dir.path()).await.unwrap();
        handle.shutdown().await;

        let result = handle.metadata().await;
        assert!(matches!(result, Err(EngineError::Stopped)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_writer() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedFetchEngine::new().with_rate(1, Duration::from_millis(20));
        let link = magnet(0x66);

        let handle = engine.start(&link, dir.path()).await.unwrap();
        handle.metadata().await.unwrap();
        handle.shutdown().await;

        let result = handle
            .wait_for_bytes(0, 0, 1_000, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(EngineError::Stopped)));
    }
}
