//! Byte delivery for playback.
//!
//! Picks the cheapest source for a stream request (finished file on disk
//! versus live session) and turns either into a chunked byte stream over
//! the resolved range. Reads against a live session wait at the download
//! frontier instead of returning short.

mod range;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

pub use range::{ByteRange, RangeError, resolve_range};

use crate::media::{MediaRecord, MediaStatus};
use crate::session::{DownloadManager, DownloadSession, SessionError};

/// Where the bytes for a stream request come from.
pub enum StreamSource {
    /// Finished file on disk; serve directly with full range support.
    Completed { path: PathBuf, size: u64 },
    /// Live download; serve through the session with frontier waits.
    /// `file_index` is pinned for episodes, `None` follows the session's
    /// selected file.
    Active {
        session: Arc<DownloadSession>,
        file_index: Option<usize>,
    },
    /// No finished file and no live session.
    Missing,
}

/// Resolves the byte source for a media item or one of its episodes.
///
/// A complete record with its file still on disk wins over a lingering
/// session, so finished media never pays session overhead. A complete
/// record whose file vanished falls through to `Missing`.
pub async fn resolve_source(
    record: &MediaRecord,
    episode_id: Option<Uuid>,
    manager: &DownloadManager,
) -> StreamSource {
    let (path, file_index) = match episode_id {
        Some(episode_id) => match record.episode(episode_id) {
            Some(episode) => (episode.file_path.clone(), Some(episode.file_index)),
            None => return StreamSource::Missing,
        },
        None => (record.file_path.clone(), None),
    };

    if record.status == MediaStatus::Complete {
        if let Some(path) = path {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                return StreamSource::Completed {
                    path,
                    size: meta.len(),
                };
            }
        }
    }

    match manager.session_for(record.id).await {
        Some(session) => StreamSource::Active {
            session,
            file_index,
        },
        None => StreamSource::Missing,
    }
}

struct SessionReadState {
    session: Arc<DownloadSession>,
    index: usize,
    pos: u64,
    end: u64,
    chunk_size: u64,
    stall_timeout: Duration,
}

/// Streams a byte range out of a live session.
///
/// Each chunk first waits for its span to be verified, bounded by
/// `stall_timeout`; exceeding the bound is a hard `Stalled` error rather
/// than a silent short body, so consumers can distinguish truncation
/// from completion.
pub fn session_byte_stream(
    session: Arc<DownloadSession>,
    index: usize,
    range: ByteRange,
    chunk_size: usize,
    stall_timeout: Duration,
) -> impl Stream<Item = Result<Bytes, SessionError>> + Send {
    let state = SessionReadState {
        session,
        index,
        pos: range.start,
        end: range.end,
        chunk_size: chunk_size as u64,
        stall_timeout,
    };

    futures::stream::try_unfold(state, |mut state| async move {
        if state.pos > state.end {
            return Ok(None);
        }

        let len = state.chunk_size.min(state.end - state.pos + 1);
        let arrived = state
            .session
            .wait_for_bytes(state.index, state.pos, len, state.stall_timeout)
            .await?;
        if !arrived {
            return Err(SessionError::Stalled { offset: state.pos });
        }

        let bytes = state.session.read_bytes(state.index, state.pos, len).await?;
        state.pos += bytes.len() as u64;
        Ok(Some((bytes, state)))
    })
}

struct FileReadState {
    file: tokio::fs::File,
    remaining: u64,
    chunk_size: u64,
}

/// Streams a byte range out of a finished file on disk.
///
/// # Errors
/// - `std::io::Error` - File cannot be opened or seeked
pub async fn file_byte_stream(
    path: &std::path::Path,
    range: ByteRange,
    chunk_size: usize,
) -> std::io::Result<impl Stream<Item = std::io::Result<Bytes>> + Send + use<>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(range.start)).await?;

    let state = FileReadState {
        file,
        remaining: range.len(),
        chunk_size: chunk_size as u64,
    };

    Ok(futures::stream::try_unfold(state, |mut state| async move {
        if state.remaining == 0 {
            return Ok(None);
        }

        let len = state.chunk_size.min(state.remaining) as usize;
        let mut buf = vec![0u8; len];
        state.file.read_exact(&mut buf).await?;
        state.remaining -= len as u64;
        Ok(Some((Bytes::from(buf), state)))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FetchEngine, SimulatedFetchEngine, SimulatedSource};
    use crate::magnet::MagnetLink;
    use crate::media::MediaId;
    use crate::session::{Attachment, SelectedFile};
    use futures::TryStreamExt;

    fn test_magnet(byte: u8) -> MagnetLink {
        MagnetLink::parse(&format!(
            "magnet:?xt=urn:btih:{}&tr=http%3A%2F%2Ft.example%2Fa",
            hex::encode([byte; 20])
        ))
        .unwrap()
    }

    async fn live_session(
        engine: &SimulatedFetchEngine,
        link: &MagnetLink,
        dir: &std::path::Path,
    ) -> Arc<DownloadSession> {
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
        let metadata = session.engine_handle().metadata().await.unwrap();
        let file = &metadata.files[0];
        session.set_selected(SelectedFile {
            index: 0,
            name: file.name.clone(),
            length: file.length,
            path: dir.join(&file.name),
        });
        session.set_metadata(metadata);
        Arc::new(session)
    }

    #[tokio::test]
    async fn test_session_stream_delivers_exact_range() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedFetchEngine::new().with_rate(16 * 1024, Duration::from_millis(1));
        let link = test_magnet(0x21);
        let content: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
        engine.register_source(
            link.content_hash,
            SimulatedSource::single_file("movie.mp4", content.clone()),
        );

        let session = live_session(&engine, &link, dir.path()).await;
        let range = ByteRange {
            start: 1000,
            end: 50_999,
        };

        let chunks: Vec<Bytes> =
            session_byte_stream(session, 0, range, 8192, Duration::from_secs(5))
                .try_collect()
                .await
                .unwrap();

        let body: Vec<u8> = chunks.concat();
        assert_eq!(body.len(), 50_000);
        assert_eq!(body, content[1000..51_000]);
    }

    #[tokio::test]
    async fn test_session_stream_stalls_past_frontier() {
        let dir = tempfile::tempdir().unwrap();
        // Effectively frozen transfer
        let engine = SimulatedFetchEngine::new().with_rate(1, Duration::from_secs(10));
        let link = test_magnet(0x22);
        engine.register_source(
            link.content_hash,
            SimulatedSource::single_file("movie.mp4", vec![5u8; 128 * 1024]),
        );

        let session = live_session(&engine, &link, dir.path()).await;
        let range = ByteRange {
            start: 0,
            end: 128 * 1024 - 1,
        };

        let result: Result<Vec<Bytes>, _> =
            session_byte_stream(session, 0, range, 8192, Duration::from_millis(50))
                .try_collect()
                .await;

        assert!(matches!(result, Err(SessionError::Stalled { offset: 0 })));
    }

    #[tokio::test]
    async fn test_file_stream_reads_exact_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.mp4");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
        tokio::fs::write(&path, &content).await.unwrap();

        let range = ByteRange {
            start: 100,
            end: 4099,
        };
        let chunks: Vec<Bytes> = file_byte_stream(&path, range, 1024)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        let body: Vec<u8> = chunks.concat();
        assert_eq!(body, content[100..4100]);
    }
}
