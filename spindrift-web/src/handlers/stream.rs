//! Streaming endpoint.
//!
//! Serves media bytes for playback, from a finished file when one
//! exists and straight out of the live download session otherwise.
//! Natively playable containers get real byte-range support; everything
//! else is remuxed on the fly to fragmented MP4 without a known length.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, Response, StatusCode, header};
use futures::StreamExt;
use serde::Deserialize;
use spindrift_core::SpindriftError;
use spindrift_core::media::{MediaId, MediaRecord, MediaStatus};
use spindrift_core::readiness::ReadinessOutcome;
use spindrift_core::session::{DownloadSession, DownloadTarget, SessionPhase};
use spindrift_core::stream::{self, ByteRange, StreamSource, resolve_range};
use spindrift_core::transmux::{self, FRAGMENTED_OUTPUT_CONTENT_TYPE};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::error_response;
use crate::server::AppState;

const RETRY_AFTER_SECONDS: &str = "2";
const STREAMING_CACHE_CONTROL: &str = "no-cache, no-store";

/// Query parameters for stream requests.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Episode to play, for show records
    pub episode: Option<Uuid>,
}

pub async fn stream_media(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
    Query(query): Query<StreamQuery>,
    method: Method,
    headers: HeaderMap,
) -> Response<Body> {
    let Ok(media_id) = media_id.parse::<MediaId>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid media id");
    };

    let record = match state.store.get(media_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Media not found"),
        Err(e) => {
            error!("Failed to load media {media_id}: {e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error occurred");
        }
    };

    if let Some(episode_id) = query.episode {
        if record.episode(episode_id).is_none() {
            return error_response(StatusCode::NOT_FOUND, "Episode not found");
        }
    }

    match stream::resolve_source(&record, query.episode, &state.downloads).await {
        StreamSource::Completed { path, size } => {
            serve_completed(&state, path, size, &headers, &method).await
        }
        StreamSource::Active {
            session,
            file_index,
        } => serve_active(&state, session, file_index, &headers, &method).await,
        StreamSource::Missing => {
            start_and_serve(&state, &record, query.episode, &headers, &method).await
        }
    }
}

/// No finished file and no live session. For a record that never ran to
/// a terminal state (fresh add whose start failed, or one orphaned by a
/// crash) the stream request itself kicks the download off and gates on
/// readiness like any other active stream.
async fn start_and_serve(
    state: &AppState,
    record: &MediaRecord,
    episode_id: Option<Uuid>,
    headers: &HeaderMap,
    method: &Method,
) -> Response<Body> {
    if record.status == MediaStatus::Error {
        let reason = record
            .last_error
            .clone()
            .unwrap_or_else(|| "Download failed".to_string());
        return error_response(StatusCode::SERVICE_UNAVAILABLE, reason);
    }
    if !record.status.is_interrupted() {
        return error_response(StatusCode::NOT_FOUND, "No playable data for this media");
    }

    let target = match episode_id {
        Some(episode_id) => {
            // Presence was validated against the record already
            let Some(episode) = record.episode(episode_id) else {
                return error_response(StatusCode::NOT_FOUND, "Episode not found");
            };
            DownloadTarget {
                file_index: Some(episode.file_index),
                episode_id: Some(episode_id),
            }
        }
        None => DownloadTarget::default(),
    };

    match state
        .downloads
        .start_download(record.id, &record.source_ref, target)
        .await
    {
        Ok(session) => serve_active(state, session, target.file_index, headers, method).await,
        Err(e) => {
            warn!("Could not start download for {}: {e}", record.id);
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                SpindriftError::from(e).user_message(),
            )
        }
    }
}

/// Serves a finished file from disk.
async fn serve_completed(
    state: &AppState,
    path: PathBuf,
    size: u64,
    headers: &HeaderMap,
    method: &Method,
) -> Response<Body> {
    let cache_control = format!(
        "public, max-age={}",
        state.config.streaming.complete_cache_max_age.as_secs()
    );
    let chunk_size = state.config.streaming.read_chunk_size;

    if transmux::needs_transmux(&path) {
        if method == Method::HEAD {
            return transmux_head(&cache_control);
        }

        let full = ByteRange {
            start: 0,
            end: size.saturating_sub(1),
        };
        let input = match stream::file_byte_stream(&path, full, chunk_size).await {
            Ok(input) => input.boxed(),
            Err(e) => {
                error!("Cannot open {} for remux: {e}", path.display());
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "File system error occurred",
                );
            }
        };
        return spawn_transmux(state, input, &cache_control);
    }

    let content_type = transmux::content_type_for(&path);
    let range = match resolve_range(range_header(headers), size) {
        Ok(range) => range,
        Err(_) => return range_not_satisfiable(size),
    };

    let (status, start, end) = match range {
        Some(range) => (StatusCode::PARTIAL_CONTENT, range.start, range.end),
        None => (StatusCode::OK, 0, size.saturating_sub(1)),
    };
    let resolved = ByteRange { start, end };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, &cache_control)
        .header(header::CONTENT_LENGTH, resolved.len());
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", resolved.start, resolved.end, size),
        );
    }

    if method == Method::HEAD {
        return builder.body(Body::empty()).unwrap();
    }

    match stream::file_byte_stream(&path, resolved, chunk_size).await {
        Ok(body) => builder.body(Body::from_stream(body)).unwrap(),
        Err(e) => {
            error!("Cannot open {}: {e}", path.display());
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "File system error occurred",
            )
        }
    }
}

/// Serves bytes straight out of a live download session.
async fn serve_active(
    state: &AppState,
    session: Arc<DownloadSession>,
    file_index: Option<usize>,
    headers: &HeaderMap,
    method: &Method,
) -> Response<Body> {
    let (index, length) = match state.gate.wait_for_playback(&session, file_index).await {
        ReadinessOutcome::Ready { index, length } => (index, length),
        ReadinessOutcome::Initializing => {
            return not_ready_response(serde_json::json!({ "state": "initializing" }));
        }
        ReadinessOutcome::Buffering { available, needed } => {
            return not_ready_response(serde_json::json!({
                "state": "buffering",
                "availableBytes": available,
                "neededBytes": needed,
            }));
        }
        ReadinessOutcome::Failed(reason) => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, reason);
        }
    };

    let name = session
        .metadata()
        .and_then(|m| m.files.get(index).map(|f| f.name.clone()))
        .unwrap_or_default();
    let chunk_size = state.config.streaming.read_chunk_size;
    let stall_timeout = state.config.streaming.read_stall_timeout;

    // A session lingering after completion serves final bytes; those are
    // as cacheable as the on-disk file. Anything still downloading is not.
    let cache_control = if session.phase() == SessionPhase::Complete {
        format!(
            "public, max-age={}",
            state.config.streaming.complete_cache_max_age.as_secs()
        )
    } else {
        STREAMING_CACHE_CONTROL.to_string()
    };

    debug!("Streaming \"{name}\" from live session ({length} bytes)");

    if transmux::needs_transmux(FsPath::new(&name)) {
        if method == Method::HEAD {
            return transmux_head(&cache_control);
        }

        let full = ByteRange {
            start: 0,
            end: length.saturating_sub(1),
        };
        let input =
            stream::session_byte_stream(session, index, full, chunk_size, stall_timeout).boxed();
        return spawn_transmux(state, input, &cache_control);
    }

    let content_type = transmux::content_type_for(FsPath::new(&name));
    let range = match resolve_range(range_header(headers), length) {
        Ok(range) => range,
        Err(_) => return range_not_satisfiable(length),
    };

    let (status, start, end) = match range {
        Some(range) => (StatusCode::PARTIAL_CONTENT, range.start, range.end),
        None => (StatusCode::OK, 0, length.saturating_sub(1)),
    };
    let resolved = ByteRange { start, end };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, &cache_control)
        .header(header::CONTENT_LENGTH, resolved.len());
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", resolved.start, resolved.end, length),
        );
    }

    if method == Method::HEAD {
        return builder.body(Body::empty()).unwrap();
    }

    let body = stream::session_byte_stream(session, index, resolved, chunk_size, stall_timeout);
    builder.body(Body::from_stream(body)).unwrap()
}

fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::RANGE).and_then(|v| v.to_str().ok())
}

fn range_not_satisfiable(size: u64) -> Response<Body> {
    Response::builder()
        .status(StatusCode::RANGE_NOT_SATISFIABLE)
        .header(header::CONTENT_RANGE, format!("bytes */{size}"))
        .body(Body::empty())
        .unwrap()
}

/// 202 with a retry hint: the download exists but playback cannot start
/// yet. Players poll rather than hang on a stalled response.
fn not_ready_response(body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::RETRY_AFTER, RETRY_AFTER_SECONDS)
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Headers for remuxed output: no length, no ranges. The fragmented
/// container is produced as it streams, so neither is knowable. The body
/// is a stream with no size hint so no Content-Length gets implied.
fn transmux_head(cache_control: &str) -> Response<Body> {
    let body = Body::from_stream(futures::stream::empty::<Result<bytes::Bytes, std::io::Error>>());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, FRAGMENTED_OUTPUT_CONTENT_TYPE)
        .header(header::ACCEPT_RANGES, "none")
        .header(header::CACHE_CONTROL, cache_control)
        .body(body)
        .unwrap()
}

fn spawn_transmux<S, E>(state: &AppState, input: S, cache_control: &str) -> Response<Body>
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    match state.transmux.spawn(input) {
        Ok(output) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, FRAGMENTED_OUTPUT_CONTENT_TYPE)
            .header(header::ACCEPT_RANGES, "none")
            .header(header::CACHE_CONTROL, cache_control)
            .body(Body::from_stream(output))
            .unwrap(),
        Err(e) => {
            error!("Failed to start remux pipeline: {e}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Playback preparation failed",
            )
        }
    }
}
