//! Server-sent progress events.
//!
//! One connection per media item. The first event fires immediately so
//! clients render without waiting a full interval; after the download
//! reaches a terminal state the matching `complete`/`error` event is
//! sent and the connection closes after a short grace.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Response, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use spindrift_core::media::MediaId;
use spindrift_core::session::DownloadStatus;
use tracing::debug;

use super::error_response;
use crate::server::AppState;

pub async fn progress_stream(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, Response<Body>> {
    let media_id = media_id
        .parse::<MediaId>()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid media id"))?;

    let known = matches!(state.store.get(media_id).await, Ok(Some(_)));
    if !known {
        return Err(error_response(StatusCode::NOT_FOUND, "Media not found"));
    }

    debug!("Progress stream opened for {media_id}");

    let stream = futures::stream::unfold(
        ProgressFeed {
            state,
            media_id,
            first: true,
            finished: false,
        },
        |mut feed| async move {
            if feed.finished {
                // Give the client time to read the terminal event
                tokio::time::sleep(feed.state.config.broadcast.completion_grace).await;
                debug!("Progress stream closed for {}", feed.media_id);
                return None;
            }

            if !feed.first {
                tokio::time::sleep(feed.state.config.broadcast.interval).await;
            }
            feed.first = false;

            let snapshot = snapshot_for(&feed.state, feed.media_id).await?;
            let terminal = matches!(snapshot.status, "complete" | "error");
            if terminal {
                feed.finished = true;
            }

            let name = if terminal { snapshot.status } else { "progress" };
            let event = Event::default().event(name).json_data(&snapshot);
            Some((event, feed))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

struct ProgressFeed {
    state: AppState,
    media_id: MediaId,
    first: bool,
    finished: bool,
}

/// Live session snapshot when one exists, durable record otherwise.
///
/// Returns `None` only when the record was deleted mid-stream, which
/// ends the event stream.
async fn snapshot_for(state: &AppState, media_id: MediaId) -> Option<DownloadStatus> {
    if let Some(status) = state.downloads.download_status(media_id).await {
        return Some(status);
    }

    let record = state.store.get(media_id).await.ok().flatten()?;
    Some(DownloadStatus {
        status: record.status.as_str(),
        progress: record.progress,
        download_speed: 0.0,
        upload_speed: 0.0,
        peers: 0,
        total_size: record.file_size,
        error: record.last_error,
    })
}
