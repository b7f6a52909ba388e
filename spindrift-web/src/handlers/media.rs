//! Media management endpoints: add, list, inspect, retry, delete.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use spindrift_core::SpindriftError;
use spindrift_core::magnet::MagnetLink;
use spindrift_core::media::{EpisodeRecord, MediaId, MediaKind, MediaRecord};
use spindrift_core::session::{DownloadStatus, DownloadTarget, SessionError};
use tracing::{error, info, warn};

use super::error_response;
use crate::server::AppState;

/// Request body for `POST /media`.
#[derive(Debug, Deserialize)]
pub struct AddMediaRequest {
    pub magnet: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: Option<MediaKind>,
    #[serde(default)]
    pub episodes: Vec<EpisodeSpec>,
}

#[derive(Debug, Deserialize)]
pub struct EpisodeSpec {
    pub season: u32,
    pub episode: u32,
    pub file_index: usize,
}

/// Durable record merged with live session state, as the API reports it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaView {
    pub id: MediaId,
    pub kind: MediaKind,
    pub title: String,
    pub status: String,
    pub progress: f64,
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub episodes: Vec<EpisodeRecord>,
    pub added_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadStatus>,
}

fn media_view(record: MediaRecord, download: Option<DownloadStatus>) -> MediaView {
    MediaView {
        id: record.id,
        kind: record.kind,
        title: record.title,
        status: record.status.to_string(),
        progress: record.progress,
        file_size: record.file_size,
        error: record.last_error,
        episodes: record.episodes,
        added_at: record.added_at,
        download,
    }
}

fn parse_media_id(raw: &str) -> Result<MediaId, Response<Body>> {
    raw.parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid media id"))
}

/// Adds a media item and starts its download immediately.
///
/// The record is created even when the engine rejects the source; the
/// rejection lands as a durable `error` status and shows up in the
/// response, so clients always get the record they created.
pub async fn add_media(
    State(state): State<AppState>,
    Json(request): Json<AddMediaRequest>,
) -> Response<Body> {
    let magnet = match MagnetLink::parse(&request.magnet) {
        Ok(magnet) => magnet,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let kind = request.kind.unwrap_or(if request.episodes.is_empty() {
        MediaKind::Movie
    } else {
        MediaKind::Show
    });
    let title = request
        .title
        .unwrap_or_else(|| magnet.name_or_fallback());

    let mut record = MediaRecord::new(kind, title, magnet.raw());
    for spec in &request.episodes {
        record
            .episodes
            .push(EpisodeRecord::new(spec.season, spec.episode, spec.file_index));
    }

    let media_id = record.id;
    let target = record
        .episodes
        .first()
        .map(|ep| DownloadTarget {
            file_index: Some(ep.file_index),
            episode_id: Some(ep.id),
        })
        .unwrap_or_default();

    if let Err(e) = state.store.insert(record).await {
        error!("Failed to persist new media: {e}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error occurred");
    }

    if let Err(e) = state
        .downloads
        .start_download(media_id, magnet.raw(), target)
        .await
    {
        warn!("Download start failed for {media_id}: {e}");
    } else {
        info!("Added media {media_id} ({})", magnet.content_hash);
    }

    match state.store.get(media_id).await {
        Ok(Some(record)) => {
            let download = state.downloads.download_status(media_id).await;
            (StatusCode::CREATED, Json(media_view(record, download))).into_response()
        }
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error occurred"),
    }
}

pub async fn list_media(State(state): State<AppState>) -> Response<Body> {
    let records = match state.store.all().await {
        Ok(records) => records,
        Err(e) => {
            error!("Failed to list media: {e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error occurred");
        }
    };

    let mut views = Vec::with_capacity(records.len());
    for record in records {
        let download = state.downloads.download_status(record.id).await;
        views.push(media_view(record, download));
    }
    views.sort_by(|a, b| b.added_at.cmp(&a.added_at));

    Json(views).into_response()
}

pub async fn get_media(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
) -> Response<Body> {
    let media_id = match parse_media_id(&media_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.store.get(media_id).await {
        Ok(Some(record)) => {
            let download = state.downloads.download_status(media_id).await;
            Json(media_view(record, download)).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Media not found"),
        Err(e) => {
            error!("Failed to load media {media_id}: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error occurred")
        }
    }
}

/// Cancels the download and removes the record plus downloaded data.
pub async fn delete_media(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
) -> Response<Body> {
    let media_id = match parse_media_id(&media_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.downloads.delete_media(media_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(SessionError::MediaNotFound { .. }) => {
            error_response(StatusCode::NOT_FOUND, "Media not found")
        }
        Err(e) => {
            error!("Failed to delete media {media_id}: {e}");
            let message = SpindriftError::from(e).user_message();
            error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    }
}

/// Resets an errored download and starts it over.
pub async fn retry_download(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
) -> Response<Body> {
    let media_id = match parse_media_id(&media_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.downloads.retry(media_id).await {
        Ok(session) => Json(session.status_snapshot()).into_response(),
        Err(SessionError::MediaNotFound { .. }) => {
            error_response(StatusCode::NOT_FOUND, "Media not found")
        }
        Err(e) => {
            warn!("Retry failed for {media_id}: {e}");
            let message = SpindriftError::from(e).user_message();
            error_response(StatusCode::SERVICE_UNAVAILABLE, message)
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Response<Body> {
    Json(serde_json::json!({
        "status": "ok",
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "activeSessions": state.downloads.active_session_count().await,
    }))
    .into_response()
}
