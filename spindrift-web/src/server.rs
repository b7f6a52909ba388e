//! Axum server wiring.
//!
//! Builds the router over a shared [`AppState`] and runs the crash
//! recovery scan before accepting traffic, so interrupted downloads are
//! already resuming when the first request lands.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};
use spindrift_core::config::SpindriftConfig;
use spindrift_core::engine::FetchEngine;
use spindrift_core::readiness::ReadinessGate;
use spindrift_core::recovery::recover_interrupted;
use spindrift_core::session::DownloadManager;
use spindrift_core::store::{JsonSessionStore, SessionStore};
use spindrift_core::transmux::TransmuxPipeline;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::handlers::{
    add_media, delete_media, get_media, health, list_media, progress_stream, retry_download,
    stream_media,
};

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub downloads: Arc<DownloadManager>,
    pub gate: Arc<ReadinessGate>,
    pub transmux: Arc<TransmuxPipeline>,
    pub config: SpindriftConfig,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: SpindriftConfig,
        engine: Arc<dyn FetchEngine>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let downloads = Arc::new(DownloadManager::new(
            engine,
            store.clone(),
            config.download.clone(),
        ));
        let gate = Arc::new(ReadinessGate::new(config.streaming.clone()));
        let transmux = Arc::new(TransmuxPipeline::new(config.transmux.clone()));

        Self {
            store,
            downloads,
            gate,
            transmux,
            config,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/media", post(add_media).get(list_media))
        .route("/media/{media_id}", get(get_media).delete(delete_media))
        .route("/download/{media_id}/retry", post(retry_download))
        .route("/stream/{media_id}", get(stream_media))
        .route("/progress/{media_id}/stream", get(progress_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs the server until the listener fails or the process is stopped.
///
/// # Errors
/// Returns an error when the store cannot be opened or the address
/// cannot be bound.
pub async fn run_server(
    addr: SocketAddr,
    config: SpindriftConfig,
    engine: Arc<dyn FetchEngine>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn SessionStore> =
        Arc::new(JsonSessionStore::open(config.store.clone()).await?);
    let state = AppState::new(config, engine, store);

    let report = recover_interrupted(&state.store, &state.downloads).await?;
    if report.resumed > 0 || report.failed > 0 {
        info!(
            "Startup recovery: {} resumed, {} failed",
            report.resumed, report.failed
        );
    }

    let app = router(state);
    info!("Spindrift listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
