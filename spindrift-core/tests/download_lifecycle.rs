//! End-to-end download lifecycle against the simulated fetch engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use spindrift_core::config::SpindriftConfig;
use spindrift_core::engine::{SimulatedFetchEngine, SimulatedSource};
use spindrift_core::media::{MediaKind, MediaRecord, MediaStatus};
use spindrift_core::recovery::recover_interrupted;
use spindrift_core::session::{DownloadManager, DownloadTarget};
use spindrift_core::store::{JsonSessionStore, SessionStore};
use spindrift_core::{ContentHash, MediaId};

struct Harness {
    manager: DownloadManager,
    store: Arc<dyn SessionStore>,
    engine: Arc<SimulatedFetchEngine>,
    config: SpindriftConfig,
}

async fn harness(root: &std::path::Path, engine: SimulatedFetchEngine) -> Harness {
    let mut config = SpindriftConfig::for_testing();
    config.download.download_dir = root.join("downloads");
    config.store.store_dir = root.join("store");

    let store: Arc<dyn SessionStore> =
        Arc::new(JsonSessionStore::open(config.store.clone()).await.unwrap());
    let engine = Arc::new(engine);
    let manager = DownloadManager::new(engine.clone(), store.clone(), config.download.clone());

    Harness {
        manager,
        store,
        engine,
        config,
    }
}

fn magnet_for(byte: u8) -> (String, ContentHash) {
    let hex_hash = hex::encode([byte; 20]);
    let magnet = format!(
        "magnet:?xt=urn:btih:{hex_hash}&dn=Feature&tr=http%3A%2F%2Ftracker.example%2Fannounce"
    );
    (magnet, ContentHash::from_hex(&hex_hash).unwrap())
}

async fn insert_movie(store: &Arc<dyn SessionStore>, magnet: &str) -> MediaId {
    let record = MediaRecord::new(MediaKind::Movie, "Feature", magnet);
    let id = record.id;
    store.insert(record).await.unwrap();
    id
}

async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn download_runs_to_durable_completion() {
    let root = tempfile::tempdir().unwrap();
    let h = harness(
        root.path(),
        SimulatedFetchEngine::new().with_rate(64 * 1024, Duration::from_millis(1)),
    )
    .await;

    let (magnet, _) = magnet_for(0x01);
    let media_id = insert_movie(&h.store, &magnet).await;

    h.manager
        .start_download(media_id, &magnet, DownloadTarget::default())
        .await
        .unwrap();

    let store = h.store.clone();
    let completed = wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            store
                .get(media_id)
                .await
                .unwrap()
                .is_some_and(|r| r.status == MediaStatus::Complete)
        }
    })
    .await;
    assert!(completed, "download never reached complete status");

    let record = h.store.get(media_id).await.unwrap().unwrap();
    assert_eq!(record.progress, 1.0);
    let path = record.file_path.expect("file path recorded");
    let on_disk = tokio::fs::metadata(&path).await.unwrap();
    assert_eq!(Some(on_disk.len()), record.file_size);

    // After the grace window the session is released
    let manager = &h.manager;
    let released = wait_until(Duration::from_secs(5), || async {
        !manager.is_download_active(media_id).await
    })
    .await;
    assert!(released);
}

#[tokio::test]
async fn progress_is_monotonic_while_downloading() {
    let root = tempfile::tempdir().unwrap();
    let h = harness(
        root.path(),
        SimulatedFetchEngine::new().with_rate(8 * 1024, Duration::from_millis(5)),
    )
    .await;

    let (magnet, hash) = magnet_for(0x02);
    h.engine.register_source(
        hash,
        SimulatedSource::single_file("movie.mp4", vec![3u8; 512 * 1024]),
    );
    let media_id = insert_movie(&h.store, &magnet).await;

    h.manager
        .start_download(media_id, &magnet, DownloadTarget::default())
        .await
        .unwrap();

    let mut last = 0.0f64;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let record = h.store.get(media_id).await.unwrap().unwrap();
        assert!(
            record.progress >= last,
            "progress moved backwards: {} -> {}",
            last,
            record.progress
        );
        last = record.progress;
        if record.status == MediaStatus::Complete {
            break;
        }
    }
    assert!(last > 0.0, "progress never advanced");
}

#[tokio::test]
async fn delete_removes_partial_data() {
    let root = tempfile::tempdir().unwrap();
    let h = harness(
        root.path(),
        SimulatedFetchEngine::new().with_rate(1024, Duration::from_millis(5)),
    )
    .await;

    let (magnet, hash) = magnet_for(0x03);
    h.engine.register_source(
        hash,
        SimulatedSource::single_file("big.mp4", vec![1u8; 4 * 1024 * 1024]),
    );
    let media_id = insert_movie(&h.store, &magnet).await;

    h.manager
        .start_download(media_id, &magnet, DownloadTarget::default())
        .await
        .unwrap();

    // Let the transfer land some bytes first
    let store = h.store.clone();
    wait_until(Duration::from_secs(5), || {
        let store = store.clone();
        async move {
            store
                .get(media_id)
                .await
                .unwrap()
                .is_some_and(|r| r.file_path.is_some())
        }
    })
    .await;

    let partial = h
        .store
        .get(media_id)
        .await
        .unwrap()
        .unwrap()
        .file_path
        .unwrap();

    h.manager.delete_media(media_id).await.unwrap();

    assert!(!h.manager.is_download_active(media_id).await);
    assert!(h.store.get(media_id).await.unwrap().is_none());
    assert!(tokio::fs::metadata(&partial).await.is_err());
    let hash_dir = h.config.download.download_dir.join(hash.to_string());
    assert!(tokio::fs::metadata(&hash_dir).await.is_err());
}

#[tokio::test]
async fn engine_failure_is_durable_and_retryable() {
    let root = tempfile::tempdir().unwrap();
    let h = harness(
        root.path(),
        SimulatedFetchEngine::new().with_rate(16 * 1024, Duration::from_millis(1)),
    )
    .await;

    let (magnet, hash) = magnet_for(0x04);
    h.engine.register_source(
        hash,
        SimulatedSource::single_file("movie.mp4", vec![7u8; 256 * 1024]),
    );
    h.engine
        .inject_transfer_failure(hash, 32 * 1024, "swarm dried up");
    let media_id = insert_movie(&h.store, &magnet).await;

    h.manager
        .start_download(media_id, &magnet, DownloadTarget::default())
        .await
        .unwrap();

    let store = h.store.clone();
    let errored = wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            store
                .get(media_id)
                .await
                .unwrap()
                .is_some_and(|r| r.status == MediaStatus::Error)
        }
    })
    .await;
    assert!(errored, "failure never persisted");

    let record = h.store.get(media_id).await.unwrap().unwrap();
    assert!(record.last_error.unwrap().contains("swarm dried up"));
    assert!(!h.manager.is_download_active(media_id).await);

    // Retry succeeds once the underlying fault is gone
    h.engine.clear_failures(hash);
    h.manager.retry(media_id).await.unwrap();

    let store = h.store.clone();
    let completed = wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            store
                .get(media_id)
                .await
                .unwrap()
                .is_some_and(|r| r.status == MediaStatus::Complete)
        }
    })
    .await;
    assert!(completed, "retry never completed");
}

#[tokio::test]
async fn restart_resumes_interrupted_download() {
    let root = tempfile::tempdir().unwrap();
    let (magnet, _) = magnet_for(0x05);

    let media_id = {
        let h = harness(
            root.path(),
            SimulatedFetchEngine::new().with_rate(1, Duration::from_secs(10)),
        )
        .await;
        let media_id = insert_movie(&h.store, &magnet).await;
        h.manager
            .start_download(media_id, &magnet, DownloadTarget::default())
            .await
            .unwrap();

        // Wait until the downloading status is durable, then "crash"
        let store = h.store.clone();
        wait_until(Duration::from_secs(5), || {
            let store = store.clone();
            async move {
                store
                    .get(media_id)
                    .await
                    .unwrap()
                    .is_some_and(|r| r.status == MediaStatus::Downloading)
            }
        })
        .await;
        media_id
    };

    // Fresh process: new store, new manager, fast engine
    let h = harness(
        root.path(),
        SimulatedFetchEngine::new().with_rate(64 * 1024, Duration::from_millis(1)),
    )
    .await;

    let record = h.store.get(media_id).await.unwrap().unwrap();
    assert_eq!(record.status, MediaStatus::Downloading);

    let report = recover_interrupted(&h.store, &h.manager).await.unwrap();
    assert_eq!(report.resumed, 1);

    let store = h.store.clone();
    let completed = wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            store
                .get(media_id)
                .await
                .unwrap()
                .is_some_and(|r| r.status == MediaStatus::Complete)
        }
    })
    .await;
    assert!(completed, "resumed download never completed");
}
