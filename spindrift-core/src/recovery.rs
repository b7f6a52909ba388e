//! Crash recovery.
//!
//! On startup, every durable record stuck in a pre-complete status gets
//! its download restarted. The fetch engine rechecks data already on
//! disk, so a resumed transfer continues from wherever the crash left
//! it. Recovery is best-effort per record: one unresumable item is
//! marked errored and the scan moves on.

use std::sync::Arc;

use tracing::{info, warn};

use crate::session::{DownloadManager, DownloadTarget};
use crate::store::{SessionStore, StoreError};

/// Outcome of one recovery scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub resumed: usize,
    pub failed: usize,
}

/// Restarts downloads for all interrupted records.
///
/// # Errors
/// - `StoreError` - The record scan itself fails; per-record resume
///   failures are absorbed into the report instead
pub async fn recover_interrupted(
    store: &Arc<dyn SessionStore>,
    manager: &DownloadManager,
) -> Result<RecoveryReport, StoreError> {
    let records = store.all().await?;
    let mut report = RecoveryReport {
        scanned: records.len(),
        ..Default::default()
    };

    for record in records {
        if !record.status.is_interrupted() {
            continue;
        }

        let target = record
            .episodes
            .first()
            .map(|ep| DownloadTarget {
                file_index: Some(ep.file_index),
                episode_id: Some(ep.id),
            })
            .unwrap_or_default();

        match manager
            .start_download(record.id, &record.source_ref, target)
            .await
        {
            Ok(_) => {
                info!("Resumed interrupted download for \"{}\"", record.title);
                report.resumed += 1;
            }
            Err(e) => {
                warn!("Could not resume \"{}\": {e}", record.title);
                report.failed += 1;
                if let Err(store_err) = store
                    .set_error(record.id, format!("recovery failed: {e}"))
                    .await
                {
                    warn!("Failed to persist recovery error: {store_err}");
                }
            }
        }
    }

    info!(
        "Recovery scan: {} records, {} resumed, {} failed",
        report.scanned, report.resumed, report.failed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpindriftConfig;
    use crate::engine::SimulatedFetchEngine;
    use crate::media::{MediaKind, MediaRecord, MediaStatus};
    use crate::store::JsonSessionStore;
    use std::time::Duration;

    fn magnet_for(byte: u8) -> String {
        format!(
            "magnet:?xt=urn:btih:{}&tr=http%3A%2F%2Ft.example%2Fa",
            hex::encode([byte; 20])
        )
    }

    #[tokio::test]
    async fn test_resumes_only_interrupted_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SpindriftConfig::for_testing();
        config.download.download_dir = dir.path().join("downloads");
        config.store.store_dir = dir.path().join("store");

        let store: Arc<dyn SessionStore> =
            Arc::new(JsonSessionStore::open(config.store.clone()).await.unwrap());
        let engine = Arc::new(
            SimulatedFetchEngine::new().with_rate(1024, Duration::from_millis(10)),
        );
        let manager = DownloadManager::new(engine, store.clone(), config.download);

        let mut downloading = MediaRecord::new(MediaKind::Movie, "Mid", magnet_for(0x31));
        downloading.status = MediaStatus::Downloading;
        downloading.progress = 0.4;

        let mut complete = MediaRecord::new(MediaKind::Movie, "Done", magnet_for(0x32));
        complete.status = MediaStatus::Complete;

        let mut errored = MediaRecord::new(MediaKind::Movie, "Bad", magnet_for(0x33));
        errored.status = MediaStatus::Error;

        let downloading_id = downloading.id;
        store.insert(downloading).await.unwrap();
        store.insert(complete).await.unwrap();
        store.insert(errored).await.unwrap();

        let report = recover_interrupted(&store, &manager).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.resumed, 1);
        assert_eq!(report.failed, 0);
        assert!(manager.is_download_active(downloading_id).await);
        assert_eq!(manager.active_session_count().await, 1);
    }

    #[tokio::test]
    async fn test_unresumable_record_becomes_errored() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SpindriftConfig::for_testing();
        config.download.download_dir = dir.path().join("downloads");
        config.store.store_dir = dir.path().join("store");

        let store: Arc<dyn SessionStore> =
            Arc::new(JsonSessionStore::open(config.store.clone()).await.unwrap());
        let engine = Arc::new(SimulatedFetchEngine::new());
        let manager = DownloadManager::new(engine, store.clone(), config.download);

        let mut broken = MediaRecord::new(MediaKind::Movie, "Broken", "not a magnet link");
        broken.status = MediaStatus::Added;
        let broken_id = broken.id;
        store.insert(broken).await.unwrap();

        let report = recover_interrupted(&store, &manager).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.resumed, 0);

        let record = store.get(broken_id).await.unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Error);
        assert!(record.last_error.unwrap().contains("recovery failed"));
    }
}
