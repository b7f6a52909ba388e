//! CLI command implementations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use spindrift_core::config::SpindriftConfig;
use spindrift_core::engine::{SimulatedFetchEngine, SimulatedSource};
use spindrift_core::magnet::MagnetLink;
use spindrift_core::media::{ContentHash, MediaKind, MediaRecord};
use spindrift_core::store::{JsonSessionStore, SessionStore};
use spindrift_core::transmux;
use spindrift_web::run_server;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the streaming server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to bind to
        #[arg(short, long, default_value = "3000")]
        port: u16,
        /// Directory for in-progress and completed downloads
        #[arg(long)]
        download_dir: Option<PathBuf>,
        /// Directory for durable media records
        #[arg(long)]
        store_dir: Option<PathBuf>,
        /// ffmpeg binary used for on-the-fly remuxing
        #[arg(long)]
        ffmpeg: Option<PathBuf>,
        /// Seed local video files into the fetch engine and print their
        /// magnet links
        #[arg(long)]
        seed_dir: Option<PathBuf>,
    },
    /// Add a media item; it starts downloading when the server runs
    Add {
        /// Magnet link for the media
        magnet: String,
        /// Display title (defaults to the magnet's name)
        #[arg(short, long)]
        title: Option<String>,
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },
    /// List known media records
    List {
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            host,
            port,
            download_dir,
            store_dir,
            ffmpeg,
            seed_dir,
        } => serve(host, port, download_dir, store_dir, ffmpeg, seed_dir).await,
        Commands::Add {
            magnet,
            title,
            store_dir,
        } => add_media(magnet, title, store_dir).await,
        Commands::List { store_dir } => list_media(store_dir).await,
    }
}

async fn serve(
    host: String,
    port: u16,
    download_dir: Option<PathBuf>,
    store_dir: Option<PathBuf>,
    ffmpeg: Option<PathBuf>,
    seed_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = SpindriftConfig::from_env();
    if let Some(dir) = download_dir {
        config.download.download_dir = dir;
    }
    if let Some(dir) = store_dir {
        config.store.store_dir = dir;
    }
    if let Some(path) = ffmpeg {
        config.transmux.ffmpeg_path = path;
    }

    let engine = Arc::new(SimulatedFetchEngine::new());
    if let Some(dir) = seed_dir {
        let count = seed_local_files(&engine, &dir).await?;
        println!("Seeded {count} local files from {}", dir.display());
    }

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid bind address")?;

    println!("Spindrift streaming server");
    println!("  URL: http://{addr}");
    println!("  Downloads: {}", config.download.download_dir.display());
    println!("  Store: {}", config.store.store_dir.display());
    println!();
    println!("Press Ctrl+C to stop the server");

    run_server(addr, config, engine)
        .await
        .map_err(|e| anyhow::anyhow!("server failed: {e}"))
}

/// Registers every video file in a directory with the fetch engine and
/// prints a magnet link for each, so the full watch-while-downloading
/// path can be exercised against local content.
async fn seed_local_files(
    engine: &SimulatedFetchEngine,
    dir: &Path,
) -> anyhow::Result<usize> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("cannot read seed directory {}", dir.display()))?;

    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        if !transmux::is_video_file(&name) {
            continue;
        }

        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let hash = ContentHash::of_bytes(name.as_bytes());
        engine.register_source(hash, SimulatedSource::single_file(name.clone(), content));

        println!(
            "  {name}\n    magnet:?xt=urn:btih:{hash}&dn={}&tr=http%3A%2F%2Flocal.seed%2Fannounce",
            urlencoding::encode(&name)
        );
        count += 1;
    }

    Ok(count)
}

async fn add_media(
    magnet: String,
    title: Option<String>,
    store_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = SpindriftConfig::from_env();
    if let Some(dir) = store_dir {
        config.store.store_dir = dir;
    }

    let link = MagnetLink::parse(&magnet).context("invalid magnet link")?;
    let title = title.unwrap_or_else(|| link.name_or_fallback());

    let store = JsonSessionStore::open(config.store).await?;
    let record = MediaRecord::new(MediaKind::Movie, title, link.raw());
    println!("Added \"{}\" ({})", record.title, record.id);
    println!("  Download starts when the server is running.");
    store.insert(record).await?;

    Ok(())
}

async fn list_media(store_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = SpindriftConfig::from_env();
    if let Some(dir) = store_dir {
        config.store.store_dir = dir;
    }

    let store = JsonSessionStore::open(config.store).await?;
    let mut records = store.all().await?;
    records.sort_by(|a, b| a.added_at.cmp(&b.added_at));

    if records.is_empty() {
        println!("No media added yet.");
        println!("Use 'spindrift add <magnet-link>' to add one.");
        return Ok(());
    }

    println!("{:<38} {:<12} {:>8}  Title", "ID", "Status", "Progress");
    println!("{:-<80}", "");
    for record in records {
        println!(
            "{:<38} {:<12} {:>7.1}%  {}",
            record.id,
            record.status.to_string(),
            record.progress * 100.0,
            record.title
        );
        if let Some(error) = record.last_error {
            println!("{:>52}  {error}", "error:");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_then_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let magnet = format!(
            "magnet:?xt=urn:btih:{}&dn=Sintel&tr=http%3A%2F%2Ft.example%2Fa",
            "ab".repeat(20)
        );

        add_media(magnet, None, Some(dir.path().to_path_buf()))
            .await
            .unwrap();
        list_media(Some(dir.path().to_path_buf())).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_rejects_bad_magnet() {
        let dir = tempfile::tempdir().unwrap();
        let result = add_media(
            "http://example.com".to_string(),
            None,
            Some(dir.path().to_path_buf()),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_seed_dir_registers_video_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("clip.mp4"), vec![1u8; 1024])
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"not a video")
            .await
            .unwrap();

        let engine = SimulatedFetchEngine::new();
        let count = seed_local_files(&engine, dir.path()).await.unwrap();
        assert_eq!(count, 1);
    }
}
