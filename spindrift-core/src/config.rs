//! Centralized configuration for Spindrift.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Spindrift components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SpindriftConfig {
    pub download: DownloadConfig,
    pub streaming: StreamingConfig,
    pub transmux: TransmuxConfig,
    pub broadcast: BroadcastConfig,
    pub store: StoreConfig,
}

/// Download session manager configuration.
///
/// Controls where transfers land on disk and how often session state
/// is sampled back into the durable store.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Root directory for in-progress and completed transfers
    pub download_dir: PathBuf,
    /// Interval between progress/speed samples for an active session
    pub progress_tick: Duration,
    /// Trailing window for download/upload speed averaging
    pub speed_window: Duration,
    /// How long a completed session stays attached for late readers
    pub completion_grace: Duration,
    /// Maximum wait for first usable source metadata
    pub metadata_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: std::env::temp_dir().join("spindrift/downloads"),
            progress_tick: Duration::from_millis(500),
            speed_window: Duration::from_secs(5),
            completion_grace: Duration::from_secs(30),
            metadata_timeout: Duration::from_secs(90),
        }
    }
}

/// Streaming delivery configuration.
///
/// Controls the readiness gate and byte-range read behavior against
/// partially downloaded files.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Maximum wait before a stream request reports not-ready
    pub readiness_timeout: Duration,
    /// Poll interval inside the readiness gate
    pub readiness_poll: Duration,
    /// Leading bytes of the selected file required before playback starts
    pub playback_head_bytes: u64,
    /// Chunk size for range reads served from an active session
    pub read_chunk_size: usize,
    /// Bounded wait for data past the downloaded frontier mid-stream
    pub read_stall_timeout: Duration,
    /// Cache lifetime for responses backed by final data
    pub complete_cache_max_age: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(10),
            readiness_poll: Duration::from_millis(200),
            playback_head_bytes: 2 * 1024 * 1024, // 2 MiB
            read_chunk_size: 256 * 1024,          // 256 KiB
            read_stall_timeout: Duration::from_secs(30),
            complete_cache_max_age: Duration::from_secs(3600),
        }
    }
}

/// Transmux pipeline configuration.
///
/// Controls the ffmpeg child process used to repackage containers
/// browsers cannot play natively.
#[derive(Debug, Clone)]
pub struct TransmuxConfig {
    /// ffmpeg binary path
    pub ffmpeg_path: PathBuf,
    /// Fixed audio bitrate for the single browser-safe audio conversion
    pub audio_bitrate_kbps: u32,
    /// Read size for draining ffmpeg stdout
    pub output_chunk_size: usize,
}

impl Default for TransmuxConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            audio_bitrate_kbps: 128,
            output_chunk_size: 64 * 1024, // 64 KiB
        }
    }
}

/// Progress broadcaster configuration.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Interval between progress events on an open connection
    pub interval: Duration,
    /// Delay after the final `complete` event before closing
    pub completion_grace: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            completion_grace: Duration::from_millis(250),
        }
    }
}

/// Durable session store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding one JSON document per media record
    pub store_dir: PathBuf,
    /// Suffix for in-flight writes, renamed into place on success
    pub temp_file_suffix: &'static str,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_dir: std::env::temp_dir().join("spindrift/store"),
            temp_file_suffix: ".tmp",
        }
    }
}

impl SpindriftConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("SPINDRIFT_DOWNLOAD_DIR") {
            config.download.download_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("SPINDRIFT_STORE_DIR") {
            config.store.store_dir = PathBuf::from(dir);
        }

        if let Ok(timeout) = std::env::var("SPINDRIFT_READINESS_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.streaming.readiness_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(interval) = std::env::var("SPINDRIFT_PROGRESS_INTERVAL_MS") {
            if let Ok(millis) = interval.parse::<u64>() {
                config.broadcast.interval = Duration::from_millis(millis);
            }
        }

        if let Ok(path) = std::env::var("SPINDRIFT_FFMPEG_PATH") {
            config.transmux.ffmpeg_path = PathBuf::from(path);
        }

        config
    }

    /// Creates a configuration with short intervals suitable for tests.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.download.progress_tick = Duration::from_millis(10);
        config.download.speed_window = Duration::from_millis(500);
        config.download.completion_grace = Duration::from_millis(100);
        config.download.metadata_timeout = Duration::from_secs(5);
        config.streaming.readiness_timeout = Duration::from_millis(500);
        config.streaming.readiness_poll = Duration::from_millis(10);
        config.streaming.playback_head_bytes = 4096;
        config.streaming.read_stall_timeout = Duration::from_secs(2);
        config.broadcast.interval = Duration::from_millis(25);
        config.broadcast.completion_grace = Duration::from_millis(25);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = SpindriftConfig::default();

        assert_eq!(config.download.progress_tick, Duration::from_millis(500));
        assert_eq!(config.streaming.readiness_timeout, Duration::from_secs(10));
        assert_eq!(config.streaming.playback_head_bytes, 2 * 1024 * 1024);
        assert_eq!(config.transmux.audio_bitrate_kbps, 128);
        assert_eq!(config.store.temp_file_suffix, ".tmp");
        assert_eq!(config.broadcast.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_testing_config_is_fast() {
        let config = SpindriftConfig::for_testing();
        assert!(config.streaming.readiness_timeout < Duration::from_secs(1));
        assert!(config.download.progress_tick < Duration::from_millis(100));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("SPINDRIFT_DOWNLOAD_DIR", "/var/spindrift/dl");
            std::env::set_var("SPINDRIFT_READINESS_TIMEOUT", "42");
            std::env::set_var("SPINDRIFT_PROGRESS_INTERVAL_MS", "250");
        }

        let config = SpindriftConfig::from_env();

        assert_eq!(
            config.download.download_dir,
            PathBuf::from("/var/spindrift/dl")
        );
        assert_eq!(config.streaming.readiness_timeout, Duration::from_secs(42));
        assert_eq!(config.broadcast.interval, Duration::from_millis(250));

        unsafe {
            std::env::remove_var("SPINDRIFT_DOWNLOAD_DIR");
            std::env::remove_var("SPINDRIFT_READINESS_TIMEOUT");
            std::env::remove_var("SPINDRIFT_PROGRESS_INTERVAL_MS");
        }
    }
}
