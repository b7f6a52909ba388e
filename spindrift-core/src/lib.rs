//! Spindrift Core - Streaming delivery engine
//!
//! This crate provides the building blocks for watching media while it is
//! still downloading: the download session manager, readiness gate, range
//! resolution, transmux pipeline, crash recovery, and the durable session
//! store that ties them together. The peer-wire protocol itself is an
//! external collaborator behind the [`engine::FetchEngine`] seam.

pub mod config;
pub mod engine;
pub mod magnet;
pub mod media;
pub mod readiness;
pub mod recovery;
pub mod session;
pub mod store;
pub mod stream;
pub mod transmux;

// Re-export main types for convenient access
pub use config::SpindriftConfig;
pub use engine::{EngineError, FetchEngine, FetchHandle};
pub use magnet::{MagnetLink, SourceError};
pub use media::{ContentHash, MediaId, MediaKind, MediaRecord, MediaStatus};
pub use readiness::{ReadinessGate, ReadinessOutcome};
pub use session::{DownloadManager, DownloadStatus, SessionError};
pub use store::{JsonSessionStore, SessionStore, StoreError};
pub use stream::StreamSource;
pub use transmux::{TransmuxError, TransmuxPipeline};

/// Core errors that can bubble up from any Spindrift subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SpindriftError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transmux error: {0}")]
    Transmux(#[from] TransmuxError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpindriftError {
    /// Returns a user-friendly error message suitable for display.
    ///
    /// Internal detail stays in server-side logs; callers only see the
    /// coarse failure categories.
    pub fn user_message(&self) -> String {
        match self {
            SpindriftError::Source(_) => "Invalid source reference".to_string(),
            SpindriftError::Engine(_) => "Download failed".to_string(),
            SpindriftError::Session(SessionError::MediaNotFound { .. }) => {
                "Media not found".to_string()
            }
            SpindriftError::Session(_) => "Download error occurred".to_string(),
            SpindriftError::Store(_) => "Storage error occurred".to_string(),
            SpindriftError::Transmux(_) => "Playback preparation failed".to_string(),
            SpindriftError::Configuration { reason } => {
                format!("Configuration error: {reason}")
            }
            SpindriftError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SpindriftError::Source(_) | SpindriftError::Configuration { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SpindriftError>;
