//! Core identity and durable record types for media items.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::magnet::SourceError;

/// Opaque identity of a logical media item (movie or show).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaId(Uuid);

impl MediaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MediaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MediaId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Stable 20-byte identity derived from a source reference.
///
/// For magnet links this is the btih info hash; sessions are deduplicated
/// process-wide by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 20]);

impl ContentHash {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parses a 40-character hex string.
    ///
    /// # Errors
    /// - `SourceError::InvalidInfoHash` - Wrong length or non-hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self, SourceError> {
        if hex_str.len() != 40 {
            return Err(SourceError::InvalidInfoHash {
                reason: format!("expected 40 hex characters, got {}", hex_str.len()),
            });
        }

        let decoded = hex::decode(hex_str).map_err(|e| SourceError::InvalidInfoHash {
            reason: e.to_string(),
        })?;

        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Derives a hash from arbitrary bytes via SHA-1.
    ///
    /// Fallback identity for source references that do not carry an
    /// explicit btih hash.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Kind of a media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Show,
}

/// Durable lifecycle status of a media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Added,
    Initializing,
    Downloading,
    Complete,
    Error,
}

impl MediaStatus {
    /// True for statuses the recovery procedure re-attaches after a restart.
    pub fn is_interrupted(self) -> bool {
        matches!(
            self,
            MediaStatus::Added | MediaStatus::Initializing | MediaStatus::Downloading
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaStatus::Added => "added",
            MediaStatus::Initializing => "initializing",
            MediaStatus::Downloading => "downloading",
            MediaStatus::Complete => "complete",
            MediaStatus::Error => "error",
        }
    }
}

impl fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record for one logical media item.
///
/// Owned by the session store. The download session manager reads
/// identity/source and writes status, progress, file location, and error
/// state back through the store; it never mutates records directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: MediaId,
    pub kind: MediaKind,
    pub title: String,
    /// Magnet-style source descriptor with a stable content hash
    pub source_ref: String,
    pub status: MediaStatus,
    pub progress: f64,
    pub file_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub episodes: Vec<EpisodeRecord>,
    pub added_at: DateTime<Utc>,
}

impl MediaRecord {
    pub fn new(kind: MediaKind, title: impl Into<String>, source_ref: impl Into<String>) -> Self {
        Self {
            id: MediaId::new(),
            kind,
            title: title.into(),
            source_ref: source_ref.into(),
            status: MediaStatus::Added,
            progress: 0.0,
            file_path: None,
            file_size: None,
            last_error: None,
            episodes: Vec::new(),
            added_at: Utc::now(),
        }
    }

    pub fn episode(&self, episode_id: Uuid) -> Option<&EpisodeRecord> {
        self.episodes.iter().find(|e| e.id == episode_id)
    }
}

/// Durable per-episode record for TV shows.
///
/// Each episode maps to one file of a multi-file source and mirrors the
/// playback-relevant fields of its parent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub id: Uuid,
    pub season: u32,
    pub episode: u32,
    /// Position of this episode's file within the multi-file source
    pub file_index: usize,
    pub file_path: Option<PathBuf>,
    pub file_size: Option<u64>,
}

impl EpisodeRecord {
    pub fn new(season: u32, episode: u32, file_index: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            season,
            episode,
            file_index,
            file_path: None,
            file_size: None,
        }
    }
}
