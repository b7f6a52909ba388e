//! Magnet link parsing utilities.

use crate::media::ContentHash;

/// Errors for unusable source references.
///
/// These are permanent: a malformed magnet link never becomes valid by
/// retrying, so callers surface them immediately instead of recording a
/// retryable error state.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Not a magnet link: {reason}")]
    Malformed { reason: String },

    #[error("Magnet link is missing a btih info hash")]
    MissingInfoHash,

    #[error("Invalid info hash: {reason}")]
    InvalidInfoHash { reason: String },
}

/// Parsed magnet-style source reference.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub content_hash: ContentHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    raw: String,
}

impl MagnetLink {
    /// Parses a magnet URI into its content hash, display name, and trackers.
    ///
    /// # Errors
    /// - `SourceError::Malformed` - Not a `magnet:?` URI
    /// - `SourceError::MissingInfoHash` - No `xt=urn:btih:` parameter
    /// - `SourceError::InvalidInfoHash` - Hash is not 40 hex characters
    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| SourceError::Malformed {
                reason: "missing magnet:? scheme".to_string(),
            })?;

        let mut content_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for param in query.split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };

            match key {
                "xt" => {
                    let Some(hash_str) = value.strip_prefix("urn:btih:") else {
                        continue; // Other exact-topic schemes are ignored
                    };
                    content_hash = Some(ContentHash::from_hex(hash_str)?);
                }
                "dn" => {
                    display_name = Some(decode_param(value));
                }
                "tr" => {
                    let tracker = decode_param(value);
                    if !tracker.is_empty() {
                        trackers.push(tracker);
                    }
                }
                _ => {}
            }
        }

        let content_hash = content_hash.ok_or(SourceError::MissingInfoHash)?;

        Ok(Self {
            content_hash,
            display_name,
            trackers,
            raw: uri.to_string(),
        })
    }

    /// The original URI this link was parsed from.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Display name with a hash-derived fallback for nameless links.
    pub fn name_or_fallback(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => format!("Media_{}", &self.content_hash.to_string()[..16]),
        }
    }
}

/// Decodes a magnet query parameter (percent-encoding plus `+` as space).
fn decode_param(value: &str) -> String {
    let spaced = value.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}
