//! Persisted and transient cache data model.
//!
//! Field names use `snake_case` in Rust but (de)serialize to the
//! `camelCase` wire format the index/manifest JSON documents use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version for both `index.json` and `<archive>.meta.json`.
pub const CURRENT_VERSION: &str = "2";

/// One row of the index: the durable record of a saved archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub archive_path: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub accessed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if now > exp)
    }
}

/// The authoritative list of live entries for a repository scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheIndex {
    pub version: String,
    pub entries: Vec<CacheEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION.to_string(),
            entries: Vec::new(),
        }
    }
}

impl CacheIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn find(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let idx = self.entries.iter().position(|e| e.key == key)?;
        Some(self.entries.remove(idx))
    }
}

/// Sidecar JSON stored next to every local-backend archive. Lets the
/// rebuilder reconstruct the index from archives alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveManifest {
    pub version: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub archive_filename: String,
    pub compression_method: CompressionMethod,
    pub accessed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of a `resolve` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveResult {
    pub entry: Option<CacheEntry>,
    pub matched_key: Option<String>,
    pub is_exact_match: bool,
}

impl ResolveResult {
    pub fn miss() -> Self {
        Self {
            entry: None,
            matched_key: None,
            is_exact_match: false,
        }
    }
}

/// An archive's compression codec, as actually applied (never `Auto`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    Zstd,
    Gzip,
    None,
}

impl CompressionMethod {
    pub fn extension(self) -> &'static str {
        match self {
            CompressionMethod::Zstd => "tar.zst",
            CompressionMethod::Gzip => "tar.gz",
            CompressionMethod::None => "tar",
        }
    }
}

/// What a caller asked for; `Auto` defers to whichever encoder is available.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionRequest {
    #[default]
    Auto,
    Zstd,
    Gzip,
    None,
}

/// Caller-supplied compression policy: method plus an optional level.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub method: CompressionRequest,
    pub level: Option<i32>,
}

/// Outcome of resolving a [`CompressionPolicy`] against the runtime: the
/// concrete method to use, its clamped level, and whether clamping occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCompression {
    pub method: CompressionMethod,
    pub level: i32,
    pub clamped: bool,
}

/// In-memory, never-persisted operational counters for one engine instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub hits: u64,
    pub misses: u64,
    pub uploads: u64,
    pub total_bytes_downloaded: u64,
    pub total_bytes_uploaded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_expired_strictly_after_expires_at() {
        let now = Utc::now();
        let entry = CacheEntry {
            key: "k".into(),
            archive_path: "archives/sha256-aaaa.tar.zst".into(),
            created_at: now,
            size_bytes: 10,
            accessed_at: now,
            expires_at: Some(now),
        };
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + chrono::Duration::seconds(1)));
    }

    #[test]
    fn index_json_round_trips_camel_case() {
        let now = Utc::now();
        let index = CacheIndex {
            version: CURRENT_VERSION.to_string(),
            entries: vec![CacheEntry {
                key: "npm-linux-abc".into(),
                archive_path: "archives/sha256-abcdef0123456789.tar.zst".into(),
                created_at: now,
                size_bytes: 1024,
                accessed_at: now,
                expires_at: None,
            }],
        };
        let json = serde_json::to_string(&index).unwrap();
        assert!(json.contains("\"archivePath\""));
        let back: CacheIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, index);
    }
}
