//! Local index store: `index.json` next to `archives/` and `locks/`,
//! written via a temp file plus atomic rename. Falls back to rebuilding
//! from sidecar manifests when the file is missing or fails to parse, and
//! migrates the version "1" wire format (no `accessedAt`) up to "2".

use super::IndexStore;
use crate::rebuild;
use crate::types::{CacheEntry, CacheIndex, CURRENT_VERSION};
use async_trait::async_trait;
use std::path::PathBuf;
use strata_core::{Error, Result};
use tracing::warn;

pub struct LocalIndexStore {
    index_path: PathBuf,
    archives_dir: PathBuf,
}

impl LocalIndexStore {
    pub fn new(index_path: PathBuf, archives_dir: PathBuf) -> Self {
        Self {
            index_path,
            archives_dir,
        }
    }
}

/// Parse raw index bytes, migrating version "1" (no `accessedAt`) to the
/// current schema by defaulting `accessedAt` to `createdAt`.
fn parse_and_migrate(bytes: &[u8]) -> Result<CacheIndex> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let version = value.get("version").and_then(|v| v.as_str()).unwrap_or("");

    if version == CURRENT_VERSION {
        return Ok(serde_json::from_value(value)?);
    }
    if version != "1" {
        return Err(Error::CorruptIndex(format!("unknown index version {version:?}")));
    }

    let raw_entries = value
        .get("entries")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut entries = Vec::with_capacity(raw_entries.len());
    for mut raw in raw_entries {
        let created_at = raw.get("createdAt").cloned();
        if raw.get("accessedAt").is_none()
            && let Some(obj) = raw.as_object_mut()
            && let Some(created_at) = created_at
        {
            obj.insert("accessedAt".to_string(), created_at);
        }
        entries.push(serde_json::from_value::<CacheEntry>(raw)?);
    }

    Ok(CacheIndex {
        version: CURRENT_VERSION.to_string(),
        entries,
    })
}

#[async_trait]
impl IndexStore for LocalIndexStore {
    async fn load(&self) -> Result<(CacheIndex, Option<String>)> {
        if crate::config::CacheConfig::rebuild_index_requested() {
            let rebuilt = rebuild::rebuild_index(&self.archives_dir).await?;
            return self.finish_rebuild(rebuilt).await;
        }

        let bytes = match tokio::fs::read(&self.index_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let rebuilt = rebuild::rebuild_index(&self.archives_dir).await?;
                return self.finish_rebuild(rebuilt).await;
            }
            Err(e) => return Err(Error::Io(e)),
        };

        match parse_and_migrate(&bytes) {
            Ok(index) => Ok((index, None)),
            Err(e) => {
                warn!(error = %e, "index.json failed to parse, rebuilding from manifests");
                let rebuilt = rebuild::rebuild_index(&self.archives_dir).await?;
                self.finish_rebuild(rebuilt).await
            }
        }
    }

    async fn save(&self, index: &CacheIndex, _expected_token: Option<&str>) -> Result<Option<String>> {
        let bytes = serde_json::to_vec_pretty(index)?;
        let temp_path = self.index_path.with_extension("json.tmp");
        if let Some(parent) = self.index_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }
        tokio::fs::write(&temp_path, &bytes).await.map_err(Error::Io)?;
        tokio::fs::rename(&temp_path, &self.index_path)
            .await
            .map_err(Error::Io)?;
        Ok(None)
    }
}

impl LocalIndexStore {
    /// A rebuild that yielded entries is returned as-is, without being
    /// persisted back to disk: writing it would be a silent mutation of the
    /// index from inside a read path. A rebuild that yielded nothing (no
    /// manifests found) establishes a baseline empty index on disk instead
    /// of re-scanning on every subsequent `load`.
    async fn finish_rebuild(&self, rebuilt: CacheIndex) -> Result<(CacheIndex, Option<String>)> {
        if rebuilt.entries.is_empty() {
            self.save(&rebuilt, None).await?;
        }
        Ok((rebuilt, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn store(dir: &std::path::Path) -> LocalIndexStore {
        LocalIndexStore::new(dir.join("index.json"), dir.join("archives"))
    }

    #[tokio::test]
    async fn missing_index_rebuilds_empty_when_no_archives() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let (index, _) = store.load().await.unwrap();
        assert!(index.entries.is_empty());
        assert!(tokio::fs::try_exists(dir.path().join("index.json")).await.unwrap());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let now = Utc::now();
        let index = CacheIndex {
            version: CURRENT_VERSION.to_string(),
            entries: vec![CacheEntry {
                key: "k1".into(),
                archive_path: "archives/sha256-aaaa.tar.zst".into(),
                created_at: now,
                size_bytes: 10,
                accessed_at: now,
                expires_at: None,
            }],
        };
        store.save(&index, None).await.unwrap();
        let (loaded, _) = store.load().await.unwrap();
        assert_eq!(loaded, index);
    }

    #[tokio::test]
    async fn version_one_index_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        let v1 = serde_json::json!({
            "version": "1",
            "entries": [{
                "key": "legacy",
                "archivePath": "archives/sha256-old.tar.zst",
                "createdAt": "2024-01-01T00:00:00Z",
                "sizeBytes": 5
            }]
        });
        tokio::fs::write(dir.path().join("index.json"), serde_json::to_vec(&v1).unwrap())
            .await
            .unwrap();

        let store = store(dir.path());
        let (index, _) = store.load().await.unwrap();
        assert_eq!(index.version, CURRENT_VERSION);
        let entry = index.find("legacy").unwrap();
        assert_eq!(entry.accessed_at, entry.created_at);
    }

    #[tokio::test]
    async fn corrupt_index_falls_back_to_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("index.json"), b"not json")
            .await
            .unwrap();
        let store = store(dir.path());
        let (index, _) = store.load().await.unwrap();
        assert!(index.entries.is_empty());
    }
}
