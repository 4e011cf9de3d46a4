//! Rebuilds `index.json` from the per-archive sidecar manifests written
//! alongside every local-backend archive. Runs whenever the index is
//! missing or fails to parse, or when `REBUILD_INDEX` is set. Archives with
//! no matching manifest become orphans: counted and logged, never an error.

use crate::types::{ArchiveManifest, CacheEntry, CacheIndex};
use std::path::Path;
use std::time::Duration;
use strata_core::{Error, Result};
use tracing::{info, warn};

const STALE_TEMP_AFTER: Duration = Duration::from_secs(3600);
const MANIFEST_SUFFIX: &str = ".meta.json";

/// Scan `archives_dir` for manifests and assemble a fresh index from them.
/// Also sweeps `.tmp*` leftovers older than an hour.
pub async fn rebuild_index(archives_dir: &Path) -> Result<CacheIndex> {
    if !tokio::fs::try_exists(archives_dir).await.unwrap_or(false) {
        return Ok(CacheIndex::empty());
    }

    let mut entries = Vec::new();
    let mut orphans = 0u32;
    let mut stale_temps = 0u32;

    let mut read_dir = tokio::fs::read_dir(archives_dir).await.map_err(Error::Io)?;
    while let Some(dir_entry) = read_dir.next_entry().await.map_err(Error::Io)? {
        let path = dir_entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name.contains(".tmp") {
            if is_stale(&path).await {
                warn!(file = %path.display(), "removing stale temp file during rebuild");
                let _ = tokio::fs::remove_file(&path).await;
                stale_temps += 1;
            }
            continue;
        }

        if !name.ends_with(MANIFEST_SUFFIX) {
            continue;
        }

        match load_manifest(&path).await {
            Ok(manifest) => entries.push(manifest_to_entry(manifest)),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unreadable manifest during rebuild");
            }
        }
    }

    let archive_stems: std::collections::HashSet<String> = entries
        .iter()
        .filter_map(|e: &CacheEntry| {
            Path::new(&e.archive_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .collect();
    orphans += count_orphaned_archives(archives_dir, &archive_stems).await;

    info!(
        entries = entries.len(),
        orphans, stale_temps, "rebuilt index from sidecar manifests"
    );

    Ok(CacheIndex {
        version: crate::types::CURRENT_VERSION.to_string(),
        entries,
    })
}

async fn is_stale(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .and_then(|m| m.elapsed().map_err(std::io::Error::other))
        .map(|age| age > STALE_TEMP_AFTER)
        .unwrap_or(false)
}

async fn load_manifest(path: &Path) -> Result<ArchiveManifest> {
    let bytes = tokio::fs::read(path).await.map_err(Error::Io)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn manifest_to_entry(manifest: ArchiveManifest) -> CacheEntry {
    CacheEntry {
        key: manifest.key,
        archive_path: format!("archives/{}", manifest.archive_filename),
        created_at: manifest.created_at,
        size_bytes: manifest.size_bytes,
        accessed_at: manifest.accessed_at,
        expires_at: manifest.expires_at,
    }
}

/// Archives present on disk with no sidecar manifest that produced an
/// entry above. Counted for the rebuild log line only; never deleted here.
async fn count_orphaned_archives(
    archives_dir: &Path,
    referenced_filenames: &std::collections::HashSet<String>,
) -> u32 {
    let mut count = 0u32;
    let Ok(mut read_dir) = tokio::fs::read_dir(archives_dir).await else {
        return 0;
    };
    while let Ok(Some(dir_entry)) = read_dir.next_entry().await {
        let path = dir_entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.contains(".tmp") || name.ends_with(MANIFEST_SUFFIX) {
            continue;
        }
        if !referenced_filenames.contains(name) {
            warn!(archive = name, "orphaned archive with no sidecar manifest");
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompressionMethod;
    use chrono::Utc;

    async fn write_manifest(dir: &Path, stem: &str) {
        let manifest = ArchiveManifest {
            version: crate::types::CURRENT_VERSION.to_string(),
            key: format!("key-{stem}"),
            created_at: Utc::now(),
            size_bytes: 100,
            archive_filename: format!("{stem}.tar.zst"),
            compression_method: CompressionMethod::Zstd,
            accessed_at: Utc::now(),
            expires_at: None,
        };
        let bytes = serde_json::to_vec(&manifest).unwrap();
        tokio::fs::write(dir.join(format!("{stem}.meta.json")), bytes)
            .await
            .unwrap();
        tokio::fs::write(dir.join(format!("{stem}.tar.zst")), b"archive-bytes")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rebuilds_entries_from_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "sha256-aaaa").await;
        write_manifest(dir.path(), "sha256-bbbb").await;

        let index = rebuild_index(dir.path()).await.unwrap();
        assert_eq!(index.entries.len(), 2);
        assert!(index.find("key-sha256-aaaa").is_some());
    }

    #[tokio::test]
    async fn missing_directory_yields_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let index = rebuild_index(&missing).await.unwrap();
        assert!(index.entries.is_empty());
    }

    #[tokio::test]
    async fn archive_without_manifest_is_not_an_entry() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("sha256-orphan.tar.zst"), b"x")
            .await
            .unwrap();
        let index = rebuild_index(dir.path()).await.unwrap();
        assert!(index.entries.is_empty());
    }
}
