//! `CacheEngine`: the orchestrator tying together the archive codec,
//! storage backend, index store, and lock manager into `resolve` / `save`
//! / `restore` / `exists`. Saves run as two phases — archive creation
//! happens unlocked, only the index mutation (and the eviction sweep that
//! rides along with it) happens under the named `"index"` lock.

use crate::archive;
use crate::backend::{GcsBackend, LocalBackend, RemoteObjectStore, S3Backend, StorageBackend};
use crate::config::{BackendKind, CacheConfig};
use crate::index::{IndexStore, LocalIndexStore, RemoteIndexStore};
use crate::lock::{LocalLockManager, LockManager, RemoteLockManager};
use crate::types::{ArchiveManifest, CacheEntry, CacheIndex, CompressionPolicy, EngineStats, ResolveResult};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::{Error, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const INDEX_LOCK_NAME: &str = "index";

/// Outcome of a locked commit: either we won and installed a fresh entry,
/// or someone else already had, and the caller's own staged archive is now
/// redundant.
enum CommitOutcome {
    Committed(CacheEntry),
    Existing(CacheEntry),
}

/// Content-addressed build-artifact cache for one repository scope.
pub struct CacheEngine {
    config: CacheConfig,
    backend: Arc<dyn StorageBackend>,
    index_store: Arc<dyn IndexStore>,
    lock_manager: Arc<dyn LockManager>,
    local_archives_dir: Option<PathBuf>,
    stats: Mutex<EngineStats>,
}

impl CacheEngine {
    /// Build an engine backed by the local filesystem, per `config.local`.
    pub fn local(config: CacheConfig) -> Result<Self> {
        let local_cfg = config
            .local
            .clone()
            .ok_or_else(|| Error::InvalidInput("backend=local requires a local config".to_string()))?;
        let scope_root = local_cfg.base_path.join(config.scope_path());
        let archives_dir = scope_root.join("archives");
        let locks_dir = scope_root.join("locks");
        let index_path = scope_root.join("index.json");

        Ok(Self {
            config,
            backend: Arc::new(LocalBackend::new(archives_dir.clone())),
            index_store: Arc::new(LocalIndexStore::new(index_path, archives_dir.clone())),
            lock_manager: Arc::new(LocalLockManager::new(locks_dir)),
            local_archives_dir: Some(archives_dir),
            stats: Mutex::new(EngineStats::default()),
        })
    }

    /// Build an engine against a remote object store that implements both
    /// [`StorageBackend`] (archives) and [`RemoteObjectStore`] (index/lock
    /// fixed-key access) — the shape both [`S3Backend`] and [`GcsBackend`]
    /// have.
    pub fn remote<B>(config: CacheConfig, store: Arc<B>) -> Self
    where
        B: StorageBackend + RemoteObjectStore + 'static,
    {
        let remote_object_store: Arc<dyn RemoteObjectStore> = store.clone();
        Self {
            config,
            backend: store,
            index_store: Arc::new(RemoteIndexStore::new(remote_object_store.clone())),
            lock_manager: Arc::new(RemoteLockManager::new(remote_object_store)),
            local_archives_dir: None,
            stats: Mutex::new(EngineStats::default()),
        }
    }

    /// Convenience matching [`BackendKind::S3`]: wraps an already-built
    /// [`S3Backend`] (so the caller controls client/region/credentials).
    pub fn with_s3(config: CacheConfig, backend: S3Backend) -> Self {
        Self::remote(config, Arc::new(backend))
    }

    /// Convenience matching [`BackendKind::Gcs`].
    pub fn with_gcs(config: CacheConfig, backend: GcsBackend) -> Self {
        Self::remote(config, Arc::new(backend))
    }

    pub fn backend_kind(&self) -> &BackendKind {
        &self.config.backend
    }

    pub async fn stats(&self) -> EngineStats {
        *self.stats.lock().await
    }

    /// Load the index under the named lock. Every read that a caller goes
    /// on to make a decision from (resolve, exists, getIndex) takes this
    /// path rather than calling the index store directly, since for the
    /// local backend a plain `load()` can itself rebuild-and-persist the
    /// index on a missing/corrupt file — a mutation with no business
    /// happening unlocked.
    async fn load_index_under_lock(&self) -> Result<CacheIndex> {
        let guard = self.lock_manager.acquire(INDEX_LOCK_NAME).await?;
        let result = self.index_store.load().await;
        guard.release().await?;
        result.map(|(index, _)| index)
    }

    /// Look up `key`, falling back to the most recently created live entry
    /// whose key starts with one of `restore_keys`, in order.
    #[instrument(skip(self))]
    pub async fn resolve(&self, key: &str, restore_keys: &[String]) -> Result<ResolveResult> {
        let index = self.load_index_under_lock().await?;
        let now = Utc::now();

        if let Some(entry) = index.find(key)
            && !entry.is_expired(now)
        {
            self.record_hit(entry.size_bytes).await;
            return Ok(ResolveResult {
                entry: Some(entry.clone()),
                matched_key: Some(key.to_string()),
                is_exact_match: true,
            });
        }

        for prefix in restore_keys {
            if let Some(entry) = Self::best_prefix_match(&index, prefix, now) {
                self.record_hit(entry.size_bytes).await;
                return Ok(ResolveResult {
                    entry: Some(entry.clone()),
                    matched_key: Some(entry.key.clone()),
                    is_exact_match: false,
                });
            }
        }

        self.record_miss().await;
        Ok(ResolveResult::miss())
    }

    fn best_prefix_match<'a>(index: &'a CacheIndex, prefix: &str, now: DateTime<Utc>) -> Option<&'a CacheEntry> {
        index
            .entries
            .iter()
            .filter(|e| e.key.starts_with(prefix) && !e.is_expired(now))
            .max_by_key(|e| e.created_at)
    }

    /// Extract the archive for `entry` into `target_dir`.
    #[instrument(skip(self, entry))]
    pub async fn restore(&self, entry: &CacheEntry, target_dir: &Path) -> Result<()> {
        if let Some(archives_dir) = &self.local_archives_dir {
            let local = LocalBackend::new(archives_dir.clone());
            let path = local.get_full_path(&entry.archive_path);
            let target = target_dir.to_path_buf();
            tokio::task::spawn_blocking(move || archive::extract_archive(&path, &target))
                .await
                .map_err(|e| Error::Internal(e.to_string()))??;
        } else {
            let data = self.backend.get(&entry.archive_path).await?;
            let temp_path = std::env::temp_dir().join(format!(
                "strata-restore-{}-{}",
                std::process::id(),
                temp_suffix()
            ));
            tokio::fs::write(&temp_path, &data).await.map_err(Error::Io)?;
            let temp_path_for_extract = temp_path.clone();
            let target = target_dir.to_path_buf();
            let extract_result =
                tokio::task::spawn_blocking(move || archive::extract_archive(&temp_path_for_extract, &target))
                    .await
                    .map_err(|e| Error::Internal(e.to_string()));
            tokio::fs::remove_file(&temp_path).await.ok();
            extract_result??;
        }

        self.record_download(entry.size_bytes).await;
        self.touch_accessed_at(&entry.key).await;
        Ok(())
    }

    /// Best-effort: bump `accessedAt` for `key` under the index lock so LRU
    /// eviction reflects reads, not just writes. Failures are logged, never
    /// propagated — a cache read should not fail because bookkeeping did.
    async fn touch_accessed_at(&self, key: &str) {
        let guard = match self.lock_manager.acquire(INDEX_LOCK_NAME).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(key, error = %e, "failed to acquire lock to update accessedAt");
                return;
            }
        };
        let result = self.touch_accessed_at_locked(key).await;
        if let Err(e) = guard.release().await {
            warn!(key, error = %e, "failed to release lock after updating accessedAt");
        }
        if let Err(e) = result {
            warn!(key, error = %e, "failed to update accessedAt");
        }
    }

    async fn touch_accessed_at_locked(&self, key: &str) -> Result<()> {
        let (mut index, token) = self.index_store.load().await?;
        if let Some(entry) = index.entries.iter_mut().find(|e| e.key == key) {
            entry.accessed_at = Utc::now();
        }
        self.index_store.save(&index, token.as_deref()).await?;
        Ok(())
    }

    /// Save `paths` under `key`. Idempotent: if `key` already has a live
    /// entry, returns it unchanged without re-archiving.
    #[instrument(skip(self, paths))]
    pub async fn save(
        &self,
        key: &str,
        paths: &[String],
        working_dir: Option<&Path>,
        compression: CompressionPolicy,
    ) -> Result<CacheEntry> {
        if key.trim().is_empty() {
            return Err(Error::InvalidInput("cache key must not be empty".to_string()));
        }

        {
            let (index, _) = self.index_store.load().await?;
            if let Some(existing) = index.find(key)
                && !existing.is_expired(Utc::now())
            {
                debug!(key, "save is a no-op, key already has a live entry");
                return Ok(existing.clone());
            }
        }

        // Phase A: create the archive without holding the index lock.
        let (archive_path_on_disk, location) =
            self.create_and_stage_archive(key, paths, working_dir, compression).await?;

        let size_bytes = tokio::fs::metadata(&archive_path_on_disk)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        match self.commit_entry(key, &location, size_bytes).await {
            Ok(CommitOutcome::Committed(entry)) => {
                self.record_upload(size_bytes).await;
                Ok(entry)
            }
            Ok(CommitOutcome::Existing(entry)) => {
                // Another saver committed `key` first while we were
                // archiving unlocked; our archive is redundant.
                let _ = self.backend.delete(&location).await;
                self.delete_sidecar_manifest(&archive_path_on_disk).await;
                Ok(entry)
            }
            Err(e) => {
                warn!(key, error = %e, "rolling back staged archive after failed commit");
                let _ = self.backend.delete(&location).await;
                self.delete_sidecar_manifest(&archive_path_on_disk).await;
                Err(e)
            }
        }
    }

    async fn delete_sidecar_manifest(&self, archive_path: &Path) {
        if self.local_archives_dir.is_none() {
            return;
        }
        let stem = Self::manifest_stem(archive_path);
        let manifest_path = archive_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(format!("{stem}.meta.json"));
        let _ = tokio::fs::remove_file(&manifest_path).await;
    }

    /// Phase A. For the local backend, `archive::create_archive` already
    /// writes straight into `archives/`; the sidecar manifest is written
    /// alongside it with the key filled in. For remote backends it writes
    /// to scratch space first, then `put_from_path` promotes it.
    async fn create_and_stage_archive(
        &self,
        key: &str,
        paths: &[String],
        working_dir: Option<&Path>,
        compression: CompressionPolicy,
    ) -> Result<(PathBuf, String)> {
        if let Some(archives_dir) = self.local_archives_dir.clone() {
            let paths_owned = paths.to_vec();
            let working_dir_owned = working_dir.map(Path::to_path_buf);
            let created = tokio::task::spawn_blocking(move || {
                archive::create_archive(&paths_owned, &archives_dir, working_dir_owned.as_deref(), compression)
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;

            self.write_sidecar_manifest(&created, key).await?;

            let filename = created
                .archive_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            Ok((created.archive_path, format!("archives/{filename}")))
        } else {
            let scratch_dir = std::env::temp_dir().join(format!(
                "strata-stage-{}-{}",
                std::process::id(),
                temp_suffix()
            ));
            tokio::fs::create_dir_all(&scratch_dir).await.map_err(Error::Io)?;

            let paths_owned = paths.to_vec();
            let working_dir_owned = working_dir.map(Path::to_path_buf);
            let scratch_for_blocking = scratch_dir.clone();
            let created = tokio::task::spawn_blocking(move || {
                archive::create_archive(&paths_owned, &scratch_for_blocking, working_dir_owned.as_deref(), compression)
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;

            let location = self.backend.put_from_path(&created.archive_path).await?;
            tokio::fs::remove_dir_all(&scratch_dir).await.ok();
            Ok((created.archive_path, location))
        }
    }

    fn manifest_stem(archive_path: &Path) -> String {
        archive_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split_once(".tar"))
            .map(|(stem, _)| stem.to_string())
            .unwrap_or_default()
    }

    async fn write_sidecar_manifest(&self, created: &archive::CreatedArchive, key: &str) -> Result<()> {
        let stem = Self::manifest_stem(&created.archive_path);
        let manifest_path = created
            .archive_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(format!("{stem}.meta.json"));

        let now = Utc::now();
        let manifest = ArchiveManifest {
            version: crate::types::CURRENT_VERSION.to_string(),
            key: key.to_string(),
            created_at: now,
            size_bytes: created.size_bytes,
            archive_filename: created
                .archive_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string(),
            compression_method: created.compression,
            accessed_at: now,
            expires_at: None,
        };
        let bytes = serde_json::to_vec(&manifest)?;
        tokio::fs::write(&manifest_path, bytes).await.map_err(Error::Io)
    }

    /// Acquire the index lock, insert/replace `key`'s entry, run TTL and
    /// LRU eviction, and persist. The whole critical section is the
    /// "Phase B" of a save.
    async fn commit_entry(&self, key: &str, location: &str, size_bytes: u64) -> Result<CommitOutcome> {
        let guard = self.lock_manager.acquire(INDEX_LOCK_NAME).await?;
        let result = self.commit_entry_locked(key, location, size_bytes).await;
        guard.release().await?;
        result
    }

    async fn commit_entry_locked(&self, key: &str, location: &str, size_bytes: u64) -> Result<CommitOutcome> {
        let (mut index, token) = self.index_store.load().await?;
        let now = Utc::now();

        // Another saver may have committed `key` between our unlocked
        // pre-check and acquiring this lock; the one observing it here
        // under lock wins and everyone else returns its entry unchanged.
        if let Some(existing) = index.find(key)
            && !existing.is_expired(now)
        {
            return Ok(CommitOutcome::Existing(existing.clone()));
        }

        let expires_at = if self.config.ttl_days > 0 {
            Some(now + chrono::Duration::days(self.config.ttl_days as i64))
        } else {
            None
        };

        index.remove(key);
        let entry = CacheEntry {
            key: key.to_string(),
            archive_path: location.to_string(),
            created_at: now,
            size_bytes,
            accessed_at: now,
            expires_at,
        };
        index.entries.push(entry.clone());

        self.evict_expired(&mut index, now).await;
        self.evict_lru_over_budget(&mut index).await;

        self.index_store.save(&index, token.as_deref()).await?;
        Ok(CommitOutcome::Committed(entry))
    }

    async fn evict_expired(&self, index: &mut CacheIndex, now: DateTime<Utc>) {
        let (expired, live): (Vec<_>, Vec<_>) = index.entries.drain(..).partition(|e| e.is_expired(now));
        index.entries = live;
        for entry in expired {
            info!(key = entry.key, "evicting expired entry");
            let _ = self.backend.delete(&entry.archive_path).await;
        }
    }

    /// Evict least-recently-used entries (ties broken by `createdAt`
    /// ascending) until total size is back under budget. A single entry
    /// larger than the whole budget is kept — and only warned about —
    /// rather than rejected, since refusing it would make `save` unusable
    /// for that key.
    async fn evict_lru_over_budget(&self, index: &mut CacheIndex) {
        let budget_bytes = self.config.max_cache_size_gb * 1024 * 1024 * 1024;
        let mut total: u64 = index.entries.iter().map(|e| e.size_bytes).sum();
        if total <= budget_bytes {
            return;
        }

        index
            .entries
            .sort_by(|a, b| a.accessed_at.cmp(&b.accessed_at).then(a.created_at.cmp(&b.created_at)));

        let sorted: Vec<CacheEntry> = index.entries.drain(..).collect();
        let mut kept = Vec::with_capacity(sorted.len());
        let mut iter = sorted.into_iter().peekable();
        while let Some(entry) = iter.next() {
            let is_last = iter.peek().is_none();
            if total > budget_bytes && !is_last {
                info!(key = entry.key, size_bytes = entry.size_bytes, "evicting for cache size budget");
                total = total.saturating_sub(entry.size_bytes);
                let _ = self.backend.delete(&entry.archive_path).await;
            } else {
                if total > budget_bytes && is_last {
                    warn!(
                        key = entry.key,
                        size_bytes = entry.size_bytes,
                        budget_bytes,
                        "single entry exceeds cache size budget, keeping it anyway"
                    );
                }
                kept.push(entry);
            }
        }
        index.entries = kept;
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let index = self.load_index_under_lock().await?;
        Ok(index.find(key).map(|e| !e.is_expired(Utc::now())).unwrap_or(false))
    }

    pub async fn get_index(&self) -> Result<CacheIndex> {
        self.load_index_under_lock().await
    }

    async fn record_hit(&self, size_bytes: u64) {
        let mut stats = self.stats.lock().await;
        stats.hits += 1;
        stats.total_bytes_downloaded += size_bytes;
    }

    async fn record_miss(&self) {
        self.stats.lock().await.misses += 1;
    }

    async fn record_download(&self, size_bytes: u64) {
        self.stats.lock().await.total_bytes_downloaded += size_bytes;
    }

    async fn record_upload(&self, size_bytes: u64) {
        let mut stats = self.stats.lock().await;
        stats.uploads += 1;
        stats.total_bytes_uploaded += size_bytes;
    }
}

fn temp_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompressionPolicy;

    fn config(dir: &Path) -> CacheConfig {
        let mut cfg = CacheConfig::local("acme", "widgets", dir.to_path_buf());
        cfg.ttl_days = 0;
        cfg
    }

    async fn write_file(dir: &Path, rel: &str, contents: &[u8]) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(path, contents).await.unwrap();
    }

    #[tokio::test]
    async fn exact_key_hit_round_trips_through_save_resolve_restore() {
        let base = tempfile::tempdir().unwrap();
        let working = tempfile::tempdir().unwrap();
        write_file(working.path(), "out/a.txt", b"alpha").await;

        let engine = CacheEngine::local(config(base.path())).unwrap();
        engine
            .save("npm-linux-abc", &["out".to_string()], Some(working.path()), CompressionPolicy::default())
            .await
            .unwrap();

        let result = engine.resolve("npm-linux-abc", &[]).await.unwrap();
        assert!(result.is_exact_match);
        let entry = result.entry.unwrap();

        let target = tempfile::tempdir().unwrap();
        engine.restore(&entry, target.path()).await.unwrap();
        assert_eq!(tokio::fs::read(target.path().join("out/a.txt")).await.unwrap(), b"alpha");
    }

    #[tokio::test]
    async fn restore_key_prefix_falls_back_to_most_recent() {
        let base = tempfile::tempdir().unwrap();
        let working = tempfile::tempdir().unwrap();
        write_file(working.path(), "f.txt", b"v1").await;

        let engine = CacheEngine::local(config(base.path())).unwrap();
        engine
            .save("npm-linux-v1", &["f.txt".to_string()], Some(working.path()), CompressionPolicy::default())
            .await
            .unwrap();

        let result = engine
            .resolve("npm-linux-v2-missing", &["npm-linux-".to_string()])
            .await
            .unwrap();
        assert!(!result.is_exact_match);
        assert_eq!(result.matched_key.as_deref(), Some("npm-linux-v1"));
    }

    #[tokio::test]
    async fn save_is_idempotent_for_an_existing_live_key() {
        let base = tempfile::tempdir().unwrap();
        let working = tempfile::tempdir().unwrap();
        write_file(working.path(), "f.txt", b"data").await;

        let engine = CacheEngine::local(config(base.path())).unwrap();
        let first = engine
            .save("k", &["f.txt".to_string()], Some(working.path()), CompressionPolicy::default())
            .await
            .unwrap();
        let second = engine
            .save("k", &["f.txt".to_string()], Some(working.path()), CompressionPolicy::default())
            .await
            .unwrap();
        assert_eq!(first.archive_path, second.archive_path);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn miss_when_key_and_restore_keys_do_not_match() {
        let base = tempfile::tempdir().unwrap();
        let engine = CacheEngine::local(config(base.path())).unwrap();
        let result = engine.resolve("nope", &["also-nope-".to_string()]).await.unwrap();
        assert!(result.entry.is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned_by_resolve() {
        let base = tempfile::tempdir().unwrap();
        let working = tempfile::tempdir().unwrap();
        write_file(working.path(), "f.txt", b"data").await;

        let mut cfg = config(base.path());
        cfg.ttl_days = 1;
        let engine = CacheEngine::local(cfg).unwrap();
        engine
            .save("k", &["f.txt".to_string()], Some(working.path()), CompressionPolicy::default())
            .await
            .unwrap();

        // Force expiry directly through the index store to avoid sleeping a day.
        let (mut index, _) = engine.index_store.load().await.unwrap();
        index.entries[0].expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        engine.index_store.save(&index, None).await.unwrap();

        let result = engine.resolve("k", &[]).await.unwrap();
        assert!(result.entry.is_none());
    }

    #[tokio::test]
    async fn exists_reflects_live_entries_only() {
        let base = tempfile::tempdir().unwrap();
        let working = tempfile::tempdir().unwrap();
        write_file(working.path(), "f.txt", b"data").await;

        let engine = CacheEngine::local(config(base.path())).unwrap();
        assert!(!engine.exists("k").await.unwrap());
        engine
            .save("k", &["f.txt".to_string()], Some(working.path()), CompressionPolicy::default())
            .await
            .unwrap();
        assert!(engine.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn restore_bumps_accessed_at_under_lock() {
        let base = tempfile::tempdir().unwrap();
        let working = tempfile::tempdir().unwrap();
        write_file(working.path(), "f.txt", b"data").await;

        let engine = CacheEngine::local(config(base.path())).unwrap();
        let entry = engine
            .save("k", &["f.txt".to_string()], Some(working.path()), CompressionPolicy::default())
            .await
            .unwrap();

        {
            let (mut index, _) = engine.index_store.load().await.unwrap();
            index.entries[0].accessed_at = entry.accessed_at - chrono::Duration::days(1);
            engine.index_store.save(&index, None).await.unwrap();
        }

        let target = tempfile::tempdir().unwrap();
        engine.restore(&entry, target.path()).await.unwrap();

        let (index, _) = engine.index_store.load().await.unwrap();
        let updated = index.find("k").unwrap();
        assert!(updated.accessed_at > entry.accessed_at);
    }

    #[tokio::test]
    async fn concurrent_commit_preserves_first_committed_entry() {
        let base = tempfile::tempdir().unwrap();
        let engine = CacheEngine::local(config(base.path())).unwrap();

        let first = match engine.commit_entry("k", "archives/first.tar", 10).await.unwrap() {
            CommitOutcome::Committed(entry) => entry,
            CommitOutcome::Existing(_) => panic!("expected the first commit to win"),
        };

        match engine.commit_entry("k", "archives/second.tar", 20).await.unwrap() {
            CommitOutcome::Existing(entry) => {
                assert_eq!(entry.archive_path, first.archive_path);
                assert_eq!(entry.created_at, first.created_at);
            }
            CommitOutcome::Committed(_) => panic!("expected the second commit to observe the first under lock"),
        }
    }
}
