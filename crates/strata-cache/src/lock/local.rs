//! File-based advisory lock for the local backend: an exclusive-create file
//! under `locks/<name>.lock`, with exponential backoff on contention and
//! reclamation of locks abandoned by a crashed holder.

use super::{LockGuard, LockManager};
use async_trait::async_trait;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use strata_core::{Error, Result};
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const STALE_AFTER: Duration = Duration::from_secs(30);

pub struct LocalLockManager {
    locks_dir: PathBuf,
    stale_after: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl LocalLockManager {
    pub fn new(locks_dir: PathBuf) -> Self {
        Self {
            locks_dir,
            stale_after: STALE_AFTER,
            max_attempts: MAX_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
        }
    }

    #[cfg(test)]
    fn with_stale_after(locks_dir: PathBuf, stale_after: Duration) -> Self {
        Self {
            locks_dir,
            stale_after,
            max_attempts: 2,
            initial_backoff: Duration::from_millis(5),
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_dir.join(format!("{name}.lock"))
    }

    async fn try_create(&self, path: &std::path::Path) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(std::process::id().to_string().as_bytes())
            .await?;
        Ok(())
    }

    async fn reclaim_if_stale(&self, path: &std::path::Path) {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return;
        };
        let Ok(age) = meta
            .modified()
            .and_then(|m| m.elapsed().map_err(std::io::Error::other))
        else {
            return;
        };
        if age > self.stale_after {
            warn!(lock = %path.display(), age_secs = age.as_secs(), "reclaiming stale lock");
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

struct LocalLockGuard {
    path: PathBuf,
}

#[async_trait]
impl LockGuard for LocalLockGuard {
    async fn release(self: Box<Self>) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn acquire(&self, name: &str) -> Result<Box<dyn LockGuard>> {
        let path = self.lock_path(name);
        let mut backoff = self.initial_backoff;

        for attempt in 1..=self.max_attempts {
            match self.try_create(&path).await {
                Ok(()) => {
                    debug!(lock = name, attempt, "acquired lock");
                    return Ok(Box::new(LocalLockGuard { path }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.reclaim_if_stale(&path).await;
                    if attempt == self.max_attempts {
                        break;
                    }
                    let jitter_ms = rand::thread_rng().gen_range(0..50);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Err(Error::LockAcquisitionFailed(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_while_first_holds() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalLockManager::with_stale_after(dir.path().to_path_buf(), Duration::from_secs(3600));
        let _guard = manager.acquire("index").await.unwrap();

        match manager.acquire("index").await {
            Err(Error::LockAcquisitionFailed(_)) => {}
            other => panic!("expected LockAcquisitionFailed, got {}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn release_then_reacquire_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalLockManager::new(dir.path().to_path_buf());
        let guard = manager.acquire("index").await.unwrap();
        guard.release().await.unwrap();
        manager.acquire("index").await.unwrap();
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("index.lock");
        tokio::fs::write(&lock_path, b"999999").await.unwrap();

        let manager = LocalLockManager::with_stale_after(dir.path().to_path_buf(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = manager.acquire("index").await;
        assert!(result.is_ok());
    }
}
