//! Local filesystem storage backend. Objects are files under `archives/`.

use super::StorageBackend;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use strata_core::{Error, Result};
use tokio::io::AsyncRead;

/// Storage backend rooted at `<basePath>/<owner>/<repo>/archives`.
pub struct LocalBackend {
    archives_dir: PathBuf,
}

impl LocalBackend {
    pub fn new(archives_dir: PathBuf) -> Self {
        Self { archives_dir }
    }

    fn full_path(&self, location: &str) -> PathBuf {
        self.archives_dir
            .parent()
            .unwrap_or(&self.archives_dir)
            .join(location)
    }

    /// Exposed so the provider can extract an archive directly from disk
    /// without a redundant copy through [`StorageBackend::get`].
    pub fn get_full_path(&self, location: &str) -> PathBuf {
        self.full_path(location)
    }

    fn location_for(&self, filename: &str) -> String {
        format!("archives/{filename}")
    }
}

fn not_found(location: &str) -> Error {
    Error::ArchiveNotFound(location.to_string())
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn put(&self, data: Vec<u8>, extension: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let hash = hex::encode(&hasher.finalize()[..8]);
        let filename = format!("sha256-{hash}.{extension}");
        let location = self.location_for(&filename);
        let path = self.full_path(&location);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(location);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }
        tokio::fs::write(&path, &data).await.map_err(Error::Io)?;
        Ok(location)
    }

    async fn put_from_path(&self, local_path: &Path) -> Result<String> {
        let filename = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput("archive path has no file name".to_string()))?
            .to_string();
        let location = self.location_for(&filename);
        let dest = self.full_path(&location);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }

        match tokio::fs::rename(local_path, &dest).await {
            Ok(()) => {}
            Err(_) => {
                tokio::fs::copy(local_path, &dest).await.map_err(Error::Io)?;
                tokio::fs::remove_file(local_path).await.ok();
            }
        }
        Ok(location)
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.full_path(location);
        tokio::fs::read(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => not_found(location),
                _ => Error::Io(e),
            })
    }

    async fn get_stream(&self, location: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        let path = self.full_path(location);
        let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => not_found(location),
            _ => Error::Io(e),
        })?;
        Ok(Box::new(file))
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let path = self.full_path(location);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn exists(&self, location: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.full_path(location))
            .await
            .unwrap_or(false))
    }

    async fn get_size(&self, location: &str) -> Result<u64> {
        let path = self.full_path(location);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(location)),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn finalize(&self, temp_location: &str, final_location: &str) -> Result<()> {
        let from = self.full_path(temp_location);
        let to = self.full_path(final_location);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }
        tokio::fs::rename(&from, &to).await.map_err(Error::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(root: &Path) -> LocalBackend {
        LocalBackend::new(root.join("archives"))
    }

    #[tokio::test]
    async fn put_is_idempotent_by_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let loc1 = backend.put(b"hello".to_vec(), "tar").await.unwrap();
        let loc2 = backend.put(b"hello".to_vec(), "tar").await.unwrap();
        assert_eq!(loc1, loc2);
    }

    #[tokio::test]
    async fn get_missing_object_is_archive_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let err = backend.get("archives/sha256-deadbeef.tar").await.unwrap_err();
        assert!(matches!(err, Error::ArchiveNotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend.delete("archives/never-existed.tar").await.unwrap();
    }

    #[tokio::test]
    async fn put_from_path_promotes_without_leaving_source() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let src = dir.path().join("sha256-abc.tar");
        tokio::fs::write(&src, b"data").await.unwrap();

        let location = backend.put_from_path(&src).await.unwrap();
        assert!(backend.exists(&location).await.unwrap());
        assert!(!tokio::fs::try_exists(&src).await.unwrap());
    }

    #[tokio::test]
    async fn finalize_strips_temp_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let temp_loc = backend
            .put(b"payload".to_vec(), "tar.tmp.1.1")
            .await
            .unwrap();
        let final_loc = temp_loc.trim_end_matches(".tmp.1.1").to_string();
        backend.finalize(&temp_loc, &final_loc).await.unwrap();
        assert!(!backend.exists(&temp_loc).await.unwrap());
        assert!(backend.exists(&final_loc).await.unwrap());
    }
}
