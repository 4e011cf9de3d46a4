//! Storage backend abstraction: content-addressed archive objects live
//! under an `archives/` namespace within a repository's storage scope.
//! Three variants (local filesystem, S3-compatible, Google-style object
//! store) implement the same trait so the provider never branches on which
//! one it has.

pub mod gcs;
pub mod local;
pub mod s3;

use async_trait::async_trait;
use std::path::Path;
use strata_core::Result;

/// A backend manages opaque archive objects identified by scope-relative
/// paths (e.g. `archives/sha256-<16hex>.tar.zst`).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write `data` under a name that embeds its content hash. Idempotent:
    /// writing the same bytes twice yields the same location.
    async fn put(&self, data: Vec<u8>, extension: &str) -> Result<String>;

    /// Promote an already-written local file into the backend's namespace
    /// under its own file name, without re-hashing its contents. The local
    /// backend uses this to avoid a copy; remote backends stream the upload.
    async fn put_from_path(&self, local_path: &Path) -> Result<String>;

    async fn get(&self, location: &str) -> Result<Vec<u8>>;

    /// Stream an object's bytes without buffering the whole thing in memory.
    async fn get_stream(
        &self,
        location: &str,
    ) -> Result<Box<dyn tokio::io::AsyncRead + Unpin + Send>>;

    /// Idempotent: no error if the object is already absent.
    async fn delete(&self, location: &str) -> Result<()>;

    async fn exists(&self, location: &str) -> Result<bool>;

    /// 0 when present with unknown size, `ObjectNotFound`-flavored error
    /// (via [`strata_core::Error::ArchiveNotFound`]) when absent.
    async fn get_size(&self, location: &str) -> Result<u64>;

    /// Move an object from `temp_location` to `final_location` within the
    /// same namespace. Atomic for the local backend (a filesystem rename);
    /// best-effort copy-then-delete for remote backends.
    async fn finalize(&self, temp_location: &str, final_location: &str) -> Result<()>;
}

/// Threshold above which remote backends switch to multipart/resumable
/// uploads rather than a single request.
pub const MULTIPART_THRESHOLD_BYTES: u64 = 8 * 1024 * 1024;

/// Direct, fixed-key access to a remote object store, used by the remote
/// index store and lock manager — which address `index.json` and
/// `locks/<name>` by exact key, not by content hash — to get optimistic
/// concurrency (generation tokens) and put-if-absent out of the same
/// client/bucket/scope the archive [`StorageBackend`] uses.
#[async_trait]
pub trait RemoteObjectStore: Send + Sync {
    /// Fetch the object at `key`. Returns `None` (not an error) when absent.
    /// The second element of the tuple is the generation token (ETag /
    /// generation number) to use for a subsequent conditional write.
    async fn get_object(&self, key: &str) -> Result<Option<(Vec<u8>, String)>>;

    /// Write `data` to `key`, conditioned on the object's current token
    /// matching `expected_token` (`None` means "object must not exist").
    /// Returns the new token on success, `Err(ConcurrentModification)` on a
    /// precondition failure.
    async fn put_object_conditional(
        &self,
        key: &str,
        data: Vec<u8>,
        expected_token: Option<&str>,
    ) -> Result<String>;

    /// Create `key` only if it does not already exist. Returns `true` if
    /// this call created it, `false` if something else already had.
    async fn put_object_if_absent(&self, key: &str, data: Vec<u8>) -> Result<bool>;

    /// Idempotent: no error if the object is already absent.
    async fn delete_object(&self, key: &str) -> Result<()>;
}

pub use gcs::GcsBackend;
pub use local::LocalBackend;
pub use s3::S3Backend;
