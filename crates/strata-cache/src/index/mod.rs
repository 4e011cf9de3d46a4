//! Index store: the authoritative `index.json` for a repository scope.
//! Local writes are protected by an atomic rename; remote writes carry an
//! optimistic-concurrency token (ETag / generation number) as a second,
//! store-native guard against the rare case where the lock manager's
//! exclusivity is violated (e.g. a reclaimed "stale" lock whose original
//! holder wasn't actually dead).

pub mod local;
pub mod remote;

use crate::types::CacheIndex;
use async_trait::async_trait;
use strata_core::Result;

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Load the current index. The second element is an opaque
    /// concurrency token to pass back into [`IndexStore::save`]; `None` for
    /// backends (local) that don't use one.
    async fn load(&self) -> Result<(CacheIndex, Option<String>)>;

    /// Persist `index`. `expected_token` must match what [`load`] returned,
    /// or the backend's own current value if loaded separately.
    async fn save(&self, index: &CacheIndex, expected_token: Option<&str>) -> Result<Option<String>>;
}

pub use local::LocalIndexStore;
pub use remote::RemoteIndexStore;
