//! Engine configuration: repository scope, backend selection, compression
//! policy, TTL and eviction caps. A plain `Default`-able struct rather than
//! a builder-DSL config crate, matching how this codebase already resolves
//! configuration elsewhere (CLI config, secret-manager config) — field
//! assignment plus a handful of named env-var overrides.

use crate::types::CompressionPolicy;
use std::path::PathBuf;

/// `REBUILD_INDEX=1|true` forces a manifest rebuild on the next `load()`.
pub const REBUILD_INDEX_ENV: &str = "REBUILD_INDEX";

#[derive(Debug, Clone, Default)]
pub enum BackendKind {
    #[default]
    Local,
    S3,
    Gcs,
}

#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    pub base_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct S3BackendConfig {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub prefix: String,
}

#[derive(Debug, Clone)]
pub struct GcsBackendConfig {
    pub bucket: String,
    pub prefix: String,
}

/// Repository scope plus everything the provider needs to pick and
/// configure a backend.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub owner: String,
    pub repo: String,
    pub backend: BackendKind,
    pub local: Option<LocalBackendConfig>,
    pub s3: Option<S3BackendConfig>,
    pub gcs: Option<GcsBackendConfig>,
    pub compression: CompressionPolicy,
    pub ttl_days: u32,
    pub max_cache_size_gb: u64,
}

impl CacheConfig {
    pub fn local(owner: impl Into<String>, repo: impl Into<String>, base_path: PathBuf) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            backend: BackendKind::Local,
            local: Some(LocalBackendConfig { base_path }),
            s3: None,
            gcs: None,
            compression: CompressionPolicy::default(),
            ttl_days: 7,
            max_cache_size_gb: 10,
        }
    }

    /// Repository scope path shared by local and remote layouts:
    /// `<owner>/<repo>`.
    pub fn scope_path(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    pub fn rebuild_index_requested() -> bool {
        std::env::var(REBUILD_INDEX_ENV)
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_path_joins_owner_and_repo() {
        let config = CacheConfig::local("acme", "widgets", PathBuf::from("/tmp/cache"));
        assert_eq!(config.scope_path(), "acme/widgets");
    }
}
