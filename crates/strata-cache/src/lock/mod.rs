//! Distributed lock manager: serializes the locked phase of a save (index
//! mutation, atomic rename, eviction) across whatever processes share a
//! repository's storage scope. Local and remote backends need different
//! primitives (an exclusive file vs. a conditional put), so both live behind
//! one trait the provider never has to branch on.

pub mod local;
pub mod remote;

use async_trait::async_trait;
use strata_core::Result;

/// Held until [`LockGuard::release`] is called or the guard is dropped
/// without release — callers should always release explicitly on every
/// exit path of the critical section rather than rely on `Drop`, since
/// releasing is fallible (it's a network call for the remote variant).
#[async_trait]
pub trait LockGuard: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire the named lock, retrying with backoff until the manager's
    /// budget is exhausted. `Err(LockAcquisitionFailed)` on exhaustion.
    async fn acquire(&self, name: &str) -> Result<Box<dyn LockGuard>>;
}

pub use local::LocalLockManager;
pub use remote::RemoteLockManager;
