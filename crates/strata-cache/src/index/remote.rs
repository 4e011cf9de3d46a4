//! Remote index store: `index.json` addressed by fixed key through
//! [`RemoteObjectStore`], guarded by its generation token. A missing index
//! is treated as empty rather than triggering a rebuild — remote backends
//! have no equivalent of the local sidecar-manifest directory scan.

use super::IndexStore;
use crate::backend::RemoteObjectStore;
use crate::types::CacheIndex;
use async_trait::async_trait;
use std::sync::Arc;
use strata_core::Result;

const INDEX_KEY: &str = "index.json";

pub struct RemoteIndexStore {
    store: Arc<dyn RemoteObjectStore>,
}

impl RemoteIndexStore {
    pub fn new(store: Arc<dyn RemoteObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl IndexStore for RemoteIndexStore {
    async fn load(&self) -> Result<(CacheIndex, Option<String>)> {
        match self.store.get_object(INDEX_KEY).await? {
            Some((bytes, token)) => {
                let index: CacheIndex = serde_json::from_slice(&bytes)?;
                Ok((index, Some(token)))
            }
            None => Ok((CacheIndex::empty(), None)),
        }
    }

    async fn save(&self, index: &CacheIndex, expected_token: Option<&str>) -> Result<Option<String>> {
        let bytes = serde_json::to_vec(index)?;
        let token = self
            .store
            .put_object_conditional(INDEX_KEY, bytes, expected_token)
            .await?;
        Ok(Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CURRENT_VERSION;
    use std::collections::HashMap;
    use strata_core::Error;
    use tokio::sync::Mutex;

    struct FakeStore {
        objects: Mutex<HashMap<String, (Vec<u8>, u64)>>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                objects: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteObjectStore for FakeStore {
        async fn get_object(&self, key: &str) -> Result<Option<(Vec<u8>, String)>> {
            let objects = self.objects.lock().await;
            Ok(objects.get(key).map(|(d, g)| (d.clone(), g.to_string())))
        }

        async fn put_object_conditional(
            &self,
            key: &str,
            data: Vec<u8>,
            expected_token: Option<&str>,
        ) -> Result<String> {
            let mut objects = self.objects.lock().await;
            let current = objects.get(key).map(|(_, g)| *g);
            match (current, expected_token) {
                (None, None) => {}
                (Some(g), Some(t)) if g.to_string() == t => {}
                _ => return Err(Error::ConcurrentModification),
            }
            let next_gen = current.unwrap_or(0) + 1;
            objects.insert(key.to_string(), (data, next_gen));
            Ok(next_gen.to_string())
        }

        async fn put_object_if_absent(&self, key: &str, data: Vec<u8>) -> Result<bool> {
            let mut objects = self.objects.lock().await;
            if objects.contains_key(key) {
                return Ok(false);
            }
            objects.insert(key.to_string(), (data, 1));
            Ok(true)
        }

        async fn delete_object(&self, key: &str) -> Result<()> {
            self.objects.lock().await.remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn missing_index_loads_as_empty() {
        let store = RemoteIndexStore::new(Arc::new(FakeStore::new()));
        let (index, token) = store.load().await.unwrap();
        assert!(index.entries.is_empty());
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_with_token() {
        let store = RemoteIndexStore::new(Arc::new(FakeStore::new()));
        let index = CacheIndex {
            version: CURRENT_VERSION.to_string(),
            entries: vec![],
        };
        let token = store.save(&index, None).await.unwrap();
        assert!(token.is_some());
        let (loaded, loaded_token) = store.load().await.unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded_token, token);
    }

    #[tokio::test]
    async fn stale_token_is_concurrent_modification() {
        let store = RemoteIndexStore::new(Arc::new(FakeStore::new()));
        let index = CacheIndex {
            version: CURRENT_VERSION.to_string(),
            entries: vec![],
        };
        store.save(&index, None).await.unwrap();
        let err = store.save(&index, Some("stale-token")).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentModification));
    }
}
