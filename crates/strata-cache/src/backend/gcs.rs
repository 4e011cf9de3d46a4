//! Google Cloud Storage backend, spoken directly against the JSON API over
//! `reqwest` — this dependency set carries no GCS object-store SDK. The
//! caller supplies a bearer token (refreshed however their environment
//! already does that); this backend only knows how to use one.

use super::{RemoteObjectStore, StorageBackend};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use strata_core::{Error, Result};
use tokio::io::AsyncRead;

const API_BASE: &str = "https://storage.googleapis.com/storage/v1/b";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1/b";

#[derive(Debug, Deserialize)]
struct ObjectMetadata {
    generation: String,
    #[serde(default)]
    size: Option<String>,
}

pub struct GcsBackend {
    client: reqwest::Client,
    bucket: String,
    prefix: String,
    bearer_token: String,
}

impl GcsBackend {
    pub fn new(client: reqwest::Client, bucket: String, prefix: String, bearer_token: String) -> Self {
        let prefix = prefix.trim_matches('/').to_string();
        Self {
            client,
            bucket,
            prefix,
            bearer_token,
        }
    }

    fn object_name(&self, location: &str) -> String {
        if self.prefix.is_empty() {
            location.to_string()
        } else {
            format!("{}/{}", self.prefix, location)
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.bearer_token)
    }

    async fn metadata(&self, location: &str) -> Result<Option<ObjectMetadata>> {
        let object = self.object_name(location);
        let url = format!("{API_BASE}/{}/o/{}", self.bucket, urlencoding(&object));
        let response = self
            .auth(self.client.get(&url))
            .send()
            .await
            .map_err(|e| Error::backend("metadata", location, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::backend("metadata", location, response.status()));
        }
        Ok(Some(
            response
                .json()
                .await
                .map_err(|e| Error::backend("metadata", location, e))?,
        ))
    }

    async fn upload(&self, location: &str, data: Vec<u8>, query: &[(&str, String)]) -> Result<String> {
        let object = self.object_name(location);
        let mut url = reqwest::Url::parse(&format!("{UPLOAD_BASE}/{}/o", self.bucket))
            .map_err(|e| Error::Internal(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("uploadType", "media");
            pairs.append_pair("name", &object);
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }

        let response = self
            .auth(self.client.post(url).body(data))
            .send()
            .await
            .map_err(|e| Error::backend("put", location, e))?;

        if response.status() == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(Error::ConcurrentModification);
        }
        if !response.status().is_success() {
            return Err(Error::backend("put", location, response.status()));
        }
        let meta: ObjectMetadata = response
            .json()
            .await
            .map_err(|e| Error::backend("put", location, e))?;
        Ok(meta.generation)
    }
}

fn urlencoding(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[async_trait]
impl StorageBackend for GcsBackend {
    async fn put(&self, data: Vec<u8>, extension: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let hash = hex::encode(&hasher.finalize()[..8]);
        let location = format!("archives/sha256-{hash}.{extension}");

        if self.exists(&location).await? {
            return Ok(location);
        }
        self.upload(&location, data, &[]).await?;
        Ok(location)
    }

    async fn put_from_path(&self, local_path: &Path) -> Result<String> {
        let filename = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput("archive path has no file name".to_string()))?;
        let location = format!("archives/{filename}");
        let data = tokio::fs::read(local_path).await.map_err(Error::Io)?;
        self.upload(&location, data, &[]).await?;
        tokio::fs::remove_file(local_path).await.ok();
        Ok(location)
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>> {
        let object = self.object_name(location);
        let url = format!("{API_BASE}/{}/o/{}?alt=media", self.bucket, urlencoding(&object));
        let response = self
            .auth(self.client.get(&url))
            .send()
            .await
            .map_err(|e| Error::backend("get", location, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::ArchiveNotFound(location.to_string()));
        }
        if !response.status().is_success() {
            return Err(Error::backend("get", location, response.status()));
        }
        Ok(response
            .bytes()
            .await
            .map_err(|e| Error::backend("get", location, e))?
            .to_vec())
    }

    async fn get_stream(&self, location: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        let data = self.get(location).await?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let object = self.object_name(location);
        let url = format!("{API_BASE}/{}/o/{}", self.bucket, urlencoding(&object));
        let response = self
            .auth(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| Error::backend("delete", location, e))?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Error::backend("delete", location, response.status()))
        }
    }

    async fn exists(&self, location: &str) -> Result<bool> {
        Ok(self.metadata(location).await?.is_some())
    }

    async fn get_size(&self, location: &str) -> Result<u64> {
        let meta = self
            .metadata(location)
            .await?
            .ok_or_else(|| Error::ArchiveNotFound(location.to_string()))?;
        Ok(meta
            .size
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    async fn finalize(&self, temp_location: &str, final_location: &str) -> Result<()> {
        let data = self.get(temp_location).await?;
        self.upload(final_location, data, &[]).await?;
        self.delete(temp_location).await
    }
}

#[async_trait]
impl RemoteObjectStore for GcsBackend {
    async fn get_object(&self, key: &str) -> Result<Option<(Vec<u8>, String)>> {
        let Some(meta) = self.metadata(key).await? else {
            return Ok(None);
        };
        let data = self.get(key).await?;
        Ok(Some((data, meta.generation)))
    }

    async fn put_object_conditional(
        &self,
        key: &str,
        data: Vec<u8>,
        expected_token: Option<&str>,
    ) -> Result<String> {
        let query = match expected_token {
            Some(generation) => vec![("ifGenerationMatch", generation.to_string())],
            None => vec![("ifGenerationMatch", "0".to_string())],
        };
        self.upload(key, data, &query).await
    }

    async fn put_object_if_absent(&self, key: &str, data: Vec<u8>) -> Result<bool> {
        match self.put_object_conditional(key, data, None).await {
            Ok(_) => Ok(true),
            Err(Error::ConcurrentModification) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.delete(key).await
    }
}
