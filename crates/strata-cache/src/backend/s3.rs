//! S3-compatible storage backend: archive objects under `archives/`, plus
//! direct fixed-key access to `index.json`/`locks/<name>` via
//! [`RemoteObjectStore`] using `If-Match`/`If-None-Match` conditional
//! `PutObject` for optimistic concurrency instead of a real compare-and-swap.

use super::{RemoteObjectStore, StorageBackend, MULTIPART_THRESHOLD_BYTES};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use sha2::{Digest, Sha256};
use std::path::Path;
use strata_core::{Error, Result};
use tokio::io::AsyncRead;

pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Backend {
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        let prefix = prefix.trim_matches('/').to_string();
        Self { client, bucket, prefix }
    }

    fn object_key(&self, location: &str) -> String {
        if self.prefix.is_empty() {
            location.to_string()
        } else {
            format!("{}/{}", self.prefix, location)
        }
    }

    fn is_multipart_size(size: u64) -> bool {
        size >= MULTIPART_THRESHOLD_BYTES
    }

    fn not_found(location: &str) -> Error {
        Error::ArchiveNotFound(location.to_string())
    }
}

fn is_not_found<E>(err: &aws_sdk_s3::error::SdkError<E>) -> bool
where
    E: std::error::Error + 'static,
{
    match err {
        aws_sdk_s3::error::SdkError::ServiceError(service_err) => {
            service_err.raw().status().as_u16() == 404
        }
        _ => false,
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn put(&self, data: Vec<u8>, extension: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let hash = hex::encode(&hasher.finalize()[..8]);
        let location = format!("archives/sha256-{hash}.{extension}");
        let key = self.object_key(&location);

        if self.exists(&location).await? {
            return Ok(location);
        }

        self.upload(&key, data).await?;
        Ok(location)
    }

    async fn put_from_path(&self, local_path: &Path) -> Result<String> {
        let filename = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput("archive path has no file name".to_string()))?;
        let location = format!("archives/{filename}");
        let key = self.object_key(&location);
        let data = tokio::fs::read(local_path).await.map_err(Error::Io)?;
        self.upload(&key, data).await?;
        tokio::fs::remove_file(local_path).await.ok();
        Ok(location)
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>> {
        let key = self.object_key(location);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    Self::not_found(location)
                } else {
                    Error::backend("get", location, e)
                }
            })?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| Error::backend("get", location, e))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn get_stream(&self, location: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        let data = self.get(location).await?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let key = self.object_key(location);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Error::backend("delete", location, e))?;
        Ok(())
    }

    async fn exists(&self, location: &str) -> Result<bool> {
        let key = self.object_key(location);
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(Error::backend("head", location, e)),
        }
    }

    async fn get_size(&self, location: &str) -> Result<u64> {
        let key = self.object_key(location);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    Self::not_found(location)
                } else {
                    Error::backend("head", location, e)
                }
            })?;
        Ok(output.content_length().unwrap_or(0).max(0) as u64)
    }

    async fn finalize(&self, temp_location: &str, final_location: &str) -> Result<()> {
        let temp_key = self.object_key(temp_location);
        let final_key = self.object_key(final_location);
        let source = format!("{}/{}", self.bucket, temp_key);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&source)
            .key(&final_key)
            .send()
            .await
            .map_err(|e| Error::backend("finalize", final_location, e))?;
        self.delete(temp_location).await
    }
}

impl S3Backend {
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<()> {
        if Self::is_multipart_size(data.len() as u64) {
            self.upload_multipart(key, data).await
        } else {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Error::backend("put", key, e))?;
            Ok(())
        }
    }

    async fn upload_multipart(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::backend("create_multipart_upload", key, e))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| Error::backend("create_multipart_upload", key, "missing upload id"))?
            .to_string();

        let part_size = MULTIPART_THRESHOLD_BYTES as usize;
        let mut parts = Vec::new();
        for (idx, chunk) in data.chunks(part_size).enumerate() {
            let part_number = (idx + 1) as i32;
            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| Error::backend("upload_part", key, e))?;
            parts.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(part.e_tag().map(String::from))
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                aws_sdk_s3::types::CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Error::backend("complete_multipart_upload", key, e))?;
        Ok(())
    }
}

#[async_trait]
impl RemoteObjectStore for S3Backend {
    async fn get_object(&self, key: &str) -> Result<Option<(Vec<u8>, String)>> {
        let full_key = self.object_key(key);
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(output) => {
                let etag = output.e_tag().unwrap_or_default().to_string();
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| Error::backend("get", key, e))?;
                Ok(Some((bytes.into_bytes().to_vec(), etag)))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(Error::backend("get", key, e)),
        }
    }

    async fn put_object_conditional(
        &self,
        key: &str,
        data: Vec<u8>,
        expected_token: Option<&str>,
    ) -> Result<String> {
        let full_key = self.object_key(key);
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(ByteStream::from(data));

        request = match expected_token {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };

        let output = request.send().await.map_err(|e| {
            if is_precondition_failed(&e) {
                Error::ConcurrentModification
            } else {
                Error::backend("put_conditional", key, e)
            }
        })?;

        Ok(output.e_tag().unwrap_or_default().to_string())
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

fn is_precondition_failed<E>(err: &aws_sdk_s3::error::SdkError<E>) -> bool
where
    E: std::error::Error + 'static,
{
    match err {
        aws_sdk_s3::error::SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            status == 412 || status == 409
        }
        _ => false,
    }
}
