//! Blob storage abstraction over an S3-compatible bucket.
//!
//! Objects are written once under a namespaced UUID key and never mutated;
//! the public URL is reconstructable from the key alone, which is what lets
//! the proxy serve by `?key=` without a store round-trip.

use aws_sdk_s3::{primitives::ByteStream, types::ObjectCannedAcl};
use bytes::Bytes;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::pipeline::StoredAsset;

/// Namespace for stored objects: user uploads vs. generated output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPrefix {
    Inputs,
    Outputs,
}

impl KeyPrefix {
    pub fn slug(&self) -> &'static str {
        match self {
            KeyPrefix::Inputs => "inputs",
            KeyPrefix::Outputs => "outputs",
        }
    }
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("failed to upload object {key}: {source}")]
    Upload {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("public base URL cannot address key `{key}`: {reason}")]
    UrlResolution { key: String, reason: String },
}

/// Seam between the orchestrator and object storage. The production
/// implementation targets an S3-compatible endpoint; tests substitute an
/// in-memory double.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under a fresh key `<folder>/<prefix>/<uuid>.<ext>` with
    /// public-read visibility. The extension defaults to the MIME subtype
    /// when `ext` is absent. No retries; the caller decides what a failure
    /// means for the request.
    async fn upload(
        &self,
        bytes: Bytes,
        mime: &str,
        prefix: KeyPrefix,
        ext: Option<&str>,
    ) -> Result<StoredAsset, BlobError>;
}

pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    folder: String,
    public_base_url: Url,
}

impl S3BlobStore {
    pub fn new(
        client: aws_sdk_s3::Client,
        bucket: impl Into<String>,
        folder: impl Into<String>,
        public_base_url: Url,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            folder: folder.into(),
            public_base_url,
        }
    }

    /// Build the S3 client for an S3-compatible endpoint with static
    /// credentials and path-style addressing.
    pub async fn connect(storage: &crate::config::StorageConfig) -> Result<Self, BlobError> {
        let credentials = aws_sdk_s3::config::Credentials::new(
            storage.access_key.clone(),
            storage.secret_key.clone(),
            None,
            None,
            "remint-static",
        );
        let base = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new("us-east-1"))
            .credentials_provider(credentials)
            .endpoint_url(&storage.endpoint)
            .load()
            .await;
        let conf = aws_sdk_s3::config::Builder::from(&base)
            .force_path_style(true)
            .build();
        let public_base_url = Url::parse(&storage.public_base_url).map_err(|err| {
            BlobError::UrlResolution {
                key: String::new(),
                reason: err.to_string(),
            }
        })?;
        Ok(Self::new(
            aws_sdk_s3::Client::from_conf(conf),
            storage.bucket.clone(),
            storage.folder.clone(),
            public_base_url,
        ))
    }
}

#[async_trait::async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(
        &self,
        bytes: Bytes,
        mime: &str,
        prefix: KeyPrefix,
        ext: Option<&str>,
    ) -> Result<StoredAsset, BlobError> {
        let key = object_key(&self.folder, prefix, mime, ext);
        let url = resolve_public_url(&self.public_base_url, &key)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .content_type(mime)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|err| BlobError::Upload {
                key: key.clone(),
                source: Box::new(err),
            })?;

        tracing::debug!(%key, "stored blob");
        Ok(StoredAsset { key, url })
    }
}

/// `<folder>/<prefix>/<uuid>.<ext>`, extension defaulting to the substring
/// after `image/` in the MIME type.
pub fn object_key(folder: &str, prefix: KeyPrefix, mime: &str, ext: Option<&str>) -> String {
    let ext = ext
        .map(str::to_string)
        .unwrap_or_else(|| extension_for_mime(mime));
    format!("{folder}/{}/{}.{ext}", prefix.slug(), Uuid::new_v4())
}

pub fn extension_for_mime(mime: &str) -> String {
    mime.strip_prefix("image/").unwrap_or(mime).to_string()
}

pub fn resolve_public_url(base: &Url, key: &str) -> Result<String, BlobError> {
    let url = base.join(key).map_err(|err| BlobError::UrlResolution {
        key: key.to_string(),
        reason: err.to_string(),
    })?;
    Ok(url.to_string())
}
