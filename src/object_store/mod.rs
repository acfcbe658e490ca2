mod local;
mod oss;
pub mod policy;
mod s3;

pub use local::LocalStore;
pub use oss::{OssConfig, OssStore};
pub use policy::{AccessKeyRequest, AuthOps};
pub use s3::{S3Config, S3Store};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid object key: {0}")]
    InvalidKey(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Access denied: {0}")]
    AccessDenied(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Minio,
    Oss,
    S3,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Provider::Local => "local",
            Provider::Minio => "minio",
            Provider::Oss => "oss",
            Provider::S3 => "s3",
        };
        f.write_str(name)
    }
}

/// How a credential holder must sign requests made with an issued key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerType {
    Local,
    Oss,
    V4,
}

#[derive(Debug, Clone)]
pub struct PutObjectInput {
    pub name: String,
    pub data: Bytes,
    /// Inferred from `name` when absent.
    pub content_type: Option<String>,
}

impl PutObjectInput {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            content_type: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn resolved_content_type(&self) -> String {
        match &self.content_type {
            Some(ct) if !ct.is_empty() => ct.clone(),
            _ => content_type_for(&self.name),
        }
    }
}

/// Storage-assigned result of a write. `version_id` is the only authoritative
/// token for the bytes just written; it may be empty on unversioned buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub version_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub version_id: String,
    pub size: u64,
}

/// Temporary credential returned by [`Bucket::generate_access_key`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessKey {
    pub access_key: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub signer_type: SignerType,
    pub expires_at: DateTime<Utc>,
}

/// Provider-agnostic bucket. Implementations never retry; callers own the
/// retry policy.
#[async_trait]
pub trait Bucket: Send + Sync {
    fn provider(&self) -> Provider;

    fn bucket_name(&self) -> &str;

    fn region(&self) -> &str {
        ""
    }

    /// Endpoint that holders of issued credentials should talk to.
    fn public_endpoint(&self) -> &str {
        ""
    }

    async fn put_object(&self, input: PutObjectInput) -> Result<UploadInfo, ObjectStoreError>;

    async fn get_object(&self, name: &str) -> Result<Bytes, ObjectStoreError>;

    /// Fetch the exact bytes recorded under `version_id`.
    async fn get_object_version(
        &self,
        name: &str,
        version_id: &str,
    ) -> Result<Bytes, ObjectStoreError>;

    async fn get_object_info(&self, name: &str) -> Result<ObjectInfo, ObjectStoreError>;

    /// All keys starting with `prefix`, in lexicographic order.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    async fn copy_object(&self, src: &str, dest: &str) -> Result<UploadInfo, ObjectStoreError>;

    /// Copy every object under `src_dir` to the same relative key under
    /// `dest_dir`. Returns the number of objects copied.
    async fn copy_directory(&self, src_dir: &str, dest_dir: &str) -> Result<u64, ObjectStoreError> {
        let src_dir = src_dir.trim_matches('/');
        let dest_dir = dest_dir.trim_matches('/');
        if src_dir.is_empty() || dest_dir.is_empty() {
            return Err(ObjectStoreError::InvalidRequest(
                "source and destination directories must not be empty or root".to_string(),
            ));
        }

        let src_prefix = format!("{src_dir}/");
        let mut copied = 0;
        for key in self.list_objects(&src_prefix).await? {
            let Some(relative) = key.strip_prefix(&src_prefix) else {
                continue;
            };
            self.copy_object(&key, &format!("{dest_dir}/{relative}"))
                .await?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Exchange a least-privilege policy for a short-lived credential.
    async fn generate_access_key(
        &self,
        request: &AccessKeyRequest,
    ) -> Result<AccessKey, ObjectStoreError>;
}

/// Content type used when a write does not specify one.
pub fn content_type_for(name: &str) -> String {
    if name.ends_with(".json") {
        return "application/json".to_string();
    }
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Reject keys that could escape a prefix or address the bucket root.
pub(crate) fn validate_key(key: &str) -> Result<&str, ObjectStoreError> {
    let key = key.trim_start_matches('/');
    if key.is_empty()
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(ObjectStoreError::InvalidKey(key.to_string()));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_inference() {
        assert_eq!(content_type_for("a/document-meta.json"), "application/json");
        assert_eq!(content_type_for("a/medias/logo.png"), "image/png");
        assert_eq!(
            content_type_for("a/medias/blob"),
            "application/octet-stream"
        );
    }

    #[test]
    fn key_validation() {
        assert_eq!(validate_key("/doc/pages/p1.json").unwrap(), "doc/pages/p1.json");
        assert!(validate_key("doc/../etc/passwd").is_err());
        assert!(validate_key("doc//x").is_err());
        assert!(validate_key("").is_err());
        assert!(validate_key("/").is_err());
    }
}
