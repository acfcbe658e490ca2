use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::policy::{AccessKeyRequest, AuthOps, ScopedPolicy};
use super::{
    validate_key, AccessKey, Bucket, ObjectInfo, ObjectStoreError, Provider, PutObjectInput,
    SignerType, UploadInfo,
};

const MAX_TTL: Duration = Duration::from_secs(12 * 3600);

/// Versioned filesystem bucket for development and testing.
///
/// Layout under the base path:
/// - `heads/{key}`: current version id of `key`
/// - `versions/{key}/{version_id}`: immutable bytes of every write
///
/// Issued credentials are HMAC-signed session tokens that embed their
/// [`ScopedPolicy`]; [`LocalStore::authorize`] enforces them.
pub struct LocalStore {
    base_path: PathBuf,
    bucket_name: String,
    signing_key: hmac::Key,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let mut secret = [0u8; 32];
        SystemRandom::new()
            .fill(&mut secret)
            .map_err(|_| std::io::Error::other("failed to generate signing key"))?;
        Self::with_signing_secret(base_path, &secret)
    }

    /// Instances sharing a secret accept each other's session tokens.
    pub fn with_signing_secret<P: AsRef<Path>>(
        base_path: P,
        secret: &[u8],
    ) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(base_path.join("heads"))?;
        std::fs::create_dir_all(base_path.join("versions"))?;
        Ok(Self {
            base_path,
            bucket_name: "local".to_string(),
            signing_key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        })
    }

    pub fn with_bucket_name(mut self, bucket_name: impl Into<String>) -> Self {
        self.bucket_name = bucket_name.into();
        self
    }

    fn head_path(&self, key: &str) -> PathBuf {
        self.base_path.join("heads").join(key)
    }

    fn version_path(&self, key: &str, version_id: &str) -> PathBuf {
        self.base_path.join("versions").join(key).join(version_id)
    }

    async fn read_head(&self, key: &str) -> Result<String, ObjectStoreError> {
        let path = self.head_path(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(version_id) => Ok(version_id.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_version(&self, key: &str, data: &[u8]) -> Result<String, ObjectStoreError> {
        let version_id = uuid::Uuid::new_v4().simple().to_string();

        let version_path = self.version_path(key, &version_id);
        if let Some(parent) = version_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&version_path, data).await?;

        // Head is swapped by rename so readers never see a torn version id.
        let head_path = self.head_path(key);
        if let Some(parent) = head_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = head_path.with_extension(format!("{version_id}.tmp"));
        tokio::fs::write(&staging, version_id.as_bytes()).await?;
        tokio::fs::rename(&staging, &head_path).await?;

        Ok(version_id)
    }

    fn sign(&self, policy: &ScopedPolicy) -> Result<String, ObjectStoreError> {
        let claims = serde_json::to_vec(policy)
            .map_err(|e| ObjectStoreError::Backend(format!("failed to encode policy: {e}")))?;
        let tag = hmac::sign(&self.signing_key, &claims);
        Ok(format!(
            "{}.{}",
            base64_url_encode(&claims),
            base64_url_encode(tag.as_ref())
        ))
    }

    /// Verify a session token and check it grants `op` on `key`.
    pub fn authorize(
        &self,
        session_token: &str,
        op: AuthOps,
        key: &str,
    ) -> Result<ScopedPolicy, ObjectStoreError> {
        let denied = |reason: &str| ObjectStoreError::AccessDenied(format!("{key}: {reason}"));

        let (claims, tag) = session_token
            .split_once('.')
            .ok_or_else(|| denied("malformed session token"))?;
        let claims = base64_url_decode(claims).ok_or_else(|| denied("malformed session token"))?;
        let tag = base64_url_decode(tag).ok_or_else(|| denied("malformed session token"))?;
        hmac::verify(&self.signing_key, &claims, &tag)
            .map_err(|_| denied("invalid session token signature"))?;

        let policy: ScopedPolicy =
            serde_json::from_slice(&claims).map_err(|_| denied("malformed session token"))?;
        if policy.bucket != self.bucket_name {
            return Err(denied("credential issued for another bucket"));
        }

        let key = key.trim_start_matches('/');
        if !policy.permits(op, key, Utc::now().timestamp()) {
            return Err(denied("operation not permitted by credential"));
        }
        Ok(policy)
    }

    /// Read on behalf of a credential holder.
    pub async fn get_object_as(
        &self,
        session_token: &str,
        name: &str,
    ) -> Result<Bytes, ObjectStoreError> {
        self.authorize(session_token, AuthOps::GET_OBJECT, name)?;
        self.get_object(name).await
    }

    /// Write on behalf of a credential holder.
    pub async fn put_object_as(
        &self,
        session_token: &str,
        input: PutObjectInput,
    ) -> Result<UploadInfo, ObjectStoreError> {
        self.authorize(session_token, AuthOps::PUT_OBJECT, &input.name)?;
        self.put_object(input).await
    }
}

#[async_trait]
impl Bucket for LocalStore {
    fn provider(&self) -> Provider {
        Provider::Local
    }

    fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    async fn put_object(&self, input: PutObjectInput) -> Result<UploadInfo, ObjectStoreError> {
        let key = validate_key(&input.name)?;
        let version_id = self.write_version(key, &input.data).await?;
        Ok(UploadInfo { version_id })
    }

    async fn get_object(&self, name: &str) -> Result<Bytes, ObjectStoreError> {
        let key = validate_key(name)?;
        let version_id = self.read_head(key).await?;
        self.get_object_version(key, &version_id).await
    }

    async fn get_object_version(
        &self,
        name: &str,
        version_id: &str,
    ) -> Result<Bytes, ObjectStoreError> {
        let key = validate_key(name)?;
        if version_id.is_empty() || version_id.contains(['/', '.']) {
            return Err(ObjectStoreError::NotFound(format!("{key}@{version_id}")));
        }
        match tokio::fs::read(self.version_path(key, version_id)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(format!("{key}@{version_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_object_info(&self, name: &str) -> Result<ObjectInfo, ObjectStoreError> {
        let key = validate_key(name)?;
        let version_id = self.read_head(key).await?;
        let metadata = tokio::fs::metadata(self.version_path(key, &version_id)).await?;
        Ok(ObjectInfo {
            version_id,
            size: metadata.len(),
        })
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let prefix = prefix.trim_start_matches('/');
        let heads_root = self.base_path.join("heads");

        let mut keys = Vec::new();
        let mut pending = vec![heads_root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&heads_root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn copy_object(&self, src: &str, dest: &str) -> Result<UploadInfo, ObjectStoreError> {
        let data = self.get_object(src).await?;
        let dest = validate_key(dest)?;
        let version_id = self.write_version(dest, &data).await?;
        Ok(UploadInfo { version_id })
    }

    async fn generate_access_key(
        &self,
        request: &AccessKeyRequest,
    ) -> Result<AccessKey, ObjectStoreError> {
        request.validate(Duration::from_secs(1), MAX_TTL)?;

        let expires_at = Utc::now() + chrono::Duration::seconds(request.ttl.as_secs() as i64);
        let access_key = format!(
            "LK{}",
            uuid::Uuid::new_v4().simple().to_string().to_uppercase()
        );
        let policy = ScopedPolicy {
            access_key: access_key.clone(),
            bucket: self.bucket_name.clone(),
            pattern: request.pattern().to_string(),
            ops: request.ops.bits(),
            expires_at: expires_at.timestamp(),
        };

        Ok(AccessKey {
            session_token: self.sign(&policy)?,
            access_key,
            secret_access_key: uuid::Uuid::new_v4().simple().to_string(),
            signer_type: SignerType::Local,
            expires_at,
        })
    }
}

fn base64_url_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn base64_url_decode(data: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data)
        .ok()
}
