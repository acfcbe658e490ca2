use std::time::Duration;

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::policy::{s3_policy_document, AccessKeyRequest};
use super::{
    validate_key, AccessKey, Bucket, ObjectInfo, ObjectStoreError, Provider, PutObjectInput,
    SignerType, UploadInfo,
};

/// STS rejects session durations outside this window.
const MIN_TTL: Duration = Duration::from_secs(900);
const MAX_TTL: Duration = Duration::from_secs(12 * 3600);

#[derive(Debug, Clone)]
pub struct S3Config {
    /// `Provider::S3` or `Provider::Minio`.
    pub provider: Provider,
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (always set for MinIO).
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Defaults to `endpoint` for MinIO and to the regional AWS STS endpoint for S3.
    pub sts_endpoint: Option<String>,
    /// MinIO issues temporary credentials on behalf of a dedicated STS user.
    pub sts_access_key_id: Option<String>,
    pub sts_secret_access_key: Option<String>,
    pub role_arn: String,
    pub public_endpoint: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// S3-compatible bucket (AWS S3 and MinIO).
pub struct S3Store {
    provider: Provider,
    bucket: String,
    region: String,
    role_arn: String,
    public_endpoint: String,
    s3: aws_sdk_s3::Client,
    sts: aws_sdk_sts::Client,
}

impl S3Store {
    pub async fn new(config: S3Config) -> Result<Self, ObjectStoreError> {
        if !matches!(config.provider, Provider::S3 | Provider::Minio) {
            return Err(ObjectStoreError::InvalidRequest(format!(
                "S3Store cannot serve provider {}",
                config.provider
            )));
        }

        let timeouts = TimeoutConfig::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build();

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .timeout_config(timeouts);
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id,
                secret,
                None,
                None,
                "docstore-static",
            ));
        }
        let shared = loader.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.provider == Provider::Minio || config.endpoint.is_some());
        if let Some(endpoint) = &config.endpoint {
            s3_config = s3_config.endpoint_url(endpoint);
        }

        let mut sts_config = aws_sdk_sts::config::Builder::from(&shared);
        if let (Some(key_id), Some(secret)) =
            (&config.sts_access_key_id, &config.sts_secret_access_key)
        {
            sts_config = sts_config.credentials_provider(Credentials::new(
                key_id,
                secret,
                None,
                None,
                "docstore-sts",
            ));
        }
        let sts_endpoint = config.sts_endpoint.clone().or_else(|| {
            (config.provider == Provider::Minio)
                .then(|| config.endpoint.clone())
                .flatten()
        });
        if let Some(endpoint) = sts_endpoint {
            sts_config = sts_config.endpoint_url(endpoint);
        }

        Ok(Self {
            provider: config.provider,
            bucket: config.bucket,
            region: config.region,
            role_arn: config.role_arn,
            public_endpoint: config.public_endpoint,
            s3: aws_sdk_s3::Client::from_conf(s3_config.build()),
            sts: aws_sdk_sts::Client::from_conf(sts_config.build()),
        })
    }
}

fn backend_error(op: &str, key: &str, err: impl std::error::Error) -> ObjectStoreError {
    ObjectStoreError::Backend(format!("{op} {key}: {}", DisplayErrorContext(err)))
}

/// STS session names allow `[\w+=,.@-]{2,64}`.
fn sanitize_session_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || "_+=,.@-".contains(*c))
        .take(64)
        .collect();
    while cleaned.len() < 2 {
        cleaned.push('_');
    }
    cleaned
}

#[async_trait]
impl Bucket for S3Store {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn bucket_name(&self) -> &str {
        &self.bucket
    }

    fn region(&self) -> &str {
        &self.region
    }

    fn public_endpoint(&self) -> &str {
        &self.public_endpoint
    }

    async fn put_object(&self, input: PutObjectInput) -> Result<UploadInfo, ObjectStoreError> {
        let key = validate_key(&input.name)?.to_string();
        let content_type = input.resolved_content_type();
        let size = input.size();

        let output = self
            .s3
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .content_length(size as i64)
            .body(ByteStream::from(input.data))
            .send()
            .await
            .map_err(|e| backend_error("put_object", &key, e))?;

        debug!(key = %key, size, "Stored object");
        Ok(UploadInfo {
            version_id: output.version_id().unwrap_or_default().to_string(),
        })
    }

    async fn get_object(&self, name: &str) -> Result<Bytes, ObjectStoreError> {
        let key = validate_key(name)?;
        let result = self
            .s3
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| backend_error("get_object body", key, e))?;
                Ok(data.into_bytes())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(ObjectStoreError::NotFound(key.to_string()));
                }
                Err(backend_error("get_object", key, service_error))
            }
        }
    }

    async fn get_object_version(
        &self,
        name: &str,
        version_id: &str,
    ) -> Result<Bytes, ObjectStoreError> {
        let key = validate_key(name)?;
        let result = self
            .s3
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .version_id(version_id)
            .send()
            .await;

        match result {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| backend_error("get_object body", key, e))?;
                Ok(data.into_bytes())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(ObjectStoreError::NotFound(format!("{key}@{version_id}")));
                }
                Err(backend_error("get_object", key, service_error))
            }
        }
    }

    async fn get_object_info(&self, name: &str) -> Result<ObjectInfo, ObjectStoreError> {
        let key = validate_key(name)?;
        let result = self
            .s3
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => Ok(ObjectInfo {
                version_id: output.version_id().unwrap_or_default().to_string(),
                size: output.content_length().unwrap_or_default().max(0) as u64,
            }),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    return Err(ObjectStoreError::NotFound(key.to_string()));
                }
                Err(backend_error("head_object", key, service_error))
            }
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let prefix = prefix.trim_start_matches('/');
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .s3
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|e| backend_error("list_objects_v2", prefix, e))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn copy_object(&self, src: &str, dest: &str) -> Result<UploadInfo, ObjectStoreError> {
        let src = validate_key(src)?;
        let dest = validate_key(dest)?;
        let output = self
            .s3
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, urlencoding::encode(src)))
            .key(dest)
            .send()
            .await
            .map_err(|e| backend_error("copy_object", src, e))?;

        Ok(UploadInfo {
            version_id: output.version_id().unwrap_or_default().to_string(),
        })
    }

    async fn generate_access_key(
        &self,
        request: &AccessKeyRequest,
    ) -> Result<AccessKey, ObjectStoreError> {
        request.validate(MIN_TTL, MAX_TTL)?;

        let policy = s3_policy_document(&self.bucket, request).to_string();
        let requested_expiry =
            Utc::now() + chrono::Duration::seconds(request.ttl.as_secs() as i64);

        let output = self
            .sts
            .assume_role()
            .role_arn(&self.role_arn)
            .role_session_name(sanitize_session_name(&request.session_name))
            .policy(policy)
            .duration_seconds(request.ttl.as_secs() as i32)
            .send()
            .await
            .map_err(|e| backend_error("assume_role", request.pattern(), e))?;

        let credentials = output.credentials().ok_or_else(|| {
            ObjectStoreError::Backend("assume_role returned no credentials".to_string())
        })?;
        let reported_expiry =
            DateTime::from_timestamp(credentials.expiration().secs(), 0).unwrap_or(requested_expiry);

        Ok(AccessKey {
            access_key: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
            signer_type: SignerType::V4,
            expires_at: reported_expiry.min(requested_expiry),
        })
    }
}
