use std::time::Duration;

use thiserror::Error;

use crate::id_alloc::MAX_WORKER_ID;
use crate::object_store::Provider;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub snapshot: SnapshotConfig,
    /// Moderation webhook base URL. Unset disables moderation.
    pub moderation_url: Option<String>,
    /// Enables dangerous operations like purge. Must never be true in production.
    pub test_mode: bool,
    /// Maximum size in bytes of a single upload frame
    pub max_upload_size: u64,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
    pub worker_id: u16,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub provider: Provider,
    /// Directory for the local provider
    pub local_storage_path: String,
    /// Shared secret for local session tokens. Random per process when unset.
    pub local_signing_secret: Option<String>,
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub sts_endpoint: Option<String>,
    pub sts_access_key_id: Option<String>,
    pub sts_secret_access_key: Option<String>,
    pub account_id: Option<String>,
    pub role_name: Option<String>,
    /// Endpoint handed to credential holders; defaults to `endpoint`.
    pub public_url: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Shared coordinator. Unset means a single-instance, in-process lock.
    pub redis_url: Option<String>,
    /// Editing engine snapshot endpoint. Unset disables the scheduler.
    pub engine_url: Option<String>,
    pub min_interval: Duration,
    /// Lease on a document's snapshot cycle. The lease is not renewed, so a
    /// cycle that runs longer than this (slow fetch, rasters, upload) can
    /// overlap with one started by another instance.
    pub lock_ttl: Duration,
    pub time_ttl: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub raster_url: Option<String>,
    pub raster_concurrency: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Local,
            local_storage_path: "./files".to_string(),
            local_signing_secret: None,
            bucket: "documents".to_string(),
            endpoint: None,
            region: String::new(),
            access_key_id: None,
            secret_access_key: None,
            sts_endpoint: None,
            sts_access_key_id: None,
            sts_secret_access_key: None,
            account_id: None,
            role_name: None,
            public_url: None,
            connect_timeout: Duration::from_millis(5000),
            read_timeout: Duration::from_millis(30_000),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            engine_url: None,
            min_interval: Duration::from_secs(600),
            lock_ttl: Duration::from_secs(10),
            time_ttl: Duration::from_secs(3600),
            connect_timeout: Duration::from_millis(5000),
            read_timeout: Duration::from_millis(60_000),
            raster_url: None,
            raster_concurrency: 5,
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::ValidationError(format!("{name} has invalid value {raw:?}"))),
    }
}

fn millis(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(parsed::<u64>(name)?.map_or(default, Duration::from_millis))
}

fn secs(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(parsed::<u64>(name)?.map_or(default, Duration::from_secs))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let bind_address = var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let data_dir = var("DATA_DIR").unwrap_or_else(|| "./data".to_string());
        let worker_id = parsed("WORKER_ID")?.unwrap_or(0);

        let test_mode = var("TEST_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let max_upload_size = parsed("MAX_UPLOAD_SIZE")?.unwrap_or(50 * 1024 * 1024); // 50MB

        let provider = match var("STORAGE_PROVIDER")
            .unwrap_or_else(|| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "local" => Provider::Local,
            "minio" => Provider::Minio,
            "s3" => Provider::S3,
            "oss" => Provider::Oss,
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "STORAGE_PROVIDER must be one of local, minio, s3, oss (got {other:?})"
                )))
            }
        };

        let storage_defaults = StorageConfig::default();
        let storage = StorageConfig {
            provider,
            local_storage_path: var("LOCAL_STORAGE_PATH")
                .unwrap_or(storage_defaults.local_storage_path),
            local_signing_secret: var("LOCAL_SIGNING_SECRET"),
            bucket: var("STORAGE_BUCKET").unwrap_or(storage_defaults.bucket),
            endpoint: var("STORAGE_ENDPOINT"),
            region: var("STORAGE_REGION").unwrap_or_default(),
            access_key_id: var("STORAGE_ACCESS_KEY_ID"),
            secret_access_key: var("STORAGE_SECRET_ACCESS_KEY"),
            sts_endpoint: var("STORAGE_STS_ENDPOINT"),
            sts_access_key_id: var("STORAGE_STS_ACCESS_KEY_ID"),
            sts_secret_access_key: var("STORAGE_STS_SECRET_ACCESS_KEY"),
            account_id: var("STORAGE_ACCOUNT_ID"),
            role_name: var("STORAGE_ROLE_NAME"),
            public_url: var("STORAGE_PUBLIC_URL"),
            connect_timeout: millis("STORAGE_CONNECT_TIMEOUT_MS", storage_defaults.connect_timeout)?,
            read_timeout: millis("STORAGE_READ_TIMEOUT_MS", storage_defaults.read_timeout)?,
        };

        let snapshot_defaults = SnapshotConfig::default();
        let snapshot = SnapshotConfig {
            redis_url: var("REDIS_URL"),
            engine_url: var("SNAPSHOT_ENGINE_URL"),
            min_interval: secs("SNAPSHOT_MIN_INTERVAL_SECS", snapshot_defaults.min_interval)?,
            lock_ttl: secs("SNAPSHOT_LOCK_TTL_SECS", snapshot_defaults.lock_ttl)?,
            time_ttl: secs("SNAPSHOT_TIME_TTL_SECS", snapshot_defaults.time_ttl)?,
            connect_timeout: millis(
                "SNAPSHOT_CONNECT_TIMEOUT_MS",
                snapshot_defaults.connect_timeout,
            )?,
            read_timeout: millis("SNAPSHOT_READ_TIMEOUT_MS", snapshot_defaults.read_timeout)?,
            raster_url: var("RASTER_URL"),
            raster_concurrency: parsed("RASTER_CONCURRENCY")?
                .unwrap_or(snapshot_defaults.raster_concurrency),
        };

        let config = Config {
            node: NodeConfig {
                bind_address,
                data_dir,
                worker_id,
            },
            storage,
            snapshot,
            moderation_url: var("MODERATION_URL"),
            test_mode,
            max_upload_size,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.worker_id > MAX_WORKER_ID {
            return Err(ConfigError::ValidationError(format!(
                "WORKER_ID must be between 0 and {MAX_WORKER_ID}"
            )));
        }

        if self.storage.bucket.is_empty() {
            return Err(ConfigError::ValidationError(
                "STORAGE_BUCKET cannot be empty".to_string(),
            ));
        }

        match self.storage.provider {
            Provider::Local => {}
            Provider::Minio | Provider::Oss => {
                if self.storage.endpoint.is_none() {
                    return Err(ConfigError::ValidationError(format!(
                        "STORAGE_ENDPOINT is required when STORAGE_PROVIDER={}",
                        self.storage.provider
                    )));
                }
                if self.storage.access_key_id.is_none() || self.storage.secret_access_key.is_none()
                {
                    return Err(ConfigError::ValidationError(format!(
                        "STORAGE_ACCESS_KEY_ID and STORAGE_SECRET_ACCESS_KEY are required when STORAGE_PROVIDER={}",
                        self.storage.provider
                    )));
                }
            }
            Provider::S3 => {
                if self.storage.region.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "STORAGE_REGION is required when STORAGE_PROVIDER=s3".to_string(),
                    ));
                }
            }
        }

        if self.storage.provider == Provider::Oss && self.storage.role_arn().is_empty() {
            return Err(ConfigError::ValidationError(
                "STORAGE_ACCOUNT_ID and STORAGE_ROLE_NAME are required when STORAGE_PROVIDER=oss"
                    .to_string(),
            ));
        }

        if self.snapshot.raster_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "RASTER_CONCURRENCY must be greater than 0".to_string(),
            ));
        }

        if self.snapshot.min_interval.is_zero()
            || self.snapshot.lock_ttl.is_zero()
            || self.snapshot.time_ttl.is_zero()
        {
            return Err(ConfigError::ValidationError(
                "snapshot intervals and TTLs must be greater than 0".to_string(),
            ));
        }

        if self.snapshot.engine_url.is_some() && !self.snapshot.lease_covers_engine_read() {
            tracing::warn!(
                lock_ttl_secs = self.snapshot.lock_ttl.as_secs(),
                read_timeout_ms = self.snapshot.read_timeout.as_millis() as u64,
                "SNAPSHOT_LOCK_TTL_SECS is shorter than SNAPSHOT_READ_TIMEOUT_MS; \
                 a slow engine fetch can outlive the snapshot lease"
            );
        }

        if self.snapshot.engine_url.is_some() && self.snapshot.redis_url.is_none() {
            tracing::warn!(
                "REDIS_URL is not set; snapshot locking only covers this instance. \
                 Do not run more than one instance in this mode."
            );
        }

        Ok(())
    }
}

impl SnapshotConfig {
    /// Whether the lease outlasts the slowest engine fetch the client allows.
    pub fn lease_covers_engine_read(&self) -> bool {
        self.lock_ttl >= self.read_timeout
    }
}

impl StorageConfig {
    /// Role assumed when issuing scoped credentials, in the provider's ARN form.
    pub fn role_arn(&self) -> String {
        match (&self.account_id, &self.role_name) {
            (Some(account), Some(role)) => match self.provider {
                Provider::Oss => format!("acs:ram::{account}:role/{role}"),
                _ => format!("arn:aws:iam::{account}:role/{role}"),
            },
            _ => String::new(),
        }
    }

    /// Endpoint returned to credential holders.
    pub fn public_endpoint(&self) -> String {
        self.public_url
            .clone()
            .or_else(|| self.endpoint.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(storage: StorageConfig) -> Config {
        Config {
            node: NodeConfig {
                bind_address: "127.0.0.1:0".into(),
                data_dir: "./data".into(),
                worker_id: 1,
            },
            storage,
            snapshot: SnapshotConfig::default(),
            moderation_url: None,
            test_mode: false,
            max_upload_size: 1024,
        }
    }

    #[test]
    fn local_defaults_are_valid() {
        assert!(config(StorageConfig::default()).validate().is_ok());
    }

    #[test]
    fn short_lease_is_reported_but_allowed() {
        let mut cfg = config(StorageConfig::default());
        cfg.snapshot.engine_url = Some("http://engine.local/snapshot".into());
        assert!(!cfg.snapshot.lease_covers_engine_read());
        assert!(cfg.validate().is_ok());

        cfg.snapshot.lock_ttl = Duration::from_secs(90);
        assert!(cfg.snapshot.lease_covers_engine_read());
    }

    #[test]
    fn worker_id_is_bounded() {
        let mut cfg = config(StorageConfig::default());
        cfg.node.worker_id = MAX_WORKER_ID + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn remote_providers_need_credentials() {
        let cfg = config(StorageConfig {
            provider: Provider::Minio,
            endpoint: Some("http://minio:9000".into()),
            ..Default::default()
        });
        assert!(cfg.validate().is_err());

        let cfg = config(StorageConfig {
            provider: Provider::Oss,
            endpoint: Some("oss-cn-hangzhou.aliyuncs.com".into()),
            access_key_id: Some("ak".into()),
            secret_access_key: Some("sk".into()),
            ..Default::default()
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn role_arn_follows_provider() {
        let storage = StorageConfig {
            provider: Provider::Oss,
            account_id: Some("123".into()),
            role_name: Some("docs".into()),
            ..Default::default()
        };
        assert_eq!(storage.role_arn(), "acs:ram::123:role/docs");

        let storage = StorageConfig {
            provider: Provider::S3,
            ..storage
        };
        assert_eq!(storage.role_arn(), "arn:aws:iam::123:role/docs");
    }
}
