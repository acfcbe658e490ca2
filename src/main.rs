use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docstore::{
    api,
    config::{Config, StorageConfig},
    id_alloc::IdAllocator,
    lock::{LockService, MemoryCoordinator, RedisCoordinator, SnapshotTimes},
    moderation::{ModerationHook, WebhookReviewer},
    object_store::{self as obj, Bucket, Provider},
    permissions::{AllowAll, PermissionResolver},
    snapshot::{
        raster::HttpRasterizer, source::HttpSnapshotSource, AutoSnapshotScheduler,
        SchedulerSettings,
    },
    storage::Database,
    upload::UploadOrchestrator,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "docstore starting");

    let config = Config::load()?;
    info!(worker_id = config.node.worker_id, "Loaded configuration");

    let db = Database::open(&config.node.data_dir)?;
    info!("Database opened at: {}", config.node.data_dir);

    let ids = Arc::new(IdAllocator::new(config.node.worker_id)?);
    let bucket = open_bucket(&config.storage).await?;

    // Project permissions live in the team service; without it every
    // project check passes and only ownership and visibility apply.
    let permissions: Arc<dyn PermissionResolver> = Arc::new(AllowAll);

    let moderation = match &config.moderation_url {
        Some(url) => {
            let reviewer = WebhookReviewer::new(
                url.clone(),
                config.storage.connect_timeout,
                config.storage.read_timeout,
            )?;
            info!(url = %url, "Content moderation enabled");
            Some(ModerationHook::new(
                Arc::new(reviewer),
                Arc::clone(&bucket),
                db.clone(),
            ))
        }
        None => None,
    };

    let orchestrator = Arc::new(UploadOrchestrator::new(
        Arc::clone(&bucket),
        db.clone(),
        Arc::clone(&ids),
        Arc::clone(&permissions),
        moderation,
    ));

    let scheduler = match &config.snapshot.engine_url {
        Some(engine_url) => {
            let (locks, times): (Arc<dyn LockService>, Arc<dyn SnapshotTimes>) =
                match &config.snapshot.redis_url {
                    Some(redis_url) => {
                        let coordinator = Arc::new(RedisCoordinator::connect(redis_url).await?);
                        info!("Snapshot coordination via Redis");
                        (coordinator.clone(), coordinator)
                    }
                    None => {
                        let coordinator = Arc::new(MemoryCoordinator::new());
                        (coordinator.clone(), coordinator)
                    }
                };
            let source = HttpSnapshotSource::new(
                engine_url.clone(),
                config.snapshot.connect_timeout,
                config.snapshot.read_timeout,
            )?;
            let settings = SchedulerSettings {
                min_interval: config.snapshot.min_interval,
                lock_ttl: config.snapshot.lock_ttl,
                time_ttl: config.snapshot.time_ttl,
                raster_width: config.snapshot.raster_concurrency,
            };
            let mut scheduler = AutoSnapshotScheduler::new(
                locks,
                times,
                Arc::new(source),
                Arc::clone(&orchestrator),
                settings,
            );
            if let Some(raster_url) = &config.snapshot.raster_url {
                scheduler = scheduler.with_rasterizer(Arc::new(HttpRasterizer::new(
                    raster_url.clone(),
                    config.snapshot.connect_timeout,
                    config.snapshot.read_timeout,
                )?));
            }
            info!(url = %engine_url, "Auto-snapshot enabled");
            Some(Arc::new(scheduler))
        }
        None => None,
    };

    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        bucket,
        ids,
        permissions,
        orchestrator,
        scheduler,
    });

    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn open_bucket(storage: &StorageConfig) -> anyhow::Result<Arc<dyn Bucket>> {
    let bucket: Arc<dyn Bucket> = match storage.provider {
        Provider::Local => {
            let store = match &storage.local_signing_secret {
                Some(secret) => {
                    obj::LocalStore::with_signing_secret(&storage.local_storage_path, secret.as_bytes())?
                }
                None => obj::LocalStore::new(&storage.local_storage_path)?,
            };
            info!(
                "Using local storage backend at: {}",
                storage.local_storage_path
            );
            Arc::new(store.with_bucket_name(storage.bucket.clone()))
        }
        Provider::Minio | Provider::S3 => {
            let store = obj::S3Store::new(obj::S3Config {
                provider: storage.provider,
                bucket: storage.bucket.clone(),
                region: storage.region.clone(),
                endpoint: storage.endpoint.clone(),
                access_key_id: storage.access_key_id.clone(),
                secret_access_key: storage.secret_access_key.clone(),
                sts_endpoint: storage.sts_endpoint.clone(),
                sts_access_key_id: storage.sts_access_key_id.clone(),
                sts_secret_access_key: storage.sts_secret_access_key.clone(),
                role_arn: storage.role_arn(),
                public_endpoint: storage.public_endpoint(),
                connect_timeout: storage.connect_timeout,
                read_timeout: storage.read_timeout,
            })
            .await?;
            info!(provider = %storage.provider, bucket = %storage.bucket, "Using S3-compatible storage backend");
            Arc::new(store)
        }
        Provider::Oss => {
            // Presence of endpoint and keys is checked by Config::validate.
            let store = obj::OssStore::new(obj::OssConfig {
                bucket: storage.bucket.clone(),
                region: storage.region.clone(),
                endpoint: storage.endpoint.clone().unwrap_or_default(),
                access_key_id: storage.access_key_id.clone().unwrap_or_default(),
                secret_access_key: storage.secret_access_key.clone().unwrap_or_default(),
                sts_endpoint: storage
                    .sts_endpoint
                    .clone()
                    .unwrap_or_else(|| "sts.aliyuncs.com".to_string()),
                role_arn: storage.role_arn(),
                public_endpoint: storage.public_endpoint(),
                connect_timeout: storage.connect_timeout,
                read_timeout: storage.read_timeout,
            })?;
            info!(bucket = %storage.bucket, "Using OSS storage backend");
            Arc::new(store)
        }
    };

    if storage.provider != Provider::Local && storage.role_arn().is_empty() {
        warn!("No role configured; scoped credential issuance will fail");
    }
    Ok(bucket)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
