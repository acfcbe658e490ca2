//! docstore - Document storage and versioning pipeline
//!
//! This crate persists multi-part documents (pages, media, symbol
//! definitions) into object storage and tracks their versions:
//! - Snowflake-style ID allocation per worker
//! - Swappable object storage backends (local filesystem, S3/MinIO, OSS) with
//!   scoped, short-lived credential issuance
//! - redb embedded database for document and version rows
//! - Concurrent upload orchestration over a WebSocket session
//! - Throttled, cross-instance-safe auto-snapshots from the live-editing engine

pub mod api;
pub mod config;
pub mod id_alloc;
pub mod lock;
pub mod manifest;
pub mod moderation;
pub mod object_store;
pub mod permissions;
pub mod snapshot;
pub mod storage;
pub mod upload;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use config::Config;
use id_alloc::IdAllocator;
use object_store::Bucket;
use permissions::PermissionResolver;
use snapshot::AutoSnapshotScheduler;
use storage::Database;
use upload::UploadOrchestrator;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub bucket: Arc<dyn Bucket>,
    pub ids: Arc<IdAllocator>,
    pub permissions: Arc<dyn PermissionResolver>,
    pub orchestrator: Arc<UploadOrchestrator>,
    /// Present when a snapshot engine is configured.
    pub scheduler: Option<Arc<AutoSnapshotScheduler>>,
}
