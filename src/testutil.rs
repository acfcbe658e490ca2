//! Shared test helpers for in-crate tests.

use std::sync::Arc;

use bytes::Bytes;

use crate::config::{Config, NodeConfig, SnapshotConfig, StorageConfig};
use crate::id_alloc::IdAllocator;
use crate::manifest::Manifest;
use crate::object_store::LocalStore;
use crate::permissions::{PermissionResolver, StaticPermissions};
use crate::storage::models::Document;
use crate::storage::Database;
use crate::upload::{
    DocumentBundle, MediaPayload, UploadHeader, UploadOrchestrator, UploadRequest,
};
use crate::AppState;

/// Create a test AppState with a temporary database and local object store.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    test_state_with(temp_dir, Arc::new(StaticPermissions::new()))
}

pub fn test_state_with(
    temp_dir: &tempfile::TempDir,
    permissions: Arc<dyn PermissionResolver>,
) -> Arc<AppState> {
    let data_dir = temp_dir.path().join("data");
    let files_dir = temp_dir.path().join("files");

    let config = Config {
        node: NodeConfig {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
            worker_id: 1,
        },
        storage: StorageConfig {
            local_storage_path: files_dir.to_string_lossy().to_string(),
            ..Default::default()
        },
        snapshot: SnapshotConfig::default(),
        moderation_url: None,
        test_mode: true,
        max_upload_size: 10 * 1024 * 1024, // 10MB for tests
    };

    let db = Database::open(&data_dir).expect("Failed to open test database");
    let bucket: Arc<dyn crate::object_store::Bucket> = Arc::new(
        LocalStore::new(&files_dir).expect("Failed to create test object store"),
    );
    let ids = Arc::new(IdAllocator::new(config.node.worker_id).expect("valid worker id"));
    let orchestrator = Arc::new(UploadOrchestrator::new(
        Arc::clone(&bucket),
        db.clone(),
        Arc::clone(&ids),
        Arc::clone(&permissions),
        None,
    ));

    Arc::new(AppState {
        config,
        db,
        bucket,
        ids,
        permissions,
        orchestrator,
        scheduler: None,
    })
}

/// Serve the router on an ephemeral port; returns the base URL.
pub async fn serve(state: Arc<AppState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    let app = crate::api::create_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// First upload of a one-page document with one media file.
pub async fn seed_document(state: &AppState, owner: i64, project_id: Option<i64>) -> Document {
    let document_meta: Manifest = serde_json::from_value(serde_json::json!({
        "name": "Seeded",
        "pagesList": [{ "id": "p1" }],
    }))
    .expect("valid manifest");

    let request = UploadRequest {
        header: UploadHeader {
            user_id: Some(owner),
            project_id,
            ..Default::default()
        },
        bundle: DocumentBundle {
            document_meta,
            pages: vec![serde_json::json!({ "id": "p1", "shapes": [] })],
            media_names: vec!["logo.png".to_string()],
            medias_size: 0,
            document_text: None,
            freesymbols: None,
            page_images: Vec::new(),
        },
        medias: vec![MediaPayload {
            name: "logo.png".to_string(),
            content: Bytes::from_static(b"\x89PNG"),
        }],
    };

    state
        .orchestrator
        .upload(request)
        .await
        .expect("seed upload")
        .document
}
