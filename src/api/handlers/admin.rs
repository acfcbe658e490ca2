use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::response::{ApiError, JSend};
use crate::object_store::Provider;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub worker_id: u16,
    pub provider: Provider,
    pub bucket: String,
    pub snapshots_enabled: bool,
    pub moderation_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub documents_deleted: u64,
    pub versions_deleted: u64,
    pub access_records_deleted: u64,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        worker_id: state.ids.worker_id(),
        provider: state.bucket.provider(),
        bucket: state.bucket.bucket_name().to_string(),
        snapshots_enabled: state.scheduler.is_some(),
        moderation_enabled: state.orchestrator.moderates(),
    })
}

/// Drops every relational row. Objects in storage are left alone.
pub async fn admin_purge(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<PurgeResponse>>, ApiError> {
    let stats = state.db.purge_all()?;
    tracing::warn!(?stats, "Purged all document rows");

    Ok(JSend::success(PurgeResponse {
        documents_deleted: stats.documents,
        versions_deleted: stats.versions,
        access_records_deleted: stats.access_records,
    }))
}
