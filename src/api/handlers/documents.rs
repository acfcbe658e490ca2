use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::api::response::{ApiError, AppQuery, JSend, Page};
use crate::object_store::{AccessKeyRequest, AuthOps, Provider, SignerType};
use crate::permissions::PermType;
use crate::snapshot::SnapshotOutcome;
use crate::storage::models::{Document, DocumentVersion};
use crate::AppState;

const READ_KEY_TTL: Duration = Duration::from_secs(3600);
const WRITE_KEY_TTL: Duration = Duration::from_secs(900);

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AccessKeyParams {
    pub user_id: i64,
    #[serde(default)]
    pub write: bool,
}

#[derive(Debug, Serialize)]
pub struct AccessKeyResponse {
    pub access_key: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub signer_type: SignerType,
    pub expires_at: String,
    pub provider: Provider,
    pub region: String,
    pub bucket_name: String,
    pub endpoint: String,
    /// Storage prefix the credential is scoped to.
    pub path: String,
    /// Current manifest version.
    pub version_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListVersionsParams {
    pub user_id: i64,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub id: String,
    pub document_id: String,
    pub version_id: String,
    pub last_cmd_id: u64,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct OwnerParams {
    pub user_id: i64,
}

// ============================================================================
// Handlers
// ============================================================================

/// Issue a temporary credential scoped to the document's storage prefix.
pub async fn access_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    AppQuery(params): AppQuery<AccessKeyParams>,
) -> Result<Json<JSend<AccessKeyResponse>>, ApiError> {
    let document = live_document(&state, id)?;

    if document.is_locked() && document.user_id != params.user_id {
        return Err(ApiError::forbidden("Document is locked pending review"));
    }

    let required = if params.write {
        PermType::Editable
    } else {
        PermType::ReadOnly
    };
    require_perm(&state, &document, params.user_id, required).await?;

    let (ops, ttl) = if params.write {
        (AuthOps::GET_OBJECT | AuthOps::PUT_OBJECT, WRITE_KEY_TTL)
    } else {
        (AuthOps::READ, READ_KEY_TTL)
    };
    let request = AccessKeyRequest::new(format!("{}/*", document.path), ops, ttl)
        .with_session_name(format!("doc-{id}-user-{}", params.user_id));

    let key = state
        .bucket
        .generate_access_key(&request)
        .await
        .inspect_err(|e| {
            tracing::warn!(document_id = id, error = %e, "Credential issuance failed")
        })?;

    state
        .db
        .touch_access_record(params.user_id, id, state.ids.next_id(), Utc::now())?;

    tracing::debug!(
        document_id = id,
        user_id = params.user_id,
        write = params.write,
        "Issued access key"
    );

    Ok(JSend::success(AccessKeyResponse {
        access_key: key.access_key,
        secret_access_key: key.secret_access_key,
        session_token: key.session_token,
        signer_type: key.signer_type,
        expires_at: key.expires_at.to_rfc3339(),
        provider: state.bucket.provider(),
        region: state.bucket.region().to_string(),
        bucket_name: state.bucket.bucket_name().to_string(),
        endpoint: state.bucket.public_endpoint().to_string(),
        path: document.path,
        version_id: document.version_id,
    }))
}

/// Version history, newest first.
pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    AppQuery(params): AppQuery<ListVersionsParams>,
) -> Result<Json<JSend<Page<VersionResponse>>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let document = live_document(&state, id)?;
    require_perm(&state, &document, params.user_id, PermType::ReadOnly).await?;

    let versions = state.db.list_versions(id)?;
    let newest_first = versions.iter().rev().map(version_to_response);
    Ok(JSend::success(Page::window(
        newest_first,
        params.limit,
        params.offset,
    )))
}

/// Run one auto-snapshot trigger for the document.
///
/// Internal route for the editing engine's change notifications. It takes no
/// caller id and checks no permission; only the service mesh may reach it.
pub async fn trigger_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<JSend<SnapshotOutcome>>, ApiError> {
    let scheduler = state
        .scheduler
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("Auto-snapshot is not configured"))?;

    Ok(JSend::success(scheduler.trigger(id).await?))
}

/// Soft-delete a document. Owner only.
pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    AppQuery(params): AppQuery<OwnerParams>,
) -> Result<Json<JSend<()>>, ApiError> {
    let document = live_document(&state, id)?;
    if document.user_id != params.user_id {
        return Err(ApiError::forbidden("Only the owner can delete a document"));
    }

    if !state.db.soft_delete_document(id, Utc::now())? {
        return Err(ApiError::not_found("Document not found"));
    }

    tracing::debug!(document_id = id, "Deleted document");
    Ok(JSend::success(()))
}

// ============================================================================
// Helpers
// ============================================================================

fn live_document(state: &AppState, id: i64) -> Result<Document, ApiError> {
    state
        .db
        .get_document(id)?
        .filter(|doc| !doc.is_deleted())
        .ok_or_else(|| ApiError::not_found("Document not found"))
}

async fn require_perm(
    state: &AppState,
    document: &Document,
    user_id: i64,
    required: PermType,
) -> Result<(), ApiError> {
    if state.permissions.document_perm(document, user_id).await? < required {
        return Err(ApiError::forbidden("Insufficient permission on document"));
    }
    Ok(())
}

fn version_to_response(version: &DocumentVersion) -> VersionResponse {
    VersionResponse {
        id: version.id.to_string(),
        document_id: version.document_id.to_string(),
        version_id: version.version_id.clone(),
        last_cmd_id: version.last_cmd_id,
        created_at: version.created_at.to_rfc3339(),
    }
}
