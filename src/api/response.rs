//! JSend envelopes and the error type every handler returns.
//!
//! Client errors (4xx) answer `{"status":"fail","data":{"message":..}}`,
//! server-side and upstream errors (5xx) answer
//! `{"status":"error","message":..}`.

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::object_store::ObjectStoreError;
use crate::permissions::PermissionError;
use crate::snapshot::SnapshotError;
use crate::storage::DatabaseError;
use crate::upload::UploadError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JSendStatus {
    Error,
    Fail,
    Success,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JSend<T: Serialize> {
    pub data: T,
    pub status: JSendStatus,
}

impl<T: Serialize> JSend<T> {
    pub fn success(data: T) -> Json<JSend<T>> {
        Json(JSend {
            data,
            status: JSendStatus::Success,
        })
    }
}

/// A window over a listing plus where it sits in the whole.
#[derive(Debug, Serialize)]
pub struct Page<T: Serialize> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
    pub total: u64,
}

impl<T: Serialize> Page<T> {
    /// Cut `limit` items starting at `offset` out of `all`.
    pub fn window<I>(all: I, limit: u32, offset: u32) -> Self
    where
        I: ExactSizeIterator<Item = T>,
    {
        let total = all.len() as u64;
        let items = all.skip(offset as usize).take(limit as usize).collect();
        Page {
            items,
            pagination: Pagination {
                limit,
                offset,
                total,
            },
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = if self.status.is_server_error() {
            json!({ "status": JSendStatus::Error, "message": self.message })
        } else {
            json!({ "status": JSendStatus::Fail, "data": { "message": self.message } })
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        tracing::error!(error = %e, "Database failure");
        ApiError::internal(e.to_string())
    }
}

impl From<PermissionError> for ApiError {
    fn from(e: PermissionError) -> Self {
        match e {
            PermissionError::ProjectNotFound(_) => ApiError::not_found(e.to_string()),
            PermissionError::Unavailable(_) => ApiError::unavailable(e.to_string()),
        }
    }
}

impl From<ObjectStoreError> for ApiError {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::InvalidRequest(msg) => ApiError::bad_request(msg),
            ObjectStoreError::NotFound(key) => ApiError::not_found(format!("Object {key} not found")),
            other => ApiError::bad_gateway(format!("Object storage failed: {other}")),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Protocol(msg) => ApiError::bad_request(msg),
            UploadError::Forbidden(msg) => ApiError::forbidden(msg),
            UploadError::NotFound(msg) => ApiError::not_found(msg),
            UploadError::Storage { .. } => ApiError::bad_gateway(e.to_string()),
            UploadError::Consistency(_) | UploadError::Database(_) => {
                ApiError::internal(e.to_string())
            }
        }
    }
}

impl From<SnapshotError> for ApiError {
    fn from(e: SnapshotError) -> Self {
        match e {
            // A protocol error here means the engine sent an unusable snapshot.
            SnapshotError::Upload(UploadError::Protocol(msg)) => ApiError::bad_gateway(msg),
            SnapshotError::Upload(upload) => upload.into(),
            SnapshotError::Http(_)
            | SnapshotError::Engine { .. }
            | SnapshotError::Malformed(_)
            | SnapshotError::Raster(_) => ApiError::bad_gateway(e.to_string()),
            SnapshotError::Lock(_) => ApiError::unavailable(e.to_string()),
        }
    }
}

/// `axum::extract::Query` replacement that parses with `serde_qs` and rejects
/// with a JSend fail.
pub struct AppQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for AppQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, ApiError> {
        let query = parts.uri.query().unwrap_or_default();
        serde_qs::from_str(query)
            .map(AppQuery)
            .map_err(|e| ApiError::bad_request(friendly_query_error(&e.to_string())))
    }
}

fn friendly_query_error(raw: &str) -> String {
    let cleaned = raw
        .replace("u32", "non-negative integer")
        .replace("u64", "non-negative integer")
        .replace("i64", "integer");
    format!("Invalid query parameter: {cleaned}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_counts_everything() {
        let page = Page::window(vec![7, 6, 5, 4, 3, 2, 1].into_iter(), 3, 2);
        assert_eq!(page.items, vec![5, 4, 3]);
        assert_eq!(page.pagination.total, 7);

        let past_end = Page::window(vec![0, 1, 2, 3].into_iter(), 10, 9);
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.pagination.total, 4);
    }

    #[test]
    fn snapshot_errors_map_to_gateway_or_not_found() {
        let engine: ApiError = SnapshotError::Engine {
            status: 500,
            body: "down".into(),
        }
        .into();
        assert_eq!(engine.status(), StatusCode::BAD_GATEWAY);

        let missing: ApiError =
            SnapshotError::Upload(UploadError::NotFound("Document 1 not found".into())).into();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let bad: ApiError =
            SnapshotError::Upload(UploadError::Protocol("last_cmd_id".into())).into();
        assert_eq!(bad.status(), StatusCode::BAD_GATEWAY);
    }
}
