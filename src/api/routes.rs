use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        // Upload session (WebSocket)
        .route("/documents/upload", get(handlers::upload_ws))
        // Documents
        .route("/documents/:id", delete(handlers::delete_document))
        .route("/documents/:id/access_key", get(handlers::access_key))
        .route("/documents/:id/versions", get(handlers::list_versions))
        // Internal, not exposed through the public gateway
        .route("/_internal/health", get(handlers::health))
        .route(
            "/_internal/documents/:id/snapshot",
            post(handlers::trigger_snapshot),
        );

    // Test-only routes
    if state.config.test_mode {
        tracing::warn!("Test mode enabled, purge route is available");
        router = router.route("/admin/purge", delete(handlers::admin_purge));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
