pub mod download;
pub mod metadata;
pub mod s3;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

use crate::auth::{auth_middleware, KeysetCache, OidcDetails, TrustList};
use crate::config::SessionConfig;
use crate::db::MetadataStore;
use crate::session::SessionCache;
use crate::storage::Archive;

/// Shared application state, built once at startup.
///
/// Everything here is immutable after initialization except the two caches,
/// which are concurrent-safe; handlers never need locks.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MetadataStore>,
    pub archive: Arc<dyn Archive>,
    pub sessions: SessionCache,
    pub trust: Arc<TrustList>,
    pub oidc: OidcDetails,
    pub keysets: Arc<KeysetCache>,
    pub http_client: reqwest::Client,
    pub session_config: SessionConfig,
    /// The server's long-term Crypt4GH private key.
    pub c4gh_key: [u8; 32],
}

pub fn create_router(state: AppState) -> Router {
    // Known paths with an unregistered method get axum's automatic 405.
    let protected = Router::new()
        .route("/metadata/datasets", get(metadata::datasets))
        .route("/metadata/datasets/{*dataset}", get(metadata::dataset_files))
        .route("/files/{*fileid}", get(download::download))
        .route("/s3", get(s3::dispatch))
        .route("/s3/{*path}", get(s3::dispatch))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .fallback(not_found)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "code": "PAGE_NOT_FOUND",
            "message": "Page not found"
        })),
    )
}
