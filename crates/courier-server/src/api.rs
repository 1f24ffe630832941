use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, Method},
    middleware,
    routing::{get, post},
    Json,
};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use courier_shared::constants::PROTOCOL_VERSION;
use courier_shared::types::FileHandle;

use crate::blob_store::{BlobStore, StoredBlob};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::router::Router;

#[derive(Clone)]
pub struct AppState {
    pub blob_store: Arc<BlobStore>,
    pub router: Arc<Router>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
    pub started: Instant,
}

pub fn build_router(state: AppState) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    // Multipart framing needs a little room above the blob limit.
    let body_limit = state.blob_store.max_size().saturating_add(64 * 1024);

    axum::Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/blob/upload", post(blob_upload))
        .route("/blob/{id}", get(blob_download).delete(blob_delete))
        .route("/admin/status", get(admin_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    registration_open: bool,
    online: usize,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    uptime_secs: u64,
    online_sessions: usize,
    registered_users: usize,
    active_groups: usize,
    stored_blobs: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        registration_open: state.config.registration_open,
        online: state.router.online_count(),
    })
}

async fn blob_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<StoredBlob>, ServerError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {e}")))?;

        let stored = state.blob_store.store_blob(&data).await?;
        info!(handle = %stored.handle, size = stored.size, "Blob uploaded via API");
        return Ok(Json(stored));
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn blob_download(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Vec<u8>, ServerError> {
    state.blob_store.get_blob(FileHandle(id)).await
}

async fn blob_delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.blob_store.delete_blob(FileHandle(id)).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(expected) = config.admin_token.as_deref() else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    // ct_eq is false for slices of different length.
    if !bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }
    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        uptime_secs: state.started.elapsed().as_secs(),
        online_sessions: state.router.online_count(),
        registered_users: state.router.user_count(),
        active_groups: state.router.group_count(),
        stored_blobs: state.blob_store.count().await?,
    }))
}

pub async fn serve(
    state: AppState,
    listener: tokio::net::TcpListener,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting HTTP API server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    Ok(())
}
