use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::aggregate::Aggregator;
use crate::auth::{credential_matches, AdminAuth};
use crate::config::DirectoryConfig;
use crate::error::StorageError;
use crate::registry::SourceRegistry;
use crate::remote::{HttpTransport, RemoteFetcher};
use crate::store::{fetch_local, JsonFileStore};
use crate::types::{AggregatedResult, EmployeeRecord};

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub admin: Arc<AdminAuth>,
    /// Require peers to present the local company's credential on `/api/users`.
    pub require_peer_auth: bool,
}

impl AppState {
    pub fn new(aggregator: Aggregator, admin: AdminAuth, require_peer_auth: bool) -> Self {
        Self {
            aggregator: Arc::new(aggregator),
            admin: Arc::new(admin),
            require_peer_auth,
        }
    }

    /// Wire the production stack: file-backed store, reqwest transport.
    pub fn from_config(cfg: &DirectoryConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(SourceRegistry::from_config(cfg)?);
        let admin = AdminAuth::from_config(cfg)?;
        let transport = HttpTransport::new().context("building peer http client")?;
        let store = JsonFileStore::new(cfg.store.path.clone());

        for s in registry.resolve_sources() {
            tracing::info!(
                source = %s.id,
                name = %s.display_name,
                endpoint = %s.endpoint,
                local = s.is_local,
                key = %s.credential.fingerprint(),
                "source registered"
            );
        }

        let aggregator = Aggregator::new(
            registry,
            Arc::new(store),
            RemoteFetcher::new(Arc::new(transport), cfg.retry_policy()),
        )
        .with_default_deadline(cfg.aggregate_deadline());

        Ok(Self::new(aggregator, admin, cfg.server.require_peer_auth))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/users", get(local_users))
        .route("/admin/directory", get(admin_directory))
        .route("/admin/sources", get(admin_sources))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

pub enum ApiError {
    Unauthorized,
    Storage(StorageError),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::Storage(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(serde_json::json!({ "error": "unauthorized" })),
            )
                .into_response(),
            ApiError::Storage(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response(),
        }
    }
}

/// This deployment's partition, as served to peers.
async fn local_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<EmployeeRecord>>, ApiError> {
    let local = state.aggregator.registry().local();
    if state.require_peer_auth && !credential_matches(&local.credential, &headers) {
        tracing::warn!(source = %local.id, "rejected peer request: bad or missing bearer token");
        return Err(ApiError::Unauthorized);
    }
    let rows = fetch_local(state.aggregator.store().as_ref(), &local.id).await?;
    Ok(Json(rows))
}

async fn admin_directory(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AggregatedResult>, ApiError> {
    let user = state.admin.verify(&headers).ok_or(ApiError::Unauthorized)?;
    Ok(Json(state.aggregator.aggregate(user).await))
}

#[derive(serde::Serialize)]
struct SourceOut {
    id: String,
    name: String,
    endpoint: String,
    is_local: bool,
}

async fn admin_sources(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SourceOut>>, ApiError> {
    state.admin.verify(&headers).ok_or(ApiError::Unauthorized)?;
    let out = state
        .aggregator
        .registry()
        .resolve_sources()
        .iter()
        .map(|s| SourceOut {
            id: s.id.clone(),
            name: s.display_name.clone(),
            endpoint: s.endpoint.to_string(),
            is_local: s.is_local,
        })
        .collect();
    Ok(Json(out))
}
