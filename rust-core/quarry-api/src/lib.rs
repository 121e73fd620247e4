// SPDX-License-Identifier: PMPL-1.0-or-later
//! Quarry API
//!
//! HTTP binding of the prepared plan peer protocol, plus a few admin
//! endpoints. Peers push plans with `PUT /prepareds/{key}`, list them with
//! `GET /prepareds?prefix=` and fetch one with `GET /prepareds/{key}`;
//! [`HttpTransport`] is the matching client side.

pub mod transport;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn};

use quarry_planner::{AddedPlan, CacheStats, PreparedCache, PreparedConfig, PreparedError, PreparedInfo, StabilityMode};

pub use transport::HttpTransport;

/// Header naming the node a pushed plan came from.
pub const ORIGIN_HEADER: &str = "x-quarry-origin";

/// API errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse {
            error: message,
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

impl From<PreparedError> for ApiError {
    fn from(err: PreparedError) -> Self {
        let message = err.to_string();
        match err {
            PreparedError::NotFound(_) => ApiError::NotFound(message),
            PreparedError::NameCollision { .. } | PreparedError::Stale(_) => ApiError::Conflict(message),
            PreparedError::EncodingMismatch { .. }
            | PreparedError::VersionMismatch { .. }
            | PreparedError::Decode(_)
            | PreparedError::Reprepare(_)
            | PreparedError::StabilityUnsupported(_)
            | PreparedError::InvalidConfig(_) => ApiError::BadRequest(message),
            PreparedError::RemoteFetch { .. } | PreparedError::Persist(_) => ApiError::Internal(message),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// HTTP server and peer client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Cluster members as `host:port`, this node included.
    pub peers: Vec<String>,
    /// Per-request timeout for peer calls.
    pub peer_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8093,
            peers: Vec::new(),
            peer_timeout_ms: 10_000,
        }
    }
}

impl ApiConfig {
    /// Defaults overlaid with `QUARRY_API_HOST`, `QUARRY_API_PORT`,
    /// `QUARRY_PEERS` (comma separated) and `QUARRY_PEER_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, PreparedError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, PreparedError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup("QUARRY_API_HOST") {
            config.host = v;
        }
        if let Some(v) = lookup("QUARRY_API_PORT") {
            config.port = v
                .trim()
                .parse()
                .map_err(|_| PreparedError::InvalidConfig(format!("QUARRY_API_PORT: cannot parse {v:?}")))?;
        }
        if let Some(v) = lookup("QUARRY_PEERS") {
            config.peers = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("QUARRY_PEER_TIMEOUT_MS") {
            config.peer_timeout_ms = v
                .trim()
                .parse()
                .map_err(|_| PreparedError::InvalidConfig(format!("QUARRY_PEER_TIMEOUT_MS: cannot parse {v:?}")))?;
        }
        if config.peer_timeout_ms == 0 {
            return Err(PreparedError::InvalidConfig("peer timeout must be positive".to_string()));
        }
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Body of `PUT /prepareds/{key}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutPreparedRequest {
    pub encoded: String,
}

/// What the receiving node did with a pushed plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    Cached,
    Reprepared,
    /// The push came from this node.
    Ignored,
}

impl From<AddedPlan> for PutOutcome {
    fn from(added: AddedPlan) -> Self {
        match added {
            AddedPlan::Cached => PutOutcome::Cached,
            AddedPlan::Reprepared => PutOutcome::Reprepared,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutPreparedResponse {
    pub name: String,
    pub outcome: PutOutcome,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedPlanResponse {
    pub name: String,
    pub encoded: String,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityRequest {
    pub mode: StabilityMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityResponse {
    pub mode: StabilityMode,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<PreparedCache>,
    /// Name this node stamps on its own pushes.
    pub local_node: Arc<str>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(cache: Arc<PreparedCache>, local_node: &str) -> Self {
        Self {
            cache,
            local_node: Arc::from(local_node),
            start_time: Instant::now(),
        }
    }
}

/// Build the API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        // Peer protocol
        .route("/prepareds", get(list_prepareds_handler))
        .route(
            "/prepareds/{key}",
            get(get_prepared_handler)
                .put(put_prepared_handler)
                .delete(delete_prepared_handler),
        )
        // Admin
        .route("/admin/prepareds", get(entries_handler))
        .route("/admin/stability", get(get_stability_handler).put(set_stability_handler))
        .with_state(state)
}

#[instrument(skip(state))]
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node: state.local_node.to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

#[instrument(skip(state))]
async fn stats_handler(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

/// Receive a plan pushed by a peer.
#[instrument(skip(state, headers, request))]
async fn put_prepared_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PutPreparedRequest>,
) -> Result<(StatusCode, Json<PutPreparedResponse>), ApiError> {
    let origin = headers.get(ORIGIN_HEADER).and_then(|v| v.to_str().ok());
    if origin == Some(&*state.local_node) {
        debug!(key = %key, "ignoring self-originated plan push");
        return Ok((
            StatusCode::ACCEPTED,
            Json(PutPreparedResponse {
                name: key,
                outcome: PutOutcome::Ignored,
            }),
        ));
    }

    let added = state.cache.add_encoded(&key, &request.encoded).await.map_err(|e| {
        warn!(key = %key, origin = ?origin, error = %e, "rejected pushed plan");
        ApiError::from(e)
    })?;
    Ok((
        StatusCode::OK,
        Json(PutPreparedResponse {
            name: key,
            outcome: added.into(),
        }),
    ))
}

#[instrument(skip(state))]
async fn list_prepareds_handler(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Json<ListResponse> {
    let prefix = query.prefix.unwrap_or_default();
    let names = state
        .cache
        .names()
        .into_iter()
        .filter(|name| name.starts_with(&prefix))
        .collect();
    Json(ListResponse { names })
}

#[instrument(skip(state))]
async fn get_prepared_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<EncodedPlanResponse>, ApiError> {
    let encoded = state
        .cache
        .encoded(&key)
        .ok_or_else(|| ApiError::NotFound(format!("prepared statement {key} not found")))?;
    Ok(Json(EncodedPlanResponse { name: key, encoded }))
}

#[instrument(skip(state))]
async fn delete_prepared_handler(State(state): State<AppState>, Path(key): Path<String>) -> Result<StatusCode, ApiError> {
    if state.cache.delete(&key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("prepared statement {key} not found")))
    }
}

#[instrument(skip(state))]
async fn entries_handler(State(state): State<AppState>) -> Json<Vec<PreparedInfo>> {
    Json(state.cache.entries())
}

#[instrument(skip(state))]
async fn get_stability_handler(State(state): State<AppState>) -> Json<StabilityResponse> {
    Json(StabilityResponse {
        mode: state.cache.stability_mode(),
    })
}

#[instrument(skip(state))]
async fn set_stability_handler(
    State(state): State<AppState>,
    Json(request): Json<StabilityRequest>,
) -> Result<Json<StabilityResponse>, ApiError> {
    state.cache.set_stability_mode(request.mode).await?;
    Ok(Json(StabilityResponse {
        mode: state.cache.stability_mode(),
    }))
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Install the global `tracing` subscriber, honouring `RUST_LOG` and falling
/// back to `info`. Returns `false` if one was already installed.
pub fn init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .is_ok()
}

/// Warm a freshly built cache: reload durable plans when stability is on,
/// then seed the rest from a peer.
pub async fn warm_up(cache: &PreparedCache, config: &PreparedConfig) -> Result<(), PreparedError> {
    if cache.stability_mode().is_on() {
        cache.load_persisted().await?;
    }
    let report = cache.prime_from_peers(&config.prime_config()).await;
    info!(
        size = cache.size(),
        primed = report.primed,
        peer = report.peer.as_deref().unwrap_or("none"),
        "prepared cache warmed up"
    );
    Ok(())
}

/// Start the API server
pub async fn serve(config: ApiConfig, state: AppState) -> Result<(), std::io::Error> {
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting Quarry API server on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
