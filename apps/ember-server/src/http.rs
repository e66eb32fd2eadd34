//! HTTP REST API server.
//!
//! Exposes insert, search, record export and admin operations, plus health
//! checks and metrics for monitoring tools.

use crate::embedding::{EmbeddingError, EmbeddingGateway};
use crate::health::HealthChecker;
use crate::metrics::PrometheusMeter;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ember_engine::{CancellationToken, EmbeddingRecord, Engine, EngineError, SearchHit};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

/// Page size for `GET /records` when `limit` is absent.
const DEFAULT_PAGE_LIMIT: usize = 100;
const MAX_PAGE_LIMIT: usize = 10_000;

/// HTTP server state.
#[derive(Clone)]
pub struct HttpServerState {
    engine: Arc<Engine>,
    gateway: Arc<dyn EmbeddingGateway>,
    health_checker: Arc<HealthChecker>,
    meter: Arc<PrometheusMeter>,
    request_timeout: Duration,
}

impl HttpServerState {
    pub fn new(
        engine: Arc<Engine>,
        gateway: Arc<dyn EmbeddingGateway>,
        meter: Arc<PrometheusMeter>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            health_checker: Arc::new(HealthChecker::new(engine.clone())),
            engine,
            gateway,
            meter,
            request_timeout,
        }
    }
}

/// Builds the API router.
///
/// Provides:
/// - POST /insert - Embed text and store it
/// - POST /search - Embed a query and return the nearest records
/// - GET /records - Page through live records in id order
/// - GET /records/:id, DELETE /records/:id
/// - POST /admin/compact - Compact the log and rebuild the index
/// - POST /admin/snapshot - Persist the index snapshot
/// - GET /health - Health status
/// - GET /metrics - Prometheus metrics
pub fn router(state: HttpServerState) -> Router {
    Router::new()
        .route("/insert", post(insert_handler))
        .route("/search", post(search_handler))
        .route("/records", get(list_handler))
        .route("/records/:id", get(get_handler).delete(delete_handler))
        .route("/admin/compact", post(compact_handler))
        .route("/admin/snapshot", post(snapshot_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP server for the REST API.
pub struct HttpServer {
    addr: SocketAddr,
    state: HttpServerState,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    server_handle: Option<JoinHandle<Result<(), std::io::Error>>>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: HttpServerState) -> Self {
        Self {
            addr,
            state,
            local_addr: None,
            shutdown_tx: None,
            server_handle: None,
        }
    }

    /// Bound address once started. Differs from the configured one when
    /// port 0 was requested.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start the HTTP server.
    pub async fn start(&mut self) -> Result<(), HttpServerError> {
        tracing::info!("Starting HTTP server on {}", self.addr);

        let app = router(self.state.clone());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| HttpServerError::Startup(format!("Failed to bind: {}", e)))?;
        self.local_addr = Some(
            listener
                .local_addr()
                .map_err(|e| HttpServerError::Startup(format!("No local address: {}", e)))?,
        );

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
        });

        self.server_handle = Some(server_handle);

        tracing::info!("HTTP server listening on {:?}", self.local_addr);
        Ok(())
    }

    /// Shutdown the HTTP server gracefully.
    pub async fn shutdown(mut self) -> Result<(), HttpServerError> {
        tracing::info!("Shutting down HTTP server");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| HttpServerError::Shutdown(format!("Join error: {}", e)))?
                .map_err(|e| HttpServerError::Shutdown(format!("Server error: {}", e)))?;
        }

        tracing::info!("HTTP server shutdown complete");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct InsertRequest {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsertResponse {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query_text: String,
    pub top_k: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Wire form of a stored record.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordView {
    pub id: u64,
    pub text: String,
    pub vector: Vec<f32>,
}

impl From<&EmbeddingRecord> for RecordView {
    fn from(record: &EmbeddingRecord) -> Self {
        Self {
            id: record.id,
            text: record.text.clone(),
            vector: record.vector.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompactResponse {
    pub reclaimed: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub bytes: u64,
}

/// POST /insert
async fn insert_handler(
    State(state): State<HttpServerState>,
    payload: Result<Json<InsertRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<InsertResponse>), ApiError> {
    let Json(req) = payload?;
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text cannot be empty".to_string()));
    }

    let vector = state.gateway.embed(&req.text).await?;

    let engine = state.engine.clone();
    let id = run_write(move || engine.insert(req.text, vector)).await?;

    tracing::debug!(id, "Inserted record");
    Ok((StatusCode::CREATED, Json(InsertResponse { id })))
}

/// POST /search
async fn search_handler(
    State(state): State<HttpServerState>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<Vec<SearchHit>>, ApiError> {
    let Json(req) = payload?;
    if req.query_text.trim().is_empty() {
        return Err(ApiError::BadRequest("query_text cannot be empty".to_string()));
    }
    if req.top_k <= 0 {
        return Err(ApiError::BadRequest(format!(
            "top_k must be positive, got {}",
            req.top_k
        )));
    }
    let k = usize::try_from(req.top_k)
        .map_err(|_| ApiError::BadRequest("top_k out of range".to_string()))?;

    let query = state.gateway.embed(&req.query_text).await?;

    let engine = state.engine.clone();
    let hits = run_blocking(state.request_timeout, move |cancel| {
        engine.search_with_cancel(&query, k, None, &cancel)
    })
    .await?;

    Ok(Json(hits))
}

/// GET /records?offset&limit
async fn list_handler(
    State(state): State<HttpServerState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<RecordView>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .min(MAX_PAGE_LIMIT);

    let engine = state.engine.clone();
    let records = run_blocking(state.request_timeout, move |_| {
        Ok(engine.list(params.offset, limit))
    })
    .await?;

    Ok(Json(records.iter().map(|r| RecordView::from(r.as_ref())).collect()))
}

/// GET /records/:id
async fn get_handler(
    State(state): State<HttpServerState>,
    Path(id): Path<u64>,
) -> Result<Json<RecordView>, ApiError> {
    let record = state.engine.get(id)?;
    Ok(Json(RecordView::from(record.as_ref())))
}

/// DELETE /records/:id
async fn delete_handler(
    State(state): State<HttpServerState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    let engine = state.engine.clone();
    run_write(move || engine.delete(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /admin/compact
async fn compact_handler(
    State(state): State<HttpServerState>,
) -> Result<Json<CompactResponse>, ApiError> {
    let engine = state.engine.clone();
    let stats = run_write(move || engine.compact()).await?;

    tracing::info!(reclaimed = stats.reclaimed.len(), "Compaction requested over HTTP");
    Ok(Json(CompactResponse {
        reclaimed: stats.reclaimed.len(),
        bytes_before: stats.bytes_before,
        bytes_after: stats.bytes_after,
    }))
}

/// POST /admin/snapshot
async fn snapshot_handler(
    State(state): State<HttpServerState>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let engine = state.engine.clone();
    let bytes = run_write(move || engine.save_index()).await?;

    Ok(Json(SnapshotResponse { bytes }))
}

/// GET /health
async fn health_handler(
    State(state): State<HttpServerState>,
) -> Json<crate::health::ServerHealthStatus> {
    Json(state.health_checker.check().await)
}

/// GET /metrics
///
/// Returns Prometheus-formatted metrics.
async fn metrics_handler(State(state): State<HttpServerState>) -> Response {
    let metrics = state.meter.export();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics,
    )
        .into_response()
}

/// Runs an engine call on the blocking pool.
///
/// The call's token is cancelled when the deadline passes or when the
/// calling future is dropped, e.g. on client disconnect.
async fn run_blocking<T, F>(timeout: Duration, f: F) -> Result<T, ApiError>
where
    F: FnOnce(CancellationToken) -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();

    let task = tokio::task::spawn_blocking({
        let token = token.clone();
        move || f(token)
    });

    let result = match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined
            .map_err(|e| ApiError::Internal(format!("Task failed: {}", e)))?
            .map_err(ApiError::from),
        Err(_) => {
            token.cancel();
            Err(ApiError::Timeout)
        }
    };

    guard.disarm();
    result
}

/// Runs a mutating engine call on the blocking pool, to completion.
///
/// Writes are not bounded by the request timeout: once the store accepts
/// one it is durable, so the caller must see the real outcome.
async fn run_write<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("Task failed: {}", e)))?
        .map_err(ApiError::from)
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Handler error, rendered as `{"error", "kind"}` with a matching status.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("{0}")]
    BadRequest(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Engine(e) => match e {
                EngineError::DimensionMismatch { .. } => {
                    (StatusCode::BAD_REQUEST, "dimension_mismatch")
                }
                EngineError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
                EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                EngineError::Cancelled => (StatusCode::REQUEST_TIMEOUT, "cancelled"),
                EngineError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
                EngineError::Index(_) => (StatusCode::INTERNAL_SERVER_ERROR, "index"),
            },
            ApiError::Embedding(EmbeddingError::Unavailable(_)) => {
                (StatusCode::BAD_GATEWAY, "embedding_unavailable")
            }
            ApiError::Embedding(EmbeddingError::Malformed { .. })
            | ApiError::Embedding(EmbeddingError::NonFinite(_)) => {
                (StatusCode::BAD_GATEWAY, "embedding_malformed")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            ApiError::Timeout => (StatusCode::REQUEST_TIMEOUT, "cancelled"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            tracing::error!("Handler error: {}", self);
        } else {
            tracing::debug!(%status, kind, "Request rejected: {}", self);
        }

        (
            status,
            Json(serde_json::json!({
                "error": self.to_string(),
                "kind": kind,
            })),
        )
            .into_response()
    }
}
