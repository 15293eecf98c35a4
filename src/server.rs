//! HTTP and WebSocket API.
//!
//! Serves the upload surface, file and error queries, retry and resolve
//! actions, and a WebSocket that pushes processing events as they happen.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/v1/upload` | Multipart upload; accepted files are enqueued |
//! | `POST` | `/api/v1/search` | Similarity search over indexed chunks |
//! | `GET`  | `/api/v1/files` | List files with metadata (`limit`, `offset`) |
//! | `GET`  | `/api/v1/files/{id}` | One file with metadata |
//! | `GET`  | `/api/v1/files/{id}/status` | Branch statuses and attempt count |
//! | `GET`  | `/api/v1/files/{id}/errors` | Error rows for one file |
//! | `POST` | `/api/v1/files/{id}/retry` | Re-enqueue (`?force=true` reprocesses completed branches) |
//! | `DELETE` | `/api/v1/files/{id}` | Delete record, index, metadata, and stored object |
//! | `GET`  | `/api/v1/errors` | Unresolved error rows |
//! | `POST` | `/api/v1/errors/{id}/resolve` | Mark an error row handled |
//! | `GET`  | `/api/v1/queue/status` | Dispatcher snapshot |
//! | `GET`  | `/ws` | Processing event stream |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "no file with id abc" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::EmbeddingGenerator;
use crate::error::PipelineError;
use crate::events::EventBus;
use crate::models::{FileRecord, FileWithMetadata, ProcessingError, QueueStatus};
use crate::queue::{EnqueueOutcome, ProcessingQueue};
use crate::storage::ObjectStorage;
use crate::store::Store;
use crate::vector_store::{SearchHit, VectorStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub queue: ProcessingQueue,
    pub events: EventBus,
    pub storage: Arc<dyn ObjectStorage>,
    pub embedder: Arc<dyn EmbeddingGenerator>,
    pub vectors: Arc<dyn VectorStore>,
}

pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.server.bind.clone();
    let app = build_router(state);

    info!("listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // axum caps request bodies at 2 MB out of the box, well under the
    // configured upload limit. Raise it to the per-file cap plus slack for
    // multipart framing; oversized files still get a per-file rejection.
    let body_limit = state.config.upload.max_file_size_bytes() as usize + 64 * 1024;

    Router::new()
        .route("/api/v1/upload", post(handle_upload))
        .route("/api/v1/search", post(handle_search))
        .route("/api/v1/files", get(handle_list_files))
        .route(
            "/api/v1/files/{id}",
            get(handle_get_file).delete(handle_delete_file),
        )
        .route("/api/v1/files/{id}/status", get(handle_file_status))
        .route("/api/v1/files/{id}/errors", get(handle_file_errors))
        .route("/api/v1/files/{id}/retry", post(handle_retry))
        .route("/api/v1/errors", get(handle_list_errors))
        .route("/api/v1/errors/{id}/resolve", post(handle_resolve_error))
        .route("/api/v1/queue/status", get(handle_queue_status))
        .route("/ws", get(handle_ws))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        internal(e.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/v1/upload ============

#[derive(Serialize)]
struct UploadResponse {
    files: Vec<FileRecord>,
    rejected: Vec<RejectedFile>,
}

#[derive(Serialize)]
struct RejectedFile {
    filename: String,
    reason: String,
}

/// Multipart upload. Each file part is validated, stored, recorded, and
/// enqueued independently; one bad file never blocks the others.
async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    let mut saw_file = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("malformed multipart body: {}", e)))?
    {
        let filename = match field.file_name() {
            Some(name) => name.to_string(),
            None => continue,
        };
        saw_file = true;

        let bytes = match field.bytes().await {
            Ok(b) => b,
            Err(e) => {
                rejected.push(RejectedFile {
                    filename,
                    reason: format!("failed to read upload body: {}", e),
                });
                continue;
            }
        };

        if let Err(reason) = validate_upload(&state.config, &filename, bytes.len()) {
            rejected.push(RejectedFile { filename, reason });
            continue;
        }

        let stored = match state.storage.upload(&bytes, &filename).await {
            Ok(s) => s,
            Err(e) => {
                warn!(filename, error = %e, "object upload failed");
                rejected.push(RejectedFile {
                    filename,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let record = state
            .store
            .create_file_record(&filename, &stored.url, &stored.storage_id, bytes.len() as i64)
            .await?;

        if let Err(e) = state.queue.enqueue(&record.id, false).await {
            warn!(file_id = %record.id, error = %e, "enqueue after upload failed");
        }

        accepted.push(record);
    }

    if !saw_file {
        return Err(bad_request("no file fields in multipart body"));
    }

    Ok(Json(UploadResponse {
        files: accepted,
        rejected,
    }))
}

fn validate_upload(config: &Config, filename: &str, size: usize) -> Result<(), String> {
    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default();

    if !config
        .upload
        .allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
    {
        return Err(format!(
            "unsupported file type '{}'; allowed: {}",
            ext,
            config.upload.allowed_extensions.join(", ")
        ));
    }
    if size == 0 {
        return Err("file is empty".to_string());
    }
    if size as u64 > config.upload.max_file_size_bytes() {
        return Err(format!(
            "file exceeds size limit of {} MB",
            config.upload.max_file_size_mb
        ));
    }
    Ok(())
}

// ============ POST /api/v1/search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    file_ids: Option<Vec<String>>,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    10
}

#[derive(Serialize)]
struct SearchResponse {
    hits: Vec<SearchHit>,
}

/// Embed the query text and rank indexed chunks by cosine similarity.
/// Optionally restricted to a set of file ids.
async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if req.top_k < 1 || req.top_k > 100 {
        return Err(bad_request("top_k must be between 1 and 100"));
    }

    let query_vec = state
        .embedder
        .embed_query(&req.query)
        .await
        .map_err(embed_query_error)?;

    let hits = state
        .vectors
        .search(&query_vec, req.file_ids.as_deref(), req.top_k)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(SearchResponse { hits }))
}

/// A disabled embedding provider is a client-visible configuration state,
/// not a server fault.
fn embed_query_error(e: PipelineError) -> AppError {
    let message = e.to_string();
    if message.contains("disabled") {
        AppError {
            status: StatusCode::BAD_REQUEST,
            code: "embeddings_disabled".to_string(),
            message,
        }
    } else {
        internal(message)
    }
}

// ============ File queries ============

#[derive(Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Serialize)]
struct FileListResponse {
    files: Vec<FileWithMetadata>,
    limit: i64,
    offset: i64,
}

async fn handle_list_files(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<FileListResponse>, AppError> {
    if params.limit < 1 || params.limit > 500 {
        return Err(bad_request("limit must be between 1 and 500"));
    }
    if params.offset < 0 {
        return Err(bad_request("offset must not be negative"));
    }

    let files = state.store.list(params.limit, params.offset).await?;
    Ok(Json(FileListResponse {
        files,
        limit: params.limit,
        offset: params.offset,
    }))
}

async fn handle_get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FileWithMetadata>, AppError> {
    state
        .store
        .get_with_metadata(&id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("no file with id {}", id)))
}

#[derive(Serialize)]
struct FileStatusResponse {
    file_id: String,
    vector_processing_status: crate::models::ProcessingStatus,
    metadata_processing_status: crate::models::ProcessingStatus,
    processing_attempts: i64,
}

async fn handle_file_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FileStatusResponse>, AppError> {
    let record = state
        .store
        .get_file(&id)
        .await?
        .ok_or_else(|| not_found(format!("no file with id {}", id)))?;

    Ok(Json(FileStatusResponse {
        file_id: record.id,
        vector_processing_status: record.vector_processing_status,
        metadata_processing_status: record.metadata_processing_status,
        processing_attempts: record.processing_attempts,
    }))
}

async fn handle_file_errors(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ErrorListResponse>, AppError> {
    if state.store.get_file(&id).await?.is_none() {
        return Err(not_found(format!("no file with id {}", id)));
    }
    let errors = state.store.errors_for_file(&id).await?;
    Ok(Json(ErrorListResponse { errors }))
}

async fn handle_delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let record = state
        .store
        .delete(&id)
        .await?
        .ok_or_else(|| not_found(format!("no file with id {}", id)))?;

    // Record rows are gone; a stale object in storage is only wasted space.
    if let Err(e) = state.storage.delete(&record.storage_id).await {
        warn!(file_id = %id, error = %e, "stored object cleanup failed");
    }

    Ok(Json(serde_json::json!({ "deleted": id })))
}

// ============ POST /api/v1/files/{id}/retry ============

#[derive(Deserialize)]
struct RetryParams {
    #[serde(default)]
    force: bool,
}

async fn handle_retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<RetryParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let outcome = state
        .queue
        .enqueue(&id, params.force)
        .await
        .map_err(|e| internal(e.to_string()))?;

    match outcome {
        EnqueueOutcome::Queued => Ok(Json(serde_json::json!({ "status": "queued" }))),
        EnqueueOutcome::AlreadyQueued => {
            Ok(Json(serde_json::json!({ "status": "already_queued" })))
        }
        EnqueueOutcome::AlreadyCompleted => Err(conflict(
            "file already processed; use force=true to reprocess",
        )),
        EnqueueOutcome::NotFound => Err(not_found(format!("no file with id {}", id))),
    }
}

// ============ Error rows ============

#[derive(Serialize)]
struct ErrorListResponse {
    errors: Vec<ProcessingError>,
}

async fn handle_list_errors(
    State(state): State<AppState>,
) -> Result<Json<ErrorListResponse>, AppError> {
    let errors = state.store.unresolved_errors().await?;
    Ok(Json(ErrorListResponse { errors }))
}

async fn handle_resolve_error(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.store.resolve_error(&id).await? {
        Ok(Json(serde_json::json!({ "resolved": id })))
    } else {
        Err(not_found(format!("no error with id {}", id)))
    }
}

// ============ GET /api/v1/queue/status ============

async fn handle_queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.queue.status())
}

// ============ GET /ws ============

async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| ws_session(socket, state.events))
}

/// Forward broadcast events to one client until it disconnects. A client
/// that falls behind the channel capacity misses the lagged events and keeps
/// receiving from the current position.
async fn ws_session(socket: WebSocket, events: EventBus) {
    let (mut sink, mut stream) = socket.split();
    let mut rx = events.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Ok(ev) => ev,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "websocket client lagged behind event stream");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let payload = match serde_json::to_string(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize event");
                        continue;
                    }
                };
                if sink.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Ignore client chatter, including pings handled by axum
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
