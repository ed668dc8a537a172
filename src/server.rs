//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Banner |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/upload` | Multipart upload (`file`, optional `session_id`) |
//! | `POST` | `/process/{doc_id}` | Run the ingestion pipeline for a document |
//! | `POST` | `/chat` | Answer `{query, doc_id?, top_k?}` from indexed fragments |
//! | `POST` | `/session` | Create a session for `{user_id}` |
//! | `GET`  | `/session/{id}` | Fetch a session |
//! | `GET`  | `/documents` | List documents, optionally `?session_id=` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `external_service` (502, or 504 when retryable), `internal` (500).
//!
//! # Cancellation
//!
//! Each request runs under a child of the server's shutdown token, so
//! stopping the server cancels in-flight pipeline calls.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::app::App;
use crate::config::Config;
use crate::error::PipelineError;
use crate::ingest::IngestFailure;
use crate::models::{Document, Session};
use crate::query::{Answer, ChatQuery};

/// Largest accepted multipart body.
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    app: Arc<App>,
    shutdown: CancellationToken,
}

/// Build the service from `config` and serve until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let app = Arc::new(App::from_config(config).await?);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal.cancel();
        }
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("Document RAG server listening on http://{}", config.server.bind);
    serve(listener, app, shutdown).await
}

/// Serve `app` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Arc<App>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = router(app, shutdown.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

pub fn router(app: Arc<App>, shutdown: CancellationToken) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/upload", post(handle_upload))
        .route("/process/{doc_id}", post(handle_process))
        .route("/chat", post(handle_chat))
        .route("/session", post(handle_create_session))
        .route("/session/{id}", get(handle_get_session))
        .route("/documents", get(handle_list_documents))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(AppState { app, shutdown })
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::NotFound { .. } => StatusCode::NOT_FOUND,
        PipelineError::ClientData { .. } => StatusCode::BAD_REQUEST,
        PipelineError::ExternalService {
            retryable: true, ..
        } => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::ExternalService { .. } => StatusCode::BAD_GATEWAY,
        PipelineError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        if !err.is_client_fault() {
            error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status: status_for(&err),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<IngestFailure> for AppError {
    fn from(failure: IngestFailure) -> Self {
        AppError {
            status: status_for(&failure.error),
            code: failure.error.code().to_string(),
            message: failure.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

// ============ GET / and /health ============

async fn handle_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Document RAG service",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

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

// ============ POST /upload ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    document_id: String,
    blob_path: String,
}

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut session_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                let name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read file field: {}", e)))?;
                file = Some((name, bytes.to_vec()));
            }
            Some("session_id") | Some("sessionId") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("failed to read session_id: {}", e)))?;
                if !value.trim().is_empty() {
                    session_id = Some(value.trim().to_string());
                }
            }
            _ => {}
        }
    }

    let (name, bytes) = file.ok_or_else(|| bad_request("multipart field 'file' is required"))?;
    let cancel = state.shutdown.child_token();
    let doc = state
        .app
        .upload(&name, &bytes, session_id.as_deref(), &cancel)
        .await?;

    Ok(Json(UploadResponse {
        document_id: doc.id,
        blob_path: doc.blob_url,
    }))
}

// ============ POST /process/{doc_id} ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessResponse {
    doc_id: String,
    num_chunks: usize,
}

async fn handle_process(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<ProcessResponse>, AppError> {
    let cancel = state.shutdown.child_token();
    let report = state.app.process(&doc_id, &cancel).await?;
    Ok(Json(ProcessResponse {
        doc_id: report.doc_id,
        num_chunks: report.num_chunks,
    }))
}

// ============ POST /chat ============

async fn handle_chat(
    State(state): State<AppState>,
    body: Result<Json<ChatQuery>, JsonRejection>,
) -> Result<Json<Answer>, AppError> {
    let Json(query) = body?;
    let cancel = state.shutdown.child_token();
    Ok(Json(state.app.ask(&query, &cancel).await?))
}

// ============ Sessions ============

#[derive(Deserialize)]
struct CreateSessionRequest {
    #[serde(alias = "userId")]
    user_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_id: String,
    user_id: String,
    created_at: DateTime<Utc>,
}

impl From<Session> for SessionResponse {
    fn from(s: Session) -> Self {
        Self {
            session_id: s.id,
            user_id: s.user_id,
            created_at: s.created_at,
        }
    }
}

async fn handle_create_session(
    State(state): State<AppState>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>, AppError> {
    let Json(req) = body?;
    let session = state.app.create_session(&req.user_id).await?;
    Ok(Json(session.into()))
}

async fn handle_get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state
        .app
        .get_session(&id)
        .await?
        .ok_or_else(|| PipelineError::not_found("session", id))?;
    Ok(Json(session.into()))
}

// ============ GET /documents ============

#[derive(Deserialize)]
struct DocumentsQuery {
    session_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentResponse {
    document_id: String,
    session_id: Option<String>,
    name: String,
    blob_path: String,
    created_at: DateTime<Utc>,
}

impl From<Document> for DocumentResponse {
    fn from(d: Document) -> Self {
        Self {
            document_id: d.id,
            session_id: d.session_id,
            name: d.name,
            blob_path: d.blob_url,
            created_at: d.created_at,
        }
    }
}

#[derive(Serialize)]
struct DocumentsResponse {
    documents: Vec<DocumentResponse>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Query(params): Query<DocumentsQuery>,
) -> Result<Json<DocumentsResponse>, AppError> {
    let docs = state
        .app
        .list_documents(params.session_id.as_deref())
        .await?;
    Ok(Json(DocumentsResponse {
        documents: docs.into_iter().map(DocumentResponse::from).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Service;

    #[test]
    fn statuses_follow_error_class() {
        assert_eq!(
            status_for(&PipelineError::not_found("document", "x")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&PipelineError::client_data("empty")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&PipelineError::external(Service::Chat, "401")),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&PipelineError::transient(Service::Chat, "timed out")),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&PipelineError::internal("bug")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn ingest_failure_keeps_stage_in_message() {
        let err: AppError = IngestFailure {
            stage: crate::ingest::IngestStage::Extract,
            error: PipelineError::client_data("no extractable text in 'a.pdf'"),
        }
        .into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "bad_request");
        assert!(err.message.contains("extract"));
    }
}
