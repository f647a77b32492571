use crate::document::{documents_from_episodes, load_documents, EpisodeRecord};
use crate::error::RagError;
use crate::rag::{ChatReply, HealthReport, IngestReport, RagEngine, SourcePassage};
use crate::retrieval::Query;
use crate::session::Feedback;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

const DEFAULT_CHAPTER: u32 = 1;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RagEngine>,
    /// Root for `path` ingestion; `None` disables it
    pub ingest_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        match err {
            RagError::InvalidInput(msg) => ApiError::BadRequest(msg),
            RagError::NotFound { message, .. } => ApiError::NotFound(message),
            err @ RagError::Upstream { .. } => ApiError::ServiceUnavailable(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<u64>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SourcePassage>,
    pub total_results: usize,
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    /// File under the ingest directory, relative or absolute
    #[serde(default)]
    pub path: Option<String>,
    /// Inline episode records
    #[serde(default)]
    pub episodes: Option<Vec<EpisodeRecord>>,
    #[serde(default)]
    pub chapter: Option<u32>,
    #[serde(default)]
    pub recreate: bool,
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub recorded: bool,
    pub id: String,
    pub should_ask_feedback: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/search", post(search))
        .route("/ingest", post(ingest))
        .route("/feedback", post(feedback))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind `addr` and serve until the process is stopped
pub async fn serve(
    engine: Arc<RagEngine>,
    addr: &str,
    ingest_dir: Option<PathBuf>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(AppState { engine, ingest_dir })).await
}

/// Resolve a requested file against the ingest directory
///
/// Symlinks and `..` are resolved first, so the result is always inside `root`.
pub fn resolve_ingest_path(root: Option<&Path>, requested: &str) -> Result<PathBuf, RagError> {
    let root = root.ok_or_else(|| {
        RagError::invalid_input("file ingestion is disabled; set INGEST_DIR to enable it")
    })?;
    let root = root
        .canonicalize()
        .map_err(|e| RagError::invalid_input(format!("ingest directory is unusable: {}", e)))?;

    let candidate = root.join(requested);
    let resolved = candidate
        .canonicalize()
        .map_err(|_| RagError::invalid_input(format!("no such file under ingest directory: {}", requested)))?;

    if !resolved.starts_with(&root) || !resolved.is_file() {
        return Err(RagError::invalid_input(format!(
            "path is outside the ingest directory: {}",
            requested
        )));
    }
    Ok(resolved)
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.engine.health().await)
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatReply>, ApiError> {
    let query = Query::new(request.query)
        .with_conversation(request.session_id)
        .with_top_k(request.top_k);
    Ok(Json(state.engine.chat(query).await?))
}

async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let query = Query::new(request.query).with_top_k(request.top_k);
    let results: Vec<SourcePassage> = state
        .engine
        .search(&query)
        .await?
        .iter()
        .map(SourcePassage::from)
        .collect();

    Ok(Json(SearchResponse {
        query: query.text,
        total_results: results.len(),
        results,
    }))
}

async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestReport>, ApiError> {
    let chapter = request.chapter.unwrap_or(DEFAULT_CHAPTER);
    let documents = match (request.episodes, request.path) {
        (Some(records), _) => documents_from_episodes(records, chapter),
        (None, Some(path)) => {
            let path = resolve_ingest_path(state.ingest_dir.as_deref(), &path).map_err(|e| {
                warn!("Rejected ingest path: {}", e);
                ApiError::from(e)
            })?;
            load_documents(&path, chapter)?
        }
        (None, None) => {
            return Err(ApiError::BadRequest(
                "either `path` or `episodes` is required".to_string(),
            ))
        }
    };

    let report = state.engine.ingest(&documents, request.recreate).await?;
    Ok(Json(report))
}

async fn feedback(
    State(state): State<AppState>,
    Json(feedback): Json<Feedback>,
) -> Result<Json<FeedbackResponse>, ApiError> {
    let id = state.engine.record_feedback(&feedback).await.map_err(|e| {
        warn!("Rejected feedback: {}", e);
        ApiError::from(e)
    })?;

    Ok(Json(FeedbackResponse {
        recorded: true,
        id,
        should_ask_feedback: feedback.should_ask_feedback(),
    }))
}
