//! HTTP worker API.
//!
//! Loopback JSON API for code-assistant clients (default port 7432).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness check with version |
//! | `POST` | `/index` | Create/resume indexing of a docset |
//! | `POST` | `/retrieve` | Hybrid search with snippet shaping |
//! | `GET` | `/status` | Per-docset crawl + index status |
//! | `GET` | `/docset/{id}` | One docset with its index status |
//! | `DELETE` | `/docset/{id}` | Delete a docset and all derived state |
//! | `GET` | `/docset/{id}/pages` | Page listing with status filter |
//! | `POST` | `/refresh` | Refresh one docset |
//! | `POST` | `/refresh-all` | Refresh every docset |
//!
//! # Error Contract
//!
//! Errors serialise as `{ "error": "<message>" }` with 400 for validation
//! failures, 404 for unknown docsets, and 500 for internal errors.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted (the search UI runs on
//! a different local port); `OPTIONS` preflight is handled globally by the
//! CORS layer.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::models::{now_ts, Page, PageStatus};
use crate::orchestrator::{IndexRequest, Orchestrator, RefreshPlan, RefreshRequest};
use crate::search::{SearchOptions, SearchResponse};

/// Shared state for all route handlers.
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

/// Start the worker API and serve until the process exits.
pub async fn run_server(orchestrator: Arc<Orchestrator>, host: &str, port: u16) -> anyhow::Result<()> {
    let state = AppState { orchestrator };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/index", post(handle_index))
        .route("/retrieve", post(handle_retrieve))
        .route("/status", get(handle_status))
        .route(
            "/docset/{id}",
            get(handle_get_docset).delete(handle_delete_docset),
        )
        .route("/docset/{id}/pages", get(handle_list_pages))
        .route("/refresh", post(handle_refresh))
        .route("/refresh-all", post(handle_refresh_all))
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", host, port);
    println!("worker listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

struct AppError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        message: message.into(),
    }
}

fn internal_error(error: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: error.to_string(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    timestamp: i64,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: now_ts(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /index ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexResponse {
    docset_id: String,
    status: crate::models::DocsetStatus,
    seed_indexed: bool,
}

async fn handle_index(
    State(state): State<AppState>,
    Json(request): Json<IndexRequest>,
) -> Result<Json<IndexResponse>, AppError> {
    if request.base_url.trim().is_empty() {
        return Err(bad_request("baseUrl must not be empty"));
    }
    if url::Url::parse(&request.base_url).is_err() {
        return Err(bad_request(format!("baseUrl is not a valid URL: {}", request.base_url)));
    }
    if request.seed_slug.trim().is_empty() {
        return Err(bad_request("seedSlug must not be empty"));
    }

    let outcome = state
        .orchestrator
        .clone()
        .index_docset(request)
        .await
        .map_err(internal_error)?;

    Ok(Json(IndexResponse {
        docset_id: outcome.docset.id,
        status: outcome.docset.status,
        seed_indexed: outcome.seed_indexed,
    }))
}

// ============ POST /retrieve ============

async fn handle_retrieve(
    State(state): State<AppState>,
    Json(options): Json<SearchOptions>,
) -> Result<Json<SearchResponse>, AppError> {
    if options.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let response = state
        .orchestrator
        .search(options)
        .await
        .map_err(internal_error)?;
    Ok(Json(response))
}

// ============ GET /status ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StatusQuery {
    docset_id: Option<String>,
    include_stuck: bool,
}

impl Default for StatusQuery {
    fn default() -> Self {
        Self {
            docset_id: None,
            include_stuck: false,
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    docsets: Vec<crate::orchestrator::DocsetReport>,
}

async fn handle_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, AppError> {
    let docsets = state
        .orchestrator
        .get_status(query.docset_id.as_deref(), query.include_stuck)
        .await
        .map_err(internal_error)?;

    if query.docset_id.is_some() && docsets.is_empty() {
        return Err(not_found("docset not found"));
    }
    Ok(Json(StatusResponse { docsets }))
}

// ============ GET /docset/{id} ============

async fn handle_get_docset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::orchestrator::DocsetReport>, AppError> {
    let mut reports = state
        .orchestrator
        .get_status(Some(&id), false)
        .await
        .map_err(internal_error)?;
    match reports.pop() {
        Some(report) => Ok(Json(report)),
        None => Err(not_found(format!("docset not found: {}", id))),
    }
}

// ============ DELETE /docset/{id} ============

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn handle_delete_docset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted = state
        .orchestrator
        .delete_docset(&id)
        .await
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found(format!("docset not found: {}", id)));
    }
    Ok(Json(DeleteResponse { deleted }))
}

// ============ GET /docset/{id}/pages ============

#[derive(Deserialize)]
#[serde(default)]
struct PagesQuery {
    status: Option<String>,
    limit: i64,
    offset: i64,
}

impl Default for PagesQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Serialize)]
struct PagesResponse {
    pages: Vec<Page>,
}

async fn handle_list_pages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PagesQuery>,
) -> Result<Json<PagesResponse>, AppError> {
    let store = state.orchestrator.metadata();
    if store.get_docset(&id).await.map_err(internal_error)?.is_none() {
        return Err(not_found(format!("docset not found: {}", id)));
    }

    let status = match &query.status {
        Some(raw) => {
            let parsed = PageStatus::parse(raw);
            if parsed.as_str() != raw {
                return Err(bad_request(format!("unknown page status: {}", raw)));
            }
            Some(parsed)
        }
        None => None,
    };

    let limit = query.limit.clamp(1, 500);
    let offset = query.offset.max(0);
    let pages = store
        .list_pages(&id, status, limit, offset)
        .await
        .map_err(internal_error)?;
    Ok(Json(PagesResponse { pages }))
}

// ============ POST /refresh, /refresh-all ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    docset_id: String,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    max_age: Option<u64>,
    #[serde(default)]
    full_reindex: bool,
}

async fn handle_refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshBody>,
) -> Result<Json<RefreshPlan>, AppError> {
    let request = RefreshRequest {
        force: body.force,
        max_age: body.max_age,
        full_reindex: body.full_reindex,
    };
    let plan = state
        .orchestrator
        .clone()
        .refresh_docset(&body.docset_id, &request)
        .await
        .map_err(|e| {
            if e.to_string().contains("not found") {
                not_found(e.to_string())
            } else {
                internal_error(e)
            }
        })?;
    Ok(Json(plan))
}

#[derive(Serialize)]
struct RefreshAllResponse {
    docsets: Vec<RefreshPlan>,
}

async fn handle_refresh_all(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<RefreshAllResponse>, AppError> {
    let docsets = state
        .orchestrator
        .clone()
        .refresh_all(&request)
        .await
        .map_err(internal_error)?;
    Ok(Json(RefreshAllResponse { docsets }))
}
