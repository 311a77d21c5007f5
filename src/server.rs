//! The HTTP Surface (C10).
//!
//! Thin: validates input at the edge, routes to the Hybrid Service, and
//! serialises its `CoreError`/`SearchResponse` values to JSON. All search
//! semantics live in [`crate::hybrid`].
//!
//! # Endpoints
//!
//! | Method | Path      | Description                              |
//! |--------|-----------|------------------------------------------|
//! | `GET`  | `/search` | Query params mirror the POST body fields |
//! | `POST` | `/search` | JSON body, for long queries               |
//! | `GET`  | `/stats`  | Vector/lexical index stats + config hash |
//! | `GET`  | `/health` | Liveness of the vector DB, lexical store, embedding backend |
//!
//! Status codes: 200 ok, 400 invalid input, 503 unhealthy, 500 otherwise.
//! CORS is off by default; `server.cors_permissive` enables an all-origins
//! layer for local web UIs.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::CoreError;
use crate::hybrid::{HealthStatus, HybridService, SearchMode, SearchRequest};

#[derive(Clone)]
struct AppState {
    service: Arc<HybridService>,
}

pub async fn run_server(config: &Config, service: HybridService) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState {
        service: Arc::new(service),
    };

    let mut app = Router::new()
        .route("/search", get(handle_search_get).post(handle_search_post))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if config.server.cors_permissive {
        app = app.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));
    }

    info!(bind = %bind_addr, "starting HTTP surface");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CoreError::DimensionMismatch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::TransientEmbeddingFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::PartialContextFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Query-string mirror of [`SearchRequest`] for `GET /search`.
#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    mode: Option<SearchMode>,
    limit: Option<i64>,
    context: Option<i64>,
    rrf_k: Option<f64>,
    w_vector: Option<f64>,
    w_bm25: Option<f64>,
    candidate_mult: Option<i64>,
}

impl From<SearchQuery> for SearchRequest {
    fn from(q: SearchQuery) -> Self {
        SearchRequest {
            query: q.q,
            mode: q.mode.unwrap_or_default(),
            limit: q.limit.unwrap_or(20),
            context: q.context.unwrap_or(0),
            rrf_k: q.rrf_k,
            w_vector: q.w_vector,
            w_bm25: q.w_bm25,
            candidate_mult: q.candidate_mult,
        }
    }
}

async fn handle_search_get(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    run_search(&state, query.into()).await
}

async fn handle_search_post(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    run_search(&state, req).await
}

async fn run_search(state: &AppState, req: SearchRequest) -> Result<impl IntoResponse, ApiError> {
    let started = Instant::now();
    let cancel = CancellationToken::new();
    let result = state.service.search(&req, &cancel).await;
    let elapsed = started.elapsed();

    match result {
        Ok(response) => {
            info!(
                mode = ?req.mode,
                status = 200,
                duration_ms = elapsed.as_millis() as u64,
                "GET/POST /search"
            );
            Ok(Json(response))
        }
        Err(e) => {
            let api_err = ApiError(e);
            info!(
                mode = ?req.mode,
                status = api_err.status_code().as_u16(),
                duration_ms = elapsed.as_millis() as u64,
                error = %api_err.0,
                "GET/POST /search"
            );
            Err(api_err)
        }
    }
}

async fn handle_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.service.stats().await?;
    Ok(Json(stats))
}

async fn handle_health(State(state): State<AppState>) -> Response {
    let health = state.service.health().await;
    let status = match health.status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(health)).into_response()
}
