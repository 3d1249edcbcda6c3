//! Axum JSON surface for the listing search.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use espec_core::SearchParams;
use espec_pipeline::{ListingSearchPipeline, PipelineConfig, SearchError};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "espec-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ListingSearchPipeline>,
}

impl AppState {
    pub fn new(pipeline: ListingSearchPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("ESPEC_WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("ESPEC_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/search", get(search_handler))
        .route("/healthz", get(healthz_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let pipeline = ListingSearchPipeline::from_config(&PipelineConfig::from_env())?;
    serve(WebConfig::from_env(), AppState::new(pipeline)).await
}

pub async fn serve(config: WebConfig, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn search_handler(
    State(state): State<AppState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": rejection.body_text() })),
            )
                .into_response()
        }
    };
    match state.pipeline.search(&params).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => search_error(err),
    }
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn search_error(err: SearchError) -> Response {
    match err {
        SearchError::MissingCredential => {
            error!("search credential is not configured");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
        SearchError::Validation(inner) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": inner.to_string() })),
        )
            .into_response(),
        SearchError::Upstream { status, details } => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "error": "Brave API error",
                "status": status,
                "details": details,
            })),
        )
            .into_response(),
        other => {
            error!(error = %other, "listing search failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Server error" })),
            )
                .into_response()
        }
    }
}
