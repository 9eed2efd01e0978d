//! HTTP surface
//!
//! - `POST /v1/rating/usage`: rate an aggregated usage document, `201` with a
//!   `Location` of the rating log entry
//! - `GET /v1/rating/rated/usage/k/:organization_id/t/:day/:seq`: read a
//!   rating log entry
//! - `GET /health`, `GET /metrics`

use crate::service::RatingService;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tally_common::{AggregatedUsageDoc, TallyError};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

/// Error response wrapper mapping error kinds to status codes
#[derive(Debug)]
pub struct ApiError(pub TallyError);

impl From<TallyError> for ApiError {
    fn from(e: TallyError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            TallyError::Validation(_) => StatusCode::BAD_REQUEST,
            TallyError::NotFound(_) => StatusCode::NOT_FOUND,
            TallyError::LockTimeout { .. } | TallyError::UpstreamUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retryable(&self) -> bool {
        matches!(
            self.0,
            TallyError::LockTimeout { .. } | TallyError::UpstreamUnavailable { .. }
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.0.kind(), error = %self.0, "Request failed");
        }
        let body = serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
            "retryable": self.retryable(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct RatedUsagePath {
    organization_id: String,
    day: String,
    seq: String,
}

/// Build the router for a rating service
pub fn router(service: Arc<RatingService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/rating/usage", post(rate_usage))
        .route(
            "/v1/rating/rated/usage/k/:organization_id/t/:day/:seq",
            get(get_rated_usage),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(service)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": tally_common::VERSION,
    }))
}

async fn metrics(State(service): State<Arc<RatingService>>) -> Result<Response, ApiError> {
    let text = service.metrics().encode()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response())
}

async fn rate_usage(
    State(service): State<Arc<RatingService>>,
    headers: HeaderMap,
    body: Result<Json<AggregatedUsageDoc>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(usage) = body.map_err(|e| TallyError::Validation(e.body_text()))?;
    let log_key = service.rate_usage(usage).await?;

    let location = format!("{}/v1/rating/rated/usage/{}", base_url(&headers), log_key);
    let location = HeaderValue::from_str(&location)
        .map_err(|e| TallyError::Internal(format!("invalid location header: {}", e)))?;

    Ok((StatusCode::CREATED, [(header::LOCATION, location)]).into_response())
}

async fn get_rated_usage(
    State(service): State<Arc<RatingService>>,
    Path(path): Path<RatedUsagePath>,
) -> Result<Response, ApiError> {
    let entry = service
        .get_rated_usage(&path.organization_id, &path.day, &path.seq)
        .await?;
    Ok(Json(entry).into_response())
}

/// `<scheme>://<host>` the caller used to reach us
fn base_url(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let scheme = header("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = header(header::HOST.as_str()).unwrap_or_else(|| "localhost".to_string());
    format!("{}://{}", scheme, host)
}
