//! Axum router and request handlers.
//!
//! Routes:
//! - `POST /objects/batch` - Git LFS batch API
//! - `GET  /health`        - Liveness check
//! - `GET  /metrics`       - Prometheus metrics (when `metrics.enabled`)

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, instrument, warn};

use crate::lfs::{BatchRequest, ErrorDocument, LFS_MEDIA_TYPE};
use crate::upstream::UpstreamError;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/objects/batch", post(handle_batch))
        .route("/health", get(crate::health::health_handler));
    if state.config.metrics.enabled {
        router = router.route("/metrics", get(handle_metrics));
    }

    router
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /objects/batch`
///
/// The body is parsed here so that malformed requests are rejected before
/// the cache or the origin is consulted.
#[instrument(skip_all, fields(path = %uri.path()))]
async fn handle_batch(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let request: BatchRequest = serde_json::from_slice(&body).map_err(|e| {
        debug!(error = %e, "rejecting malformed batch request");
        AppError::BadRequest(format!("invalid batch request: {e}"))
    })?;

    let response = state
        .coordinator
        .resolve(&request, uri.path(), &headers)
        .await?;

    let body = serde_json::to_vec(&response)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to encode batch response: {e}")))?;

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, LFS_MEDIA_TYPE)], body).into_response())
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state.metrics.encode()?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The request body is not a batch request.
    BadRequest(String),
    /// The origin rejected the batch call or could not be used.
    Upstream(UpstreamError),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

fn error_document(status: StatusCode, message: String) -> Response {
    match serde_json::to_vec(&ErrorDocument { message }) {
        Ok(body) => (status, [(header::CONTENT_TYPE, LFS_MEDIA_TYPE)], body).into_response(),
        Err(_) => status.into_response(),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => error_document(StatusCode::BAD_REQUEST, msg),
            AppError::Upstream(UpstreamError::Status {
                status,
                content_type,
                content_encoding,
                body,
            }) => {
                warn!(%status, "relaying origin failure");
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = status;
                if let Some(content_type) = content_type {
                    response
                        .headers_mut()
                        .insert(header::CONTENT_TYPE, content_type);
                }
                if let Some(content_encoding) = content_encoding {
                    response
                        .headers_mut()
                        .insert(header::CONTENT_ENCODING, content_encoding);
                }
                response
            }
            AppError::Upstream(err) => {
                warn!(error = %err, "origin unavailable");
                error_document(err.status(), err.to_string())
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                error_document(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
            }
        }
    }
}

impl From<UpstreamError> for AppError {
    fn from(err: UpstreamError) -> Self {
        AppError::Upstream(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
