use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub health: &'static str,
}

/// `GET /health` handler.  Liveness only; store and origin outages degrade
/// individual requests, not the process.
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { health: "ok" }))
}
