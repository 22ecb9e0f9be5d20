//! Origin LFS server client.
//!
//! Batch requests the cache cannot answer are forwarded to the origin.  Any
//! failure there aborts the whole batch call, so [`UpstreamError`] keeps the
//! origin's status and raw body for relaying to the client.

pub mod client;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;

use crate::lfs::{BatchRequest, BatchResponse};

pub use client::HttpUpstream;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The origin answered with a non-success status.
    /// `content_encoding` is set when `body` is relayed still encoded.
    #[error("upstream returned {status}")]
    Status {
        status: StatusCode,
        content_type: Option<HeaderValue>,
        content_encoding: Option<HeaderValue>,
        body: Bytes,
    },
    /// The origin could not be reached or the response could not be read.
    #[error("upstream request failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The origin answered 2xx with a body that is not a batch response.
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// Status to hand back to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Status { status, .. } => *status,
            Self::Transport(_) | Self::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Forwards batch requests to the origin.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send `request` to the origin at the path the client used, with the
    /// client's headers.
    async fn batch(
        &self,
        request: &BatchRequest,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<BatchResponse, UpstreamError>;
}
