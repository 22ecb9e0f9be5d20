use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use flate2::read::GzDecoder;
use reqwest::Url;
use tracing::{debug, instrument, warn};

use super::{UpstreamClient, UpstreamError};
use crate::lfs::{BatchRequest, BatchResponse, LFS_MEDIA_TYPE};

/// Headers that describe the inbound connection or body rather than the
/// request, and so are not forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::HOST,
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
];

/// [`UpstreamClient`] speaking the batch API to the origin over HTTP.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid upstream base URL: {base_url}"))?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// The origin URL for an inbound request path: the inbound path is
    /// appended to the base URL's path.
    pub fn batch_url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let prefix = self.base_url.path().trim_end_matches('/');
        url.set_path(&format!("{prefix}/{}", path.trim_start_matches('/')));
        url.set_query(None);
        url
    }
}

#[async_trait::async_trait]
impl UpstreamClient for HttpUpstream {
    #[instrument(skip(self, request, headers), fields(objects = request.objects.len()))]
    async fn batch(
        &self,
        request: &BatchRequest,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<BatchResponse, UpstreamError> {
        let url = self.batch_url(path);
        let body = serde_json::to_vec(request)
            .map_err(|e| UpstreamError::Transport(Box::new(e)))?;

        debug!(%url, "forwarding batch request to origin");

        let resp = self
            .client
            .post(url)
            .headers(forwarded_headers(headers))
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "origin unreachable");
                UpstreamError::Transport(Box::new(e))
            })?;

        let status = resp.status();
        let resp_headers = resp.headers().clone();
        let raw = resp
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transport(Box::new(e)))?;

        if !status.is_success() {
            warn!(%status, "origin returned error for batch request");
            // The status is relayed whatever the body; an error body that
            // cannot be decoded goes out as received.
            let (body, content_encoding) = match decode_body(&resp_headers, raw.clone()) {
                Ok(body) => (body, None),
                Err(err) => {
                    debug!(error = %err, "relaying origin error body undecoded");
                    (raw, resp_headers.get(header::CONTENT_ENCODING).cloned())
                }
            };
            return Err(UpstreamError::Status {
                status,
                content_type: resp_headers.get(header::CONTENT_TYPE).cloned(),
                content_encoding,
                body,
            });
        }

        let body = decode_body(&resp_headers, raw)?;

        serde_json::from_slice(&body).map_err(|e| {
            warn!(error = %e, "origin returned an unparseable batch response");
            UpstreamError::InvalidResponse(e.to_string())
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Copy the client's headers for the origin request.  `Accept-Encoding` is
/// pinned to gzip because the proxy, not the client, decodes the response.
fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len() + 2);
    for (name, value) in headers {
        if HOP_BY_HOP.contains(name) || name == header::ACCEPT_ENCODING {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    if !out.contains_key(header::CONTENT_TYPE) {
        out.insert(header::CONTENT_TYPE, HeaderValue::from_static(LFS_MEDIA_TYPE));
    }
    out
}

/// Undo a gzip `Content-Encoding`; other encodings are rejected.
fn decode_body(headers: &HeaderMap, raw: Bytes) -> Result<Bytes, UpstreamError> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");

    if encoding.is_empty() || encoding.eq_ignore_ascii_case("identity") {
        return Ok(raw);
    }
    if !encoding.eq_ignore_ascii_case("gzip") {
        return Err(UpstreamError::InvalidResponse(format!(
            "unsupported content encoding: {encoding}"
        )));
    }

    let mut decoded = Vec::with_capacity(raw.len() * 4);
    GzDecoder::new(raw.as_ref())
        .read_to_end(&mut decoded)
        .map_err(|e| UpstreamError::InvalidResponse(format!("gzip decode failed: {e}")))?;
    Ok(Bytes::from(decoded))
}
