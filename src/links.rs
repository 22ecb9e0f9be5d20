//! Plain HTTP requests against object hrefs.
//!
//! The resolver streams objects the store does not have yet from the
//! origin-provided download href, and the validator probes cached pre-signed
//! links with a HEAD request.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use tokio_stream::StreamExt;
use tracing::{debug, instrument};

use crate::storage::BodyStream;

/// Shared outbound client.  The read timeout bounds every wait on a socket,
/// so a stalled href fails instead of holding a batch response open, while
/// a slow but live download stream keeps going.
pub fn build_http_client(connect_timeout: Duration, read_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("lfsproxy/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .build()
        .context("failed to build reqwest client")
}

/// Response of a streaming GET.
pub struct FetchedObject {
    pub status: StatusCode,
    pub body: BodyStream,
}

#[async_trait::async_trait]
pub trait LinkClient: Send + Sync {
    /// `HEAD href`.  Transport failures are errors; any HTTP status is `Ok`.
    async fn probe(&self, href: &str) -> Result<StatusCode>;

    /// `GET href` with the extra `headers` an LFS action requires.  Returns
    /// once the response head has arrived; the body is streamed.
    async fn fetch(&self, href: &str, headers: &BTreeMap<String, String>) -> Result<FetchedObject>;
}

#[async_trait::async_trait]
impl LinkClient for reqwest::Client {
    #[instrument(skip(self, href))]
    async fn probe(&self, href: &str) -> Result<StatusCode> {
        let resp = self.head(href).send().await.context("HEAD request failed")?;
        debug!(status = %resp.status(), "link probed");
        Ok(resp.status())
    }

    #[instrument(skip(self, href, headers))]
    async fn fetch(&self, href: &str, headers: &BTreeMap<String, String>) -> Result<FetchedObject> {
        let mut req = self.get(href);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req.send().await.context("GET request failed")?;
        let status = resp.status();
        debug!(%status, "object fetched");

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.context("read response body"));
        Ok(FetchedObject {
            status,
            body: Box::pin(body),
        })
    }
}
