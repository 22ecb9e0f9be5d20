//! Object storage layer.
//!
//! LFS objects are stored in S3 under their OID.  The proxy checks for their
//! existence, hands out (optionally pre-signed) URLs to clients, and backfills
//! missing objects by streaming them from the origin.

pub mod s3;

use std::pin::Pin;

use anyhow::Result;
use bytes::Bytes;
use tokio_stream::Stream;

pub use s3::S3Storage;

/// Streamed object body.  Dropping it releases the underlying connection.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// URL pair handed to clients for a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUrls {
    /// Retrieval URL.
    pub href: String,
    /// Existence-probe URL (HEAD).
    pub head_href: String,
}

/// Capabilities the resolution pipeline needs from an object store.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether an object is stored under `oid`.
    async fn exists(&self, oid: &str) -> Result<bool>;

    /// Derive the download and probe URLs for `oid`.  Pre-signed when
    /// presigning is enabled, a deterministic public URL otherwise.
    async fn object_urls(&self, oid: &str) -> Result<ObjectUrls>;

    /// Stream `body` into the store under `oid`.
    async fn upload(&self, oid: &str, body: BodyStream) -> Result<()>;
}
