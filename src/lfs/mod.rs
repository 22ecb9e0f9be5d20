//! Git LFS batch API handling.
//!
//! The wire types mirror the batch API JSON documents
//! (<https://github.com/git-lfs/git-lfs/blob/main/docs/api/batch.md>).  The
//! submodules implement the resolution pipeline: the [`coordinator`] answers a
//! batch request from the descriptor cache and the origin, each object the
//! origin offers for download goes through the [`resolver`], and the
//! [`backfill`] and [`validator`] tasks maintain the store and the cache in
//! the background.

pub mod backfill;
pub mod coordinator;
pub mod resolver;
pub mod validator;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::ObjectCache;
use crate::links::LinkClient;
use crate::metrics::Metrics;
use crate::storage::ObjectStore;
use crate::tasks::BackgroundTasks;

pub use coordinator::BatchCoordinator;

/// Name of the action that carries a retrievable payload.
pub const DOWNLOAD_ACTION: &str = "download";

/// Media type of batch API request and response bodies.
pub const LFS_MEDIA_TYPE: &str = "application/vnd.git-lfs+json";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Batch API request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfers: Option<Vec<String>>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<BTreeMap<String, String>>,
    pub objects: Vec<ObjectPointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algo: Option<String>,
}

impl BatchRequest {
    /// Copy of this request carrying only `objects`; every other field is
    /// preserved as-is.
    pub fn with_objects(&self, objects: Vec<ObjectPointer>) -> Self {
        Self {
            operation: self.operation,
            transfers: self.transfers.clone(),
            reference: self.reference.clone(),
            objects,
            hash_algo: self.hash_algo.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Download,
    Upload,
}

/// One object named in a [`BatchRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPointer {
    pub oid: String,
    pub size: i64,
}

/// Batch API response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<String>,
    #[serde(default)]
    pub objects: Vec<BatchObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algo: Option<String>,
}

/// Per-object entry of a [`BatchResponse`], also the value stored in the
/// descriptor cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchObject {
    pub oid: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, ObjectAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ObjectError>,
}

impl BatchObject {
    pub fn download(&self) -> Option<&ObjectAction> {
        self.actions.get(DOWNLOAD_ACTION)
    }

    /// Serialize for the descriptor cache.
    pub fn to_cache_bytes(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_cache_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAction {
    pub href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_href: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectError {
    pub code: i64,
    pub message: String,
}

/// Error document returned to clients for requests the proxy rejects itself.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDocument {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Shared collaborators
// ---------------------------------------------------------------------------

/// Collaborators shared by the resolver and the background tasks.
#[derive(Clone)]
pub struct LfsContext {
    pub cache: Arc<dyn ObjectCache>,
    pub store: Arc<dyn ObjectStore>,
    pub links: Arc<dyn LinkClient>,
    pub metrics: Arc<Metrics>,
    pub tasks: BackgroundTasks,
}

impl LfsContext {
    /// Serialize `object` and overwrite its cache entry.
    pub fn cache_object(&self, object: &BatchObject) -> serde_json::Result<()> {
        let bytes = object.to_cache_bytes()?;
        self.cache.set(&object.oid, bytes);
        Ok(())
    }
}
