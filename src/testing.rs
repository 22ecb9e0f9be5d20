//! Deterministic in-process doubles for the proxy's collaborators.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use axum::http::{HeaderMap, StatusCode};
use bytes::{Bytes, BytesMut};
use tokio::sync::Barrier;
use tokio_stream::StreamExt;

use crate::cache::ObjectCache;
use crate::lfs::{
    BatchCoordinator, BatchObject, BatchRequest, BatchResponse, LfsContext, ObjectAction,
    ObjectPointer, Operation, DOWNLOAD_ACTION,
};
use crate::links::{FetchedObject, LinkClient};
use crate::metrics::MetricsRegistry;
use crate::storage::{BodyStream, ObjectStore, ObjectUrls};
use crate::tasks::BackgroundTasks;
use crate::upstream::{UpstreamClient, UpstreamError};

pub const OBJECT_BYTES: &[u8] = b"large file contents";

pub fn origin_href(oid: &str) -> String {
    format!("https://origin.test/objects/{oid}")
}

pub fn store_href(oid: &str) -> String {
    format!("https://store.test/{oid}?X-Amz-Signature=get")
}

pub fn store_head_href(oid: &str) -> String {
    format!("https://store.test/{oid}?X-Amz-Signature=head")
}

/// Descriptor as the origin returns it: a single download action.
pub fn download_object(oid: &str) -> BatchObject {
    BatchObject {
        oid: oid.to_string(),
        size: 123,
        authenticated: true,
        actions: BTreeMap::from([(
            DOWNLOAD_ACTION.to_string(),
            ObjectAction {
                href: origin_href(oid),
                head_href: None,
                header: BTreeMap::from([("Authorization".to_string(), "RemoteAuth t".to_string())]),
                expires_in: Some(3600),
                expires_at: None,
            },
        )]),
        error: None,
    }
}

/// Descriptor as the proxy caches it after a store hit.
pub fn cached_object(oid: &str) -> BatchObject {
    let mut object = download_object(oid);
    if let Some(action) = object.actions.get_mut(DOWNLOAD_ACTION) {
        action.href = store_href(oid);
        action.head_href = Some(store_head_href(oid));
    }
    object
}

pub fn download_request(oids: &[&str]) -> BatchRequest {
    BatchRequest {
        operation: Operation::Download,
        transfers: Some(vec!["basic".to_string()]),
        reference: Some(BTreeMap::from([(
            "name".to_string(),
            "refs/heads/main".to_string(),
        )])),
        objects: oids
            .iter()
            .map(|oid| ObjectPointer {
                oid: oid.to_string(),
                size: 123,
            })
            .collect(),
        hash_algo: Some("sha256".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MapCache {
    entries: Mutex<HashMap<String, Bytes>>,
}

impl MapCache {
    pub fn insert_object(&self, object: &BatchObject) {
        self.set(&object.oid, object.to_cache_bytes().unwrap());
    }

    pub fn object(&self, oid: &str) -> Option<BatchObject> {
        self.get(oid)
            .map(|bytes| BatchObject::from_cache_bytes(&bytes).unwrap())
    }

    pub fn contains(&self, oid: &str) -> bool {
        self.entries.lock().unwrap().contains_key(oid)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl ObjectCache for MapCache {
    fn get(&self, oid: &str) -> Option<Bytes> {
        self.entries.lock().unwrap().get(oid).cloned()
    }

    fn set(&self, oid: &str, value: Bytes) {
        self.entries.lock().unwrap().insert(oid.to_string(), value);
    }

    fn delete(&self, oid: &str) {
        self.entries.lock().unwrap().remove(oid);
    }
}

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<HashMap<String, Bytes>>,
    pub fail_exists: AtomicBool,
    pub fail_urls: AtomicBool,
    pub fail_upload: AtomicBool,
    pub panic_exists: AtomicBool,
    /// When set, every existence check waits here first.
    pub exists_barrier: Mutex<Option<Arc<Barrier>>>,
    pub uploads: AtomicUsize,
}

impl FakeStore {
    pub fn put(&self, oid: &str, data: &'static [u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(oid.to_string(), Bytes::from_static(data));
    }

    pub fn stored(&self, oid: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(oid).cloned()
    }
}

#[async_trait::async_trait]
impl ObjectStore for FakeStore {
    async fn exists(&self, oid: &str) -> Result<bool> {
        if self.panic_exists.load(Ordering::SeqCst) {
            panic!("store client poisoned");
        }
        let barrier = self.exists_barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        if self.fail_exists.load(Ordering::SeqCst) {
            bail!("HeadObject: access denied");
        }
        Ok(self.objects.lock().unwrap().contains_key(oid))
    }

    async fn object_urls(&self, oid: &str) -> Result<ObjectUrls> {
        if self.fail_urls.load(Ordering::SeqCst) {
            bail!("presign: no credentials");
        }
        Ok(ObjectUrls {
            href: store_href(oid),
            head_href: store_head_href(oid),
        })
    }

    async fn upload(&self, oid: &str, mut body: BodyStream) -> Result<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let mut data = BytesMut::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
        }
        if self.fail_upload.load(Ordering::SeqCst) {
            bail!("PutObject: slow down");
        }
        self.objects
            .lock()
            .unwrap()
            .insert(oid.to_string(), data.freeze());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

pub struct FakeLinks {
    probe_statuses: Mutex<HashMap<String, StatusCode>>,
    pub fail_probe: AtomicBool,
    pub fetch_status: Mutex<StatusCode>,
    pub fail_fetch: AtomicBool,
    pub probed: Mutex<Vec<String>>,
    pub fetched: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl Default for FakeLinks {
    fn default() -> Self {
        Self {
            probe_statuses: Mutex::default(),
            fail_probe: AtomicBool::new(false),
            fetch_status: Mutex::new(StatusCode::OK),
            fail_fetch: AtomicBool::new(false),
            probed: Mutex::default(),
            fetched: Mutex::default(),
        }
    }
}

impl FakeLinks {
    /// Status the probe of `href` answers with (200 when unset).
    pub fn set_probe_status(&self, href: &str, status: StatusCode) {
        self.probe_statuses
            .lock()
            .unwrap()
            .insert(href.to_string(), status);
    }

    pub fn fetched_hrefs(&self) -> Vec<String> {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .map(|(href, _)| href.clone())
            .collect()
    }

    pub fn probed_hrefs(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LinkClient for FakeLinks {
    async fn probe(&self, href: &str) -> Result<StatusCode> {
        self.probed.lock().unwrap().push(href.to_string());
        if self.fail_probe.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(self
            .probe_statuses
            .lock()
            .unwrap()
            .get(href)
            .copied()
            .unwrap_or(StatusCode::OK))
    }

    async fn fetch(&self, href: &str, headers: &BTreeMap<String, String>) -> Result<FetchedObject> {
        self.fetched
            .lock()
            .unwrap()
            .push((href.to_string(), headers.clone()));
        if self.fail_fetch.load(Ordering::SeqCst) {
            bail!("connection reset");
        }
        let chunks: Vec<Result<Bytes>> = OBJECT_BYTES
            .chunks(5)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(FetchedObject {
            status: *self.fetch_status.lock().unwrap(),
            body: Box::pin(tokio_stream::iter(chunks)),
        })
    }
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

enum UpstreamMode {
    /// Offer a download action for every requested object.
    Downloads,
    Respond(BatchResponse),
    Fail(StatusCode, &'static str),
}

pub struct FakeUpstream {
    mode: Mutex<UpstreamMode>,
    pub requests: Mutex<Vec<(BatchRequest, String, HeaderMap)>>,
}

impl Default for FakeUpstream {
    fn default() -> Self {
        Self {
            mode: Mutex::new(UpstreamMode::Downloads),
            requests: Mutex::default(),
        }
    }
}

impl FakeUpstream {
    pub fn respond_with(&self, response: BatchResponse) {
        *self.mode.lock().unwrap() = UpstreamMode::Respond(response);
    }

    pub fn fail_with(&self, status: StatusCode, body: &'static str) {
        *self.mode.lock().unwrap() = UpstreamMode::Fail(status, body);
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requested_oids(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(req, _, _)| req.objects.iter().map(|o| o.oid.clone()).collect())
            .collect()
    }
}

#[async_trait::async_trait]
impl UpstreamClient for FakeUpstream {
    async fn batch(
        &self,
        request: &BatchRequest,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<BatchResponse, UpstreamError> {
        self.requests
            .lock()
            .unwrap()
            .push((request.clone(), path.to_string(), headers.clone()));
        match &*self.mode.lock().unwrap() {
            UpstreamMode::Downloads => Ok(BatchResponse {
                transfer: Some("basic".to_string()),
                objects: request
                    .objects
                    .iter()
                    .map(|o| download_object(&o.oid))
                    .collect(),
                hash_algo: request.hash_algo.clone(),
            }),
            UpstreamMode::Respond(response) => Ok(response.clone()),
            UpstreamMode::Fail(status, body) => Err(UpstreamError::Status {
                status: *status,
                content_type: None,
                content_encoding: None,
                body: Bytes::from_static(body.as_bytes()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// All doubles wired together the way `main` wires the real collaborators.
pub struct Harness {
    pub cache: Arc<MapCache>,
    pub store: Arc<FakeStore>,
    pub links: Arc<FakeLinks>,
    pub upstream: Arc<FakeUpstream>,
    pub metrics: MetricsRegistry,
    pub tasks: BackgroundTasks,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self {
            cache: Arc::default(),
            store: Arc::default(),
            links: Arc::default(),
            upstream: Arc::default(),
            metrics: MetricsRegistry::new(),
            tasks: BackgroundTasks::new(64),
        }
    }

    pub fn ctx(&self) -> LfsContext {
        LfsContext {
            cache: self.cache.clone(),
            store: self.store.clone(),
            links: self.links.clone(),
            metrics: Arc::clone(&self.metrics.metrics),
            tasks: self.tasks.clone(),
        }
    }

    pub fn coordinator(&self, presign_enabled: bool) -> BatchCoordinator {
        BatchCoordinator::new(self.ctx(), self.upstream.clone(), presign_enabled)
    }

    pub fn counter(&self, read: impl Fn(&crate::metrics::Metrics) -> u64) -> u64 {
        read(&self.metrics.metrics)
    }
}
