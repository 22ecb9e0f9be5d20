//! Answers one batch request from the descriptor cache, the origin and the
//! object store.

use std::sync::Arc;

use axum::http::HeaderMap;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::{resolver, validator, BatchObject, BatchRequest, BatchResponse, LfsContext};
use crate::metrics::TaskKind;
use crate::upstream::{UpstreamClient, UpstreamError};

pub struct BatchCoordinator {
    ctx: LfsContext,
    upstream: Arc<dyn UpstreamClient>,
    /// Cached links are only re-validated when they are pre-signed and can
    /// therefore expire.
    presign_enabled: bool,
}

impl BatchCoordinator {
    pub fn new(ctx: LfsContext, upstream: Arc<dyn UpstreamClient>, presign_enabled: bool) -> Self {
        Self {
            ctx,
            upstream,
            presign_enabled,
        }
    }

    /// Resolve every object of `request`.
    ///
    /// Cached descriptors are answered directly; the rest go to the origin in
    /// a single derived request and each returned download is resolved
    /// against the store concurrently.  Only an origin failure is returned as
    /// an error, in which case the cache is left untouched.
    #[instrument(skip_all, fields(path = %path, objects = request.objects.len()))]
    pub async fn resolve(
        &self,
        request: &BatchRequest,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<BatchResponse, UpstreamError> {
        let mut resolved = Vec::with_capacity(request.objects.len());
        let mut unresolved = Vec::new();

        for pointer in &request.objects {
            match self.cached(&pointer.oid) {
                Some(object) => {
                    self.ctx.metrics.cache_hits.inc();
                    self.schedule_validation(&object);
                    resolved.push(object);
                }
                None => {
                    self.ctx.metrics.cache_misses.inc();
                    unresolved.push(pointer.clone());
                }
            }
        }

        if unresolved.is_empty() {
            debug!("batch answered from cache");
            return Ok(BatchResponse {
                transfer: None,
                objects: resolved,
                hash_algo: None,
            });
        }

        let derived = request.with_objects(unresolved);
        let response = self.upstream.batch(&derived, path, headers).await?;

        let mut workers: Vec<(JoinHandle<BatchObject>, BatchObject)> = Vec::new();
        for object in response.objects {
            if object.download().is_none() {
                resolved.push(object);
                continue;
            }
            let ctx = self.ctx.clone();
            let fallback = object.clone();
            let handle = tokio::spawn(async move { resolver::resolve_object(&ctx, object).await });
            workers.push((handle, fallback));
        }

        for (handle, fallback) in workers {
            match handle.await {
                Ok(object) => resolved.push(object),
                Err(err) => {
                    warn!(oid = %fallback.oid, error = %err, "resolver task failed, serving origin descriptor");
                    resolved.push(fallback);
                }
            }
        }

        Ok(BatchResponse {
            transfer: response.transfer,
            objects: resolved,
            hash_algo: response.hash_algo,
        })
    }

    /// Cached descriptor for `oid`, if present and readable.
    fn cached(&self, oid: &str) -> Option<BatchObject> {
        let bytes = self.ctx.cache.get(oid)?;
        match BatchObject::from_cache_bytes(&bytes) {
            Ok(object) => Some(object),
            Err(err) => {
                debug!(oid, error = %err, "unreadable cache entry, treating as miss");
                None
            }
        }
    }

    fn schedule_validation(&self, object: &BatchObject) {
        if !self.presign_enabled {
            return;
        }
        let Some(head_href) = object.download().and_then(|a| a.head_href.clone()) else {
            return;
        };

        let task = validator::validate_cached_link(self.ctx.clone(), object.oid.clone(), head_href);
        if !self.ctx.tasks.spawn(TaskKind::Validation, task) {
            self.ctx.metrics.record_dropped_task(TaskKind::Validation);
        }
    }
}
