//! Resolution of one origin-offered object against the object store.
//!
//! Objects already in the store are served from it and cached.  Objects that
//! are not yet stored are served from the origin this time, and a backfill
//! copies them into the store for later requests.  Store failures never reach
//! the client: the origin-provided descriptor is returned unchanged.

use tracing::{debug, instrument, warn};

use super::{backfill, BatchObject, LfsContext, ObjectAction, DOWNLOAD_ACTION};
use crate::metrics::TaskKind;

/// Resolve `object` against the store.  Never fails; on any error the
/// input is returned as-is.
#[instrument(skip(ctx, object), fields(oid = %object.oid))]
pub async fn resolve_object(ctx: &LfsContext, object: BatchObject) -> BatchObject {
    let Some(action) = object.download().cloned() else {
        return object;
    };

    let exists = match ctx.store.exists(&object.oid).await {
        Ok(exists) => exists,
        Err(err) => {
            warn!(error = ?err, "store existence check failed, serving origin URL");
            return object;
        }
    };

    if exists {
        serve_from_store(ctx, object, action).await
    } else {
        start_backfill(ctx, &object, &action).await;
        ctx.metrics.s3_misses.inc();
        object
    }
}

/// Point the download action at the store and cache the result.
async fn serve_from_store(
    ctx: &LfsContext,
    mut object: BatchObject,
    mut action: ObjectAction,
) -> BatchObject {
    let urls = match ctx.store.object_urls(&object.oid).await {
        Ok(urls) => urls,
        Err(err) => {
            warn!(error = ?err, "failed to derive store URLs, serving origin URL");
            return object;
        }
    };

    action.href = urls.href;
    action.head_href = Some(urls.head_href);
    object.actions.insert(DOWNLOAD_ACTION.to_string(), action);

    if let Err(err) = ctx.cache_object(&object) {
        warn!(error = %err, "failed to cache resolved object");
    }
    ctx.metrics.s3_hits.inc();
    debug!("serving object from store");
    object
}

/// Open the origin download and hand its body to a backfill task.
async fn start_backfill(ctx: &LfsContext, object: &BatchObject, action: &ObjectAction) {
    let fetched = match ctx.links.fetch(&action.href, &action.header).await {
        Ok(fetched) => fetched,
        Err(err) => {
            warn!(error = ?err, "origin download failed, skipping backfill");
            return;
        }
    };
    if !fetched.status.is_success() {
        debug!(status = %fetched.status, "origin download not available, skipping backfill");
        return;
    }

    let task = backfill::run_backfill(ctx.clone(), object.clone(), fetched.body);
    if !ctx.tasks.spawn(TaskKind::Backfill, task) {
        ctx.metrics.record_dropped_task(TaskKind::Backfill);
    }
}
