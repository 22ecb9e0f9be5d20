//! Copies an object missing from the store into it, then caches a descriptor
//! pointing at the stored copy.

use std::collections::BTreeMap;

use tracing::{info, instrument, warn};

use super::{BatchObject, LfsContext, ObjectAction, DOWNLOAD_ACTION};
use crate::metrics::BackfillOutcome;
use crate::storage::{BodyStream, ObjectUrls};

/// Upload `body` under `object.oid` and refresh the cache entry.  Failures
/// are logged and counted, never returned.  `body` is dropped on every path.
#[instrument(skip_all, fields(oid = %object.oid, size = object.size))]
pub async fn run_backfill(ctx: LfsContext, object: BatchObject, body: BodyStream) {
    if let Err(err) = ctx.store.upload(&object.oid, body).await {
        warn!(error = ?err, "backfill upload failed");
        ctx.metrics.record_backfill(BackfillOutcome::Failed);
        return;
    }

    // The object is stored from here on; if the cache cannot be refreshed the
    // next resolution finds it in the store and caches it then.
    let urls = match ctx.store.object_urls(&object.oid).await {
        Ok(urls) => urls,
        Err(err) => {
            warn!(error = ?err, "uploaded object but failed to derive store URLs");
            ctx.metrics.record_backfill(BackfillOutcome::Uploaded);
            return;
        }
    };

    let refreshed = stored_descriptor(&object, urls);
    match ctx.cache_object(&refreshed) {
        Ok(()) => {
            info!("object backfilled into store");
            ctx.metrics.record_backfill(BackfillOutcome::Cached);
        }
        Err(err) => {
            warn!(error = %err, "uploaded object but failed to cache it");
            ctx.metrics.record_backfill(BackfillOutcome::Uploaded);
        }
    }
}

/// Descriptor for the stored copy of `object`: identity fields as-is, a
/// single download action at `urls` keeping the origin action's header and
/// expiry.
pub fn stored_descriptor(object: &BatchObject, urls: ObjectUrls) -> BatchObject {
    let origin = object.download();
    let action = ObjectAction {
        href: urls.href,
        head_href: Some(urls.head_href),
        header: origin.map(|a| a.header.clone()).unwrap_or_default(),
        expires_in: origin.and_then(|a| a.expires_in),
        expires_at: origin.and_then(|a| a.expires_at),
    };

    BatchObject {
        oid: object.oid.clone(),
        size: object.size,
        authenticated: object.authenticated,
        actions: BTreeMap::from([(DOWNLOAD_ACTION.to_string(), action)]),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use bytes::Bytes;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::metrics::BackfillLabels;
    use crate::testing::*;

    fn body() -> BodyStream {
        let chunks: Vec<anyhow::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"large file ")),
            Ok(Bytes::from_static(b"contents")),
        ];
        Box::pin(tokio_stream::iter(chunks))
    }

    fn backfills(h: &Harness, outcome: BackfillOutcome) -> u64 {
        h.metrics
            .metrics
            .backfill_total
            .get_or_create(&BackfillLabels { outcome })
            .get()
    }

    #[tokio::test]
    async fn uploads_and_caches_store_descriptor() {
        let h = Harness::new();
        let mut object = download_object("1234");
        object.actions.insert(
            "upload".to_string(),
            ObjectAction {
                href: "https://origin.test/upload".into(),
                ..Default::default()
            },
        );

        run_backfill(h.ctx(), object.clone(), body()).await;

        assert_eq!(h.store.stored("1234").unwrap(), OBJECT_BYTES);
        let cached = h.cache.object("1234").unwrap();
        assert_eq!(cached.oid, "1234");
        assert_eq!(cached.size, object.size);
        assert_eq!(cached.authenticated, object.authenticated);
        assert_eq!(cached.actions.len(), 1);
        let action = cached.download().unwrap();
        assert_eq!(action.href, store_href("1234"));
        assert_eq!(action.head_href.as_deref(), Some(store_head_href("1234").as_str()));
        assert_eq!(action.header, object.download().unwrap().header);
        assert_eq!(action.expires_in, Some(3600));
        assert_eq!(backfills(&h, BackfillOutcome::Cached), 1);
    }

    #[tokio::test]
    async fn upload_failure_leaves_cache_alone() {
        let h = Harness::new();
        h.store.fail_upload.store(true, Ordering::SeqCst);

        run_backfill(h.ctx(), download_object("1234"), body()).await;

        assert!(h.store.stored("1234").is_none());
        assert!(!h.cache.contains("1234"));
        assert_eq!(backfills(&h, BackfillOutcome::Failed), 1);
    }

    #[tokio::test]
    async fn url_failure_after_upload_keeps_stored_object() {
        let h = Harness::new();
        h.store.fail_urls.store(true, Ordering::SeqCst);

        run_backfill(h.ctx(), download_object("1234"), body()).await;

        assert!(h.store.stored("1234").is_some());
        assert!(!h.cache.contains("1234"));
        assert_eq!(backfills(&h, BackfillOutcome::Uploaded), 1);
    }

    #[tokio::test]
    async fn overwrites_existing_entry() {
        let h = Harness::new();
        let mut stale = cached_object("1234");
        if let Some(action) = stale.actions.get_mut(DOWNLOAD_ACTION) {
            action.href = "https://store.test/expired".into();
        }
        h.cache.insert_object(&stale);

        run_backfill(h.ctx(), download_object("1234"), body()).await;

        assert_eq!(h.cache.len(), 1);
        assert_eq!(
            h.cache.object("1234").unwrap().download().unwrap().href,
            store_href("1234")
        );
    }

    #[test]
    fn stored_descriptor_copies_absolute_expiry() {
        let expires_at = Utc.with_ymd_and_hms(2016, 11, 10, 15, 29, 7).unwrap();
        let mut object = download_object("abc");
        if let Some(action) = object.actions.get_mut(DOWNLOAD_ACTION) {
            action.expires_in = None;
            action.expires_at = Some(expires_at);
        }
        object.error = None;

        let stored = stored_descriptor(
            &object,
            ObjectUrls {
                href: "https://s/abc".into(),
                head_href: "https://s/abc?head".into(),
            },
        );
        let action = stored.download().unwrap();
        assert_eq!(action.expires_at, Some(expires_at));
        assert_eq!(action.expires_in, None);
        assert_eq!(action.href, "https://s/abc");
    }
}
