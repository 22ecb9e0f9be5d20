//! Re-validation of cached pre-signed links.
//!
//! A cache hit is served immediately; this probe runs afterwards and evicts
//! the entry when its probe URL no longer answers, so the next request for
//! the object goes back to the origin.

use tracing::{debug, info, instrument};

use super::LfsContext;

/// Probe `head_href` and evict `oid` from the cache unless the probe
/// succeeds.  A probe that fails to complete counts as invalid.
#[instrument(skip(ctx, head_href))]
pub async fn validate_cached_link(ctx: LfsContext, oid: String, head_href: String) {
    let valid = match ctx.links.probe(&head_href).await {
        Err(err) => {
            info!(error = ?err, "cached link probe failed, evicting");
            false
        }
        Ok(status) if status.is_success() => true,
        Ok(status) => {
            info!(%status, "cached link expired, evicting");
            false
        }
    };

    if valid {
        debug!("cached link still valid");
    } else {
        ctx.cache.delete(&oid);
        ctx.metrics.cached_link_evictions.inc();
    }
}
