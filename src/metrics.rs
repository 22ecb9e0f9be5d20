use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackfillLabels {
    pub outcome: BackfillOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum BackfillOutcome {
    /// Uploaded and the cache entry refreshed.
    Cached,
    /// Uploaded but the cache could not be refreshed.
    Uploaded,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskLabels {
    pub task: TaskKind,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum TaskKind {
    Backfill,
    Validation,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- descriptor cache --
    pub cache_hits: Counter,
    pub cache_misses: Counter,

    // -- object store --
    pub s3_hits: Counter,
    pub s3_misses: Counter,

    // -- background work --
    pub backfill_total: Family<BackfillLabels, Counter>,
    pub cached_link_evictions: Counter,
    pub background_tasks_dropped: Family<TaskLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_hits = Counter::default();
        registry.register(
            "lfsproxy_cache_hit",
            "In-memory cache hits",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        registry.register(
            "lfsproxy_cache_miss",
            "In-memory cache misses",
            cache_misses.clone(),
        );

        let s3_hits = Counter::default();
        registry.register("lfsproxy_s3_hit", "S3 cache hits", s3_hits.clone());

        let s3_misses = Counter::default();
        registry.register("lfsproxy_s3_miss", "S3 cache misses", s3_misses.clone());

        let backfill_total = Family::<BackfillLabels, Counter>::default();
        registry.register(
            "lfsproxy_backfill",
            "S3 backfill attempts by outcome",
            backfill_total.clone(),
        );

        let cached_link_evictions = Counter::default();
        registry.register(
            "lfsproxy_cached_link_evictions",
            "Cache entries evicted after a failed link probe",
            cached_link_evictions.clone(),
        );

        let background_tasks_dropped = Family::<TaskLabels, Counter>::default();
        registry.register(
            "lfsproxy_background_tasks_dropped",
            "Background tasks not started because the task set was full or closed",
            background_tasks_dropped.clone(),
        );

        Self {
            cache_hits,
            cache_misses,
            s3_hits,
            s3_misses,
            backfill_total,
            cached_link_evictions,
            background_tasks_dropped,
        }
    }

    pub fn record_backfill(&self, outcome: BackfillOutcome) {
        self.backfill_total
            .get_or_create(&BackfillLabels { outcome })
            .inc();
    }

    pub fn record_dropped_task(&self, task: TaskKind) {
        self.background_tasks_dropped
            .get_or_create(&TaskLabels { task })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}
